//! Turning recorded histories into compiled loops and bridges.
//!
//! Every entry point here follows the same shape: build a [`CompileData`],
//! run the optimizer, stitch the optimized pieces into a [`Trace`], submit it
//! to the backend, then [`record_loop_or_bridge`]. An optimizer rejection is
//! not an error: the attempt is dropped and the caller keeps interpreting.
//! Units allocated for an attempt that does not reach the backend are
//! released again.

use std::iter;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::JitError;
use crate::ir::{
    Arg, Descr, ForwardingTable, GcRef, History, InputArg, OpCode, Operation, Trace, Type, ValueAllocator, Var,
    format_ops,
};
use crate::jit::compile_data::{CompileData, optimize_trace};
use crate::jit::context::JitContext;
use crate::jit::done::FinalDescr;
use crate::jit::driver::{GreenKey, JitDriver, Optimization, OptimizerConfig};
use crate::jit::guard::{ResumeFromInterpDescr, ResumeGuardDescr};
use crate::jit::optimizer::{CallPureResults, ExportedState};
use crate::jit::token::{CompiledLoopToken, TargetToken, UnitHandle};

/// State of one tracing run, shared by the compile calls it makes.
#[derive(Debug)]
pub struct TraceSession {
    pub driver: Rc<JitDriver>,
    pub history: History,
    pub call_pure_results: CallPureResults,
    /// Loop that contains the guard this session traces from.
    pub resumekey_original_loop_token: Option<UnitHandle>,
    partial: Option<(Trace, ExportedState)>,
}

impl TraceSession {
    pub fn new(driver: Rc<JitDriver>, history: History) -> Self {
        TraceSession {
            driver,
            history,
            call_pure_results: CallPureResults::new(),
            resumekey_original_loop_token: None,
            partial: None,
        }
    }

    /// Session tracing a bridge from the guard `key`.
    pub fn for_guard(driver: Rc<JitDriver>, history: History, key: &ResumeGuardDescr) -> Self {
        TraceSession {
            resumekey_original_loop_token: key.rd_loop_token(),
            ..TraceSession::new(driver, history)
        }
    }

    /// Keep a bridge that found no entry point until the loop it leads to
    /// has been traced as well.
    pub fn retrace_needed(&mut self, trace: Trace, state: ExportedState) {
        self.partial = Some((trace, state));
    }

    pub fn has_partial_trace(&self) -> bool {
        self.partial.is_some()
    }

    pub fn take_partial_trace(&mut self) -> Option<(Trace, ExportedState)> {
        self.partial.take()
    }
}

/// Where a bridge is attached.
#[derive(Debug, Clone)]
pub enum ResumeKey {
    Guard(Rc<ResumeGuardDescr>),
    FromInterp(ResumeFromInterpDescr),
}

impl ResumeKey {
    /// Bridges from `guard_future_condition` must enter the loop through
    /// its preamble.
    pub fn inline_short_preamble(&self) -> bool {
        match self {
            ResumeKey::Guard(descr) => descr.guard_opnum() != OpCode::GuardFutureCondition,
            ResumeKey::FromInterp(_) => true,
        }
    }

    fn compile_and_attach(&self, jit: &mut JitContext, session: &TraceSession, trace: &mut Trace) -> Result<(), JitError> {
        match self {
            ResumeKey::Guard(descr) => descr.compile_and_attach(jit, session, trace),
            ResumeKey::FromInterp(descr) => {
                descr.compile_and_attach(jit, session, trace, &session.history.inputargs)?;
                Ok(())
            }
        }
    }
}

fn vars_of(inputargs: &[InputArg]) -> Vec<Var> {
    inputargs.iter().map(|a| a.var).collect()
}

fn types_of(vars: &[Var]) -> Vec<Type> {
    vars.iter().map(|v| v.ty).collect()
}

/// Compile the history from `start` as a loop without unrolling.
#[allow(clippy::too_many_arguments)]
pub fn compile_simple_loop(
    jit: &mut JitContext,
    session: &mut TraceSession,
    greenkey: &GreenKey,
    inputargs: &[InputArg],
    mut ops: Vec<Operation>,
    jumpargs: &[Arg],
    enable_opts: OptimizerConfig,
) -> Result<Option<Rc<TargetToken>>, JitError> {
    let driver = Rc::clone(&session.driver);
    let unit = jit.registry.make_unit(driver.id);
    let label = Operation::label(&vars_of(inputargs), Descr::Cell(unit));
    ops.push(Operation::jump(jumpargs.to_vec(), Descr::Cell(unit)));
    let mut data = CompileData::simple(label, ops, Some(session.call_pure_results.clone()), enable_opts);
    let (info, mut ops) = match optimize_trace(jit, &driver, &mut data, &mut session.history.values) {
        Ok(result) => result,
        Err(err) => {
            debug!(target: "jit-compile", %greenkey, %err, "simple loop abandoned");
            jit.registry.release(unit);
            return Ok(None);
        }
    };

    let target = TargetToken::with_original(unit, types_of(&info.inputargs));
    match ops.last_mut() {
        Some(jump) if jump.opcode == OpCode::Jump => jump.descr = Some(Descr::Target(Rc::clone(&target))),
        _ => unreachable!("simple loop lost its closing jump"),
    }
    let mut trace = Trace::new(jit.stats.name_for_new_loop(), session.history.values.clone());
    trace.original_token = Some(unit);
    trace.operations = iter::once(Operation::label(&info.inputargs, Descr::Target(Rc::clone(&target))))
        .chain(ops)
        .collect();
    trace.inputargs = info.inputargs;
    trace.quasi_immutable_deps = info.quasi_immutable_deps;
    if let Some(token) = jit.registry.get_mut(unit) {
        token.target_tokens = vec![Rc::clone(&target)];
    }
    submit_new_loop(jit, greenkey, &driver, &mut trace, inputargs, unit)?;
    Ok(Some(target))
}

/// Compile the history from `start` as a loop closing back on `inputargs`.
///
/// With unrolling enabled the loop is peeled once: the preamble runs the
/// first iteration and falls into the optimized loop body. Returns the
/// entry point of the new unit, or `None` if the optimizer gave up.
///
/// `full_preamble_needed` is accepted for callers that distinguish it; the
/// preamble is always emitted.
#[allow(clippy::too_many_arguments)]
pub fn compile_loop(
    jit: &mut JitContext,
    session: &mut TraceSession,
    greenkey: &GreenKey,
    start: usize,
    inputargs: &[InputArg],
    jumpargs: &[Arg],
    full_preamble_needed: bool,
    try_disabling_unroll: bool,
) -> Result<Option<Rc<TargetToken>>, JitError> {
    let driver = Rc::clone(&session.driver);
    let mut enable_opts = driver.enable_opts();
    if try_disabling_unroll {
        if !enable_opts.contains(Optimization::Unroll) {
            return Ok(None);
        }
        enable_opts.remove(Optimization::Unroll);
    }

    let ops = session.history.operations.get(start..).map(<[_]>::to_vec).unwrap_or_default();
    if !enable_opts.contains(Optimization::Unroll) {
        return compile_simple_loop(jit, session, greenkey, inputargs, ops, jumpargs, enable_opts);
    }
    debug!(target: "jit-compile", %greenkey, start, full_preamble_needed, "compiling unrolled loop");

    let unit = jit.registry.make_unit(driver.id);
    let input_vars = vars_of(inputargs);
    let start_label = Operation::label(&input_vars, Descr::Cell(unit));
    let end_label = Operation::new(OpCode::Label, jumpargs.to_vec()).with_descr(Descr::Cell(unit));
    let mut preamble_data = CompileData::loop_with_preamble(
        start_label.clone(),
        end_label,
        ops.clone(),
        Some(session.call_pure_results.clone()),
        enable_opts.clone(),
    );
    let (preamble_info, preamble_ops) = match optimize_trace(jit, &driver, &mut preamble_data, &mut session.history.values) {
        Ok(result) => result,
        Err(err) => {
            debug!(target: "jit-compile", %greenkey, %err, "preamble abandoned");
            jit.registry.release(unit);
            return Ok(None);
        }
    };
    let Some(start_state) = preamble_info.state else {
        unreachable!("preamble pass exported no state");
    };

    let end_jump = Operation::jump(jumpargs.to_vec(), Descr::Cell(unit));
    let mut loop_data = CompileData::unrolled(
        start_label,
        end_jump,
        ops,
        start_state.clone(),
        Some(session.call_pure_results.clone()),
        enable_opts,
    );
    let (loop_info, loop_ops) = match optimize_trace(jit, &driver, &mut loop_data, &mut session.history.values) {
        Ok(result) => result,
        Err(err) => {
            debug!(target: "jit-compile", %greenkey, %err, "peeled loop abandoned");
            jit.registry.release(unit);
            return Ok(None);
        }
    };
    let Some(label_op) = loop_info.label_op else {
        unreachable!("peeled loop has no header label");
    };
    let Some(loop_target) = label_op.descr.as_ref().and_then(Descr::as_target).cloned() else {
        unreachable!("loop header label without an entry point");
    };

    let renamed = start_state.renamed_inputargs;
    let start_descr = TargetToken::with_original(unit, types_of(&renamed));
    let mut trace = Trace::new(jit.stats.name_for_new_loop(), session.history.values.clone());
    trace.original_token = Some(unit);
    trace.quasi_immutable_deps = start_state.quasi_immutable_deps;
    trace.quasi_immutable_deps.extend(loop_info.quasi_immutable_deps);
    trace.operations = iter::once(Operation::label(&renamed, Descr::Target(Rc::clone(&start_descr))))
        .chain(preamble_ops)
        .chain(loop_info.extra_same_as)
        .chain(iter::once(label_op))
        .chain(loop_ops)
        .collect();
    trace.inputargs = renamed;
    if let Some(token) = jit.registry.get_mut(unit) {
        token.target_tokens.insert(0, Rc::clone(&start_descr));
        token.target_tokens.push(loop_target);
    }
    submit_new_loop(jit, greenkey, &driver, &mut trace, inputargs, unit)?;
    Ok(Some(start_descr))
}

fn submit_new_loop(
    jit: &mut JitContext,
    greenkey: &GreenKey,
    driver: &JitDriver,
    trace: &mut Trace,
    orig_inputargs: &[InputArg],
    unit: UnitHandle,
) -> Result<(), JitError> {
    propagate_original_jitcell_token(trace);
    if let Err(err) = send_loop_to_backend(jit, Some(greenkey), driver, trace, "loop", orig_inputargs) {
        jit.registry.release(unit);
        return Err(err);
    }
    driver
        .warmstate
        .borrow_mut()
        .attach_procedure_to_interp(greenkey.clone(), unit);
    record_loop_or_bridge(jit, trace);
    Ok(())
}

/// Finish a bridge whose first optimization found no entry point.
///
/// The history from `start` is the loop the bridge leads into, closed by a
/// jump with `jumpargs` back to the procedure of `greenkey`. It is peeled
/// with the partial trace's exported state and appended to the partial
/// trace, which is then attached through `resumekey`.
#[allow(clippy::too_many_arguments)]
pub fn compile_retrace(
    jit: &mut JitContext,
    session: &mut TraceSession,
    greenkey: &GreenKey,
    start: usize,
    inputargs: &[Var],
    jumpargs: &[Arg],
    resumekey: &ResumeKey,
) -> Result<Option<Rc<TargetToken>>, JitError> {
    let driver = Rc::clone(&session.driver);
    let loop_token = driver
        .warmstate
        .borrow()
        .get_procedure_token(greenkey)
        .filter(|h| jit.registry.is_alive(*h))
        .ok_or(JitError::NoProcedureToken)?;
    let Some((mut partial, state)) = session.take_partial_trace() else {
        warn!(target: "jit-compile", %greenkey, "retrace requested without a partial trace");
        return Ok(None);
    };
    let enable_opts = driver.enable_opts();
    if !enable_opts.contains(Optimization::Unroll) {
        return Ok(None);
    }

    let start_label = Operation::label(inputargs, Descr::Cell(loop_token));
    let end_jump = Operation::jump(jumpargs.to_vec(), Descr::Cell(loop_token));
    let ops = session.history.operations.get(start..).map(<[_]>::to_vec).unwrap_or_default();
    let mut data = CompileData::unrolled(
        start_label,
        end_jump,
        ops,
        state.clone(),
        Some(session.call_pure_results.clone()),
        enable_opts,
    );
    let (loop_info, loop_ops) = match optimize_trace(jit, &driver, &mut data, &mut session.history.values) {
        Ok(result) => result,
        Err(err) => {
            debug!(target: "jit-compile", %greenkey, %err, "retrace abandoned");
            return Ok(None);
        }
    };
    let Some(label_op) = loop_info.label_op else {
        unreachable!("retraced loop has no header label");
    };
    let Some(target) = label_op.descr.as_ref().and_then(Descr::as_target).cloned() else {
        unreachable!("loop header label without an entry point");
    };

    partial.original_token = Some(loop_token);
    partial.operations.extend(loop_info.extra_same_as);
    partial.operations.push(label_op);
    partial.operations.extend(loop_ops);
    partial.quasi_immutable_deps.extend(loop_info.quasi_immutable_deps);
    partial.quasi_immutable_deps.extend(state.quasi_immutable_deps);
    partial.values = session.history.values.clone();

    resumekey.compile_and_attach(jit, session, &mut partial)?;
    if let Some(token) = jit.registry.get_mut(loop_token) {
        token.target_tokens.push(Rc::clone(&target));
    }
    record_loop_or_bridge(jit, &mut partial);
    Ok(Some(target))
}

/// Compile the session's history as a bridge attached to `resumekey`.
///
/// Returns the descriptor of the bridge's last operation: the entry point it
/// jumps to, or the final descriptor of its `finish`. `None` means nothing
/// was compiled, either because the optimizer gave up or because the loop
/// the bridge leads into must be retraced first.
///
/// A retrace is only requested with unrolling enabled. Without it a bridge
/// that fits no entry point of its loop returns `None` and leaves no partial
/// trace on the session.
pub fn compile_trace(
    jit: &mut JitContext,
    session: &mut TraceSession,
    resumekey: &ResumeKey,
) -> Result<Option<Descr>, JitError> {
    let driver = Rc::clone(&session.driver);
    let inputargs = session.history.input_vars();
    let label = Operation::new(OpCode::Label, inputargs.iter().copied().map(Arg::Var).collect());
    let enable_opts = driver.enable_opts();
    let call_pure_results = Some(session.call_pure_results.clone());
    let operations = session.history.operations.clone();
    let mut data = if session.history.ends_with_jump() {
        CompileData::bridge(
            label,
            operations,
            call_pure_results,
            enable_opts.clone(),
            resumekey.inline_short_preamble(),
        )
    } else {
        CompileData::simple(label, operations, call_pure_results, enable_opts.clone())
    };
    let (info, newops) = match optimize_trace(jit, &driver, &mut data, &mut session.history.values) {
        Ok(result) => result,
        Err(err) => {
            debug!(target: "jit-compile", %err, "bridge abandoned");
            return Ok(None);
        }
    };

    let mut new_trace = Trace::new(jit.stats.name_for_new_loop(), session.history.values.clone());
    new_trace.operations = newops;
    new_trace.quasi_immutable_deps = info.quasi_immutable_deps.clone();
    if info.is_final() {
        new_trace.inputargs = info.inputargs;
        let target = new_trace.operations.last().and_then(|op| op.descr.clone());
        resumekey.compile_and_attach(jit, session, &mut new_trace)?;
        record_loop_or_bridge(jit, &mut new_trace);
        return Ok(target);
    }
    if !enable_opts.contains(Optimization::Unroll) {
        debug!(target: "jit-compile", "bridge has no entry point and unrolling is off");
        return Ok(None);
    }
    new_trace.inputargs = info.renamed_inputargs;
    let state = info.state.unwrap_or_default();
    jit.stats.retraces_requested += 1;
    debug!(target: "jit-compile", name = %new_trace.name, "bridge needs a retrace");
    session.retrace_needed(new_trace, state);
    Ok(None)
}

/// Submit a new loop for the trace's unit.
///
/// Clears the trace's scratch replacements, loads virtualizable fields in an
/// explicit prologue, numbers the unit and keeps it alive.
pub fn send_loop_to_backend(
    jit: &mut JitContext,
    greenkey: Option<&GreenKey>,
    driver: &JitDriver,
    trace: &mut Trace,
    kind: &str,
    orig_inputargs: &[InputArg],
) -> Result<(), JitError> {
    trace.forget_optimization_info();
    if driver.virtualizable.is_some() {
        let vable = orig_inputargs
            .get(driver.index_of_virtualizable)
            .and_then(|a| a.value.as_ref())
            .unwrap_or(GcRef::NULL);
        patch_new_loop_to_load_virtualizable_fields(trace, driver, vable);
    }

    let token = trace
        .original_token
        .filter(|h| jit.registry.is_alive(*h))
        .ok_or(JitError::MissingOriginalToken)?;
    let number = jit.numbering.next();
    if let Some(unit) = jit.registry.get_mut(token) {
        unit.number = Some(number);
    }
    trace.number = Some(number);

    if cfg!(debug_assertions)
        && let Err(err) = trace.check_consistency()
    {
        panic!("{kind} {} is inconsistent: {err}", trace.name);
    }

    let loopname = match greenkey {
        Some(key) => format!("{} {key}", driver.name),
        None => driver.name.clone(),
    };
    debug!(
        target: "jit-backend",
        "compiling {kind} #{number} {loopname}\n{}",
        format_ops(&trace.inputargs, &trace.operations)
    );
    let started = Instant::now();
    let asm = jit
        .backend
        .compile_loop(driver.id, &trace.inputargs, &trace.operations, token, &loopname);
    jit.stats.add_backend_time(started.elapsed());
    let asm = asm?;

    if let Some(unit) = jit.registry.get_mut(token) {
        unit.compiled = Some(CompiledLoopToken {
            code_addr: asm.code_addr,
            code_size: asm.code_size,
        });
    }
    jit.stats.add_new_loop(&trace.name);
    info!(target: "jit-compile", number, name = %trace.name, "compiled new {kind}");
    jit.memmgr.keep_loop_alive(&mut jit.registry, token);
    Ok(())
}

/// Submit a bridge leaving `faildescr`'s guard in the code of `original`.
pub fn send_bridge_to_backend(
    jit: &mut JitContext,
    driver: &JitDriver,
    faildescr: &Rc<ResumeGuardDescr>,
    trace: &mut Trace,
    original: UnitHandle,
) -> Result<(), JitError> {
    trace.forget_optimization_info();
    if cfg!(debug_assertions) {
        let seen = trace.inputargs.iter().map(|v| v.id).collect();
        if let Err(err) = Trace::check_consistency_of_branch(&trace.operations, seen) {
            panic!("bridge {} is inconsistent: {err}", trace.name);
        }
    }
    debug!(
        target: "jit-backend",
        "compiling bridge from {} of Loop{}\n{}",
        faildescr.guard_opnum(),
        original.index(),
        format_ops(&trace.inputargs, &trace.operations)
    );
    let started = Instant::now();
    let asm = jit
        .backend
        .compile_bridge(faildescr, &trace.inputargs, &trace.operations, original);
    jit.stats.add_backend_time(started.elapsed());
    let asm = asm?;
    jit.stats.bridges_compiled += 1;
    info!(
        target: "jit-compile",
        driver = %driver.name,
        guard = %faildescr.guard_opnum(),
        code_addr = asm.code_addr,
        "compiled new bridge"
    );
    Ok(())
}

/// Post-submission bookkeeping: link guards to their unit, record jumps to
/// other units, register quasi-immutable dependencies, and detach the trace.
pub fn record_loop_or_bridge(jit: &mut JitContext, trace: &mut Trace) {
    let Some(original) = trace.original_token.take() else {
        unreachable!("recording a trace that was never attached to a unit");
    };

    for op in trace.operations.iter_mut() {
        let clear = match &op.descr {
            Some(Descr::Guard(descr)) => {
                descr.set_rd_loop_token(original);
                false
            }
            // call_assembler or an unresolved jump
            Some(Descr::Cell(target)) => {
                if *target != original {
                    jit.registry.record_jump_target(original, *target);
                }
                true
            }
            Some(Descr::Target(target)) => {
                if let Some(owner) = target.original.get()
                    && owner != original
                {
                    jit.registry.record_jump_target(original, owner);
                }
                true
            }
            _ => false,
        };
        if clear {
            op.clear_descr();
        }
    }
    for field in &trace.quasi_immutable_deps {
        jit.quasi_immut.register_loop_token(*field, original);
    }
    trace.number = jit.registry.get(original).and_then(|t| t.number);
}

/// Append `op` to `ops` with its arguments resolved through `forwarding`.
pub fn emit_op(ops: &mut Vec<Operation>, forwarding: &ForwardingTable, mut op: Operation) {
    forwarding.apply(&mut op);
    ops.push(op);
}

/// Replace the virtualizable's field inputs of a new loop by loads from the
/// virtualizable object itself.
///
/// After the patch the loop takes only the red arguments; static fields
/// become `getfield_gc`, array items `getarrayitem_gc` on the loaded array.
pub fn patch_new_loop_to_load_virtualizable_fields(trace: &mut Trace, driver: &JitDriver, vable: GcRef) {
    let Some(vinfo) = &driver.virtualizable else {
        return;
    };
    let inputargs = std::mem::take(&mut trace.inputargs);
    let vable_var = inputargs[driver.index_of_virtualizable];
    let mut i = driver.num_red_args;
    trace.inputargs = inputargs[..i].to_vec();

    let mut extra_ops = Vec::new();
    for descr in &vinfo.static_field_descrs {
        let field_var = inputargs[i];
        let loaded = trace.values.fresh(field_var.ty);
        let load = Operation::new(OpCode::GetfieldGc, vec![vable_var.into()])
            .with_result(loaded)
            .with_descr(Descr::Field(descr.clone()));
        emit_op(&mut extra_ops, &trace.forwarding, load);
        trace.forwarding.forward(field_var, Arg::Var(loaded));
        i += 1;
    }
    for (arrayindex, descr) in vinfo.array_field_descrs.iter().enumerate() {
        let arraylen = vinfo.get_array_length(vable, arrayindex);
        let array = trace.values.fresh(Type::Ref);
        let load_array = Operation::new(OpCode::GetfieldGc, vec![vable_var.into()])
            .with_result(array)
            .with_descr(Descr::Field(descr.clone()));
        emit_op(&mut extra_ops, &trace.forwarding, load_array);
        let arraydescr = vinfo.array_descrs[arrayindex];
        debug_assert!(i + arraylen <= inputargs.len());
        for index in 0..arraylen {
            let item_var = inputargs[i];
            let loaded = trace.values.fresh(item_var.ty);
            let load = Operation::new(OpCode::GetarrayitemGc, vec![array.into(), Arg::int(index as i64)])
                .with_result(loaded)
                .with_descr(Descr::Array(arraydescr));
            emit_op(&mut extra_ops, &trace.forwarding, load);
            trace.forwarding.forward(item_var, Arg::Var(loaded));
            i += 1;
        }
    }
    debug_assert_eq!(i, inputargs.len());

    for op in std::mem::take(&mut trace.operations) {
        emit_op(&mut extra_ops, &trace.forwarding, op);
    }
    trace.operations = extra_ops;
    trace.forget_optimization_info();
}

/// Point every label's entry point at the trace's unit.
pub fn propagate_original_jitcell_token(trace: &Trace) {
    for op in &trace.operations {
        if op.opcode == OpCode::Label
            && let Some(Descr::Target(target)) = &op.descr
        {
            target.original.set(trace.original_token);
        }
    }
}

/// Build a unit that only calls back into the interpreter's portal.
///
/// Used while no compiled version of the callee exists yet.
pub fn compile_tmp_callback(
    jit: &mut JitContext,
    driver: &JitDriver,
    greens: &[Arg],
    red_types: &[Type],
) -> Result<UnitHandle, JitError> {
    debug_assert_eq!(red_types.len(), driver.num_red_args);
    debug_assert!(!red_types.contains(&Type::Void));
    let unit = jit.registry.make_unit(driver.id);
    let mut values = ValueAllocator::new();
    let inputargs: Vec<Var> = red_types.iter().map(|ty| values.fresh(*ty)).collect();

    let mut callargs = vec![Arg::int(driver.portal_runner_adr)];
    callargs.extend_from_slice(greens);
    callargs.extend(inputargs.iter().copied().map(Arg::Var));
    let mut call = Operation::new(OpCode::Call, callargs).with_descr(Descr::Call(driver.portal_calldescr.clone()));
    let mut finishargs = Vec::new();
    if driver.portal_calldescr.result != Type::Void {
        let result = values.fresh(driver.portal_calldescr.result);
        call.result = Some(result);
        finishargs.push(Arg::Var(result));
    }
    let operations = vec![
        call,
        Operation::new(OpCode::GuardNoException, Vec::new())
            .with_descr(Descr::Final(FinalDescr::PropagateException))
            .with_fail_args(Vec::new()),
        Operation::new(OpCode::Finish, finishargs).with_descr(Descr::Final(driver.done_descr())),
    ];

    let asm = match jit
        .backend
        .compile_loop(driver.id, &inputargs, &operations, unit, "tmp callback")
    {
        Ok(asm) => asm,
        Err(err) => {
            jit.registry.release(unit);
            return Err(err.into());
        }
    };
    if let Some(token) = jit.registry.get_mut(unit) {
        token.compiled = Some(CompiledLoopToken {
            code_addr: asm.code_addr,
            code_size: asm.code_size,
        });
    }
    jit.memmgr.keep_loop_alive(&mut jit.registry, unit);
    debug!(target: "jit-compile", driver = %driver.name, unit = unit.index(), "compiled tmp callback");
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::ir::{ArrayDescr, FieldDescr, QuasiImmutId, Value};
    use crate::jit::driver::{FixedLayout, VirtualizableInfo, WarmState};
    use crate::jit::guard::invent_fail_descr_for_op;
    use crate::jit::testing::{recording_context, test_driver};
    use crate::jit::DriverId;

    fn driver_with(opts: OptimizerConfig) -> Rc<JitDriver> {
        Rc::new(test_driver(3).with_warmstate(WarmState::new(opts, 3)))
    }

    /// `i1 = int_add(i0, 1)`, closing back with `jump(i1)`.
    fn counting_loop(driver: &Rc<JitDriver>) -> (TraceSession, Vec<InputArg>, Vec<Arg>) {
        let mut history = History::new();
        let i0 = history.add_input(Value::Int(0));
        let i1 = history.record(OpCode::IntAdd, vec![i0.into(), Arg::int(1)], Type::Int).unwrap();
        let inputargs = history.inputargs.clone();
        (TraceSession::new(Rc::clone(driver), history), inputargs, vec![i1.into()])
    }

    #[test]
    fn test_simple_loop_compiles_with_one_entry() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all().without(Optimization::Unroll));
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        let key = GreenKey(vec![7]);

        let target = compile_loop(&mut jit, &mut session, &key, 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap();
        let unit = target.owner;
        assert_eq!(target.original.get(), Some(unit));
        let token = jit.registry.get(unit).unwrap();
        assert_eq!(token.target_tokens.len(), 1);
        assert_eq!(token.number, Some(0));
        assert!(token.compiled.is_some());
        assert!(token.generation > 0);
        assert_eq!(driver.warmstate.borrow().get_procedure_token(&key), Some(unit));

        let log = log.borrow();
        let compiled = log.loop_for(unit).unwrap();
        assert_eq!(compiled.inputargs.len(), 1);
        assert_eq!(compiled.operations.first().unwrap().opcode, OpCode::Label);
        let jump = compiled.operations.last().unwrap();
        assert!(Rc::ptr_eq(jump.descr.as_ref().and_then(Descr::as_target).unwrap(), &target));
        assert_eq!(jit.stats.loops_compiled, 1);
    }

    #[test]
    fn test_unrolled_loop_has_two_entries() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);

        let start = compile_loop(&mut jit, &mut session, &GreenKey(vec![1]), 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap();
        let unit = start.owner;
        let targets = &jit.registry.get(unit).unwrap().target_tokens;
        assert_eq!(targets.len(), 2);
        assert!(Rc::ptr_eq(&targets[0], &start));
        assert_eq!(targets[1].original.get(), Some(unit));

        let log = log.borrow();
        let ops = &log.loop_for(unit).unwrap().operations;
        let labels = ops.iter().filter(|op| op.opcode == OpCode::Label).count();
        assert_eq!(labels, 2);
        let jump = ops.last().unwrap();
        assert!(Rc::ptr_eq(jump.descr.as_ref().and_then(Descr::as_target).unwrap(), &targets[1]));
    }

    #[test]
    fn test_try_disabling_unroll_when_already_off() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::none());
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        let result = compile_loop(&mut jit, &mut session, &GreenKey::default(), 0, &inputargs, &jumpargs, true, true);
        assert!(result.unwrap().is_none());
        assert!(jit.registry.is_empty());
        assert_eq!(log.borrow().submissions(), 0);
    }

    #[test]
    fn test_invalid_loop_releases_unit() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        session.history.record_guard(OpCode::GuardFalse, vec![Arg::int(1)], &[]);
        let result = compile_loop(&mut jit, &mut session, &GreenKey::default(), 0, &inputargs, &jumpargs, true, false);
        assert!(result.unwrap().is_none());
        assert!(jit.registry.is_empty());
        assert_eq!(log.borrow().submissions(), 0);
        assert_eq!(jit.stats.invalid_loops, 1);
    }

    #[test]
    fn test_backend_rejection_releases_unit() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        log.borrow_mut().reject_next("out of code space");
        let result = compile_loop(&mut jit, &mut session, &GreenKey::default(), 0, &inputargs, &jumpargs, true, false);
        assert!(matches!(result, Err(JitError::Backend(_))));
        assert!(jit.registry.is_empty());
    }

    #[test]
    fn test_record_loop_or_bridge_links_and_clears() {
        let (mut jit, _) = recording_context();
        let this = jit.registry.make_unit(DriverId(0));
        let other = jit.registry.make_unit(DriverId(0));
        let guard = invent_fail_descr_for_op(OpCode::GuardTrue, &test_driver(3));
        let other_target = TargetToken::with_original(other, vec![Type::Int]);
        let own_target = TargetToken::with_original(this, vec![Type::Int]);
        let i0 = Var::int(0);
        let mut trace = Trace::new("t", ValueAllocator::starting_at(1));
        trace.original_token = Some(this);
        trace.inputargs = vec![i0];
        trace.quasi_immutable_deps = BTreeSet::from([QuasiImmutId(4)]);
        trace.operations = vec![
            Operation::label(&[i0], Descr::Target(own_target)),
            Operation::new(OpCode::GuardTrue, vec![i0.into()])
                .with_descr(Descr::Guard(Rc::clone(&guard)))
                .with_fail_args(vec![Some(i0)]),
            Operation::new(OpCode::CallAssembler, vec![i0.into()]).with_descr(Descr::Cell(other)),
            Operation::jump(vec![i0.into()], Descr::Target(other_target)),
        ];

        record_loop_or_bridge(&mut jit, &mut trace);
        assert_eq!(guard.rd_loop_token(), Some(this));
        assert_eq!(jit.registry.get(this).unwrap().jumps_to, vec![other]);
        assert!(trace.operations[0].descr.is_none());
        assert!(trace.operations[1].descr.is_some());
        assert!(trace.operations[2].descr.is_none());
        assert!(trace.operations[3].descr.is_none());
        assert_eq!(trace.original_token, None);
        assert_eq!(jit.quasi_immut.dependents(QuasiImmutId(4)), &[this]);
    }

    #[test]
    fn test_tmp_callback_propagates_exceptions() {
        let (mut jit, log) = recording_context();
        let driver = test_driver(3).with_portal(
            crate::ir::CallDescr {
                args: vec![Type::Int],
                result: Type::Int,
            },
            0x4000,
        );
        let unit = compile_tmp_callback(&mut jit, &driver, &[Arg::int(12)], &[Type::Int]).unwrap();
        let log = log.borrow();
        let ops = &log.loop_for(unit).unwrap().operations;
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].args[0], Arg::int(0x4000));
        assert_eq!(ops[0].args[1], Arg::int(12));
        assert!(matches!(ops[1].descr, Some(Descr::Final(FinalDescr::PropagateException))));
        assert_eq!(ops[1].fail_args(), &[]);
        assert!(matches!(ops[2].descr, Some(Descr::Final(FinalDescr::DoneInt))));
        assert_eq!(ops[2].args, vec![Arg::Var(ops[0].result.unwrap())]);
        assert!(jit.memmgr.is_kept_alive(unit));
    }

    #[test]
    fn test_virtualizable_fields_loaded_in_prologue() {
        let (mut jit, log) = recording_context();
        let vinfo = VirtualizableInfo {
            static_field_descrs: vec![FieldDescr::new("pc", Type::Int, 8)],
            array_field_descrs: vec![FieldDescr::new("locals", Type::Ref, 16)],
            array_descrs: vec![ArrayDescr { item_ty: Type::Int }],
            layout: Rc::new(FixedLayout(vec![2])),
        };
        let driver = Rc::new(
            JitDriver::new(DriverId(0), "vable", 1, Type::Void)
                .with_virtualizable(0, vinfo)
                .with_warmstate(WarmState::new(OptimizerConfig::none(), 3)),
        );
        let mut history = History::new();
        let frame = history.add_input(Value::Ref(GcRef(0x100)));
        let pc = history.add_input(Value::Int(0));
        let a = history.add_input(Value::Int(1));
        let b = history.add_input(Value::Int(2));
        let sum = history.record(OpCode::IntAdd, vec![a.into(), b.into()], Type::Int).unwrap();
        let inputargs = history.inputargs.clone();
        let mut session = TraceSession::new(Rc::clone(&driver), history);
        let jumpargs = vec![frame.into(), pc.into(), sum.into(), b.into()];
        let target = compile_loop(&mut jit, &mut session, &GreenKey::default(), 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap();

        let log = log.borrow();
        let compiled = log.loop_for(target.owner).unwrap();
        assert_eq!(compiled.inputargs, vec![frame]);
        let opcodes: Vec<OpCode> = compiled.operations.iter().take(4).map(|op| op.opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::GetfieldGc, OpCode::GetfieldGc, OpCode::GetarrayitemGc, OpCode::GetarrayitemGc]
        );
        // the label now carries the loaded values
        let label = &compiled.operations[4];
        assert_eq!(label.opcode, OpCode::Label);
        assert_eq!(label.args[0], Arg::Var(frame));
        assert_eq!(label.args[1], Arg::Var(compiled.operations[0].result.unwrap()));
    }

    #[test]
    fn test_numbering_is_shared() {
        let (mut jit, _) = recording_context();
        let driver = driver_with(OptimizerConfig::none());
        for expected in 0..3 {
            let (mut session, inputargs, jumpargs) = counting_loop(&driver);
            let target = compile_loop(&mut jit, &mut session, &GreenKey(vec![expected]), 0, &inputargs, &jumpargs, true, false)
                .unwrap()
                .unwrap();
            assert_eq!(jit.registry.get(target.owner).unwrap().number, Some(expected as u64));
        }
        assert_eq!(jit.numbering.peek(), 3);
    }

    #[test]
    fn test_retrace_adds_entry_for_new_types() {
        let (mut jit, _) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        let loop_key = GreenKey(vec![1]);
        let unit = compile_loop(&mut jit, &mut session, &loop_key, 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap()
            .owner;

        // enters the int loop with a ref: no entry point fits
        let mut history = History::new();
        let p0 = history.add_input(Value::Ref(GcRef(0x100)));
        history.record_op(Operation::jump(vec![p0.into()], Descr::Cell(unit)));
        let mut bridge = TraceSession::new(Rc::clone(&driver), history);
        let entry_key = GreenKey(vec![2]);
        let resumekey = ResumeKey::FromInterp(ResumeFromInterpDescr::new(entry_key.clone()));
        assert!(compile_trace(&mut jit, &mut bridge, &resumekey).unwrap().is_none());
        assert!(bridge.has_partial_trace());
        assert_eq!(jit.stats.retraces_requested, 1);

        let start = bridge.history.operations.len();
        let target = compile_retrace(&mut jit, &mut bridge, &loop_key, start, &[p0], &[p0.into()], &resumekey)
            .unwrap()
            .unwrap();
        assert_eq!(target.arg_types, vec![Type::Ref]);
        assert!(!bridge.has_partial_trace());
        assert_eq!(jit.registry.get(unit).unwrap().target_tokens.len(), 3);
        let entry = driver.warmstate.borrow().get_procedure_token(&entry_key).unwrap();
        assert_ne!(entry, unit);
        assert_eq!(jit.stats.entry_bridges, 1);
    }

    #[test]
    fn test_no_retrace_when_unrolling_is_off() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all().without(Optimization::Unroll));
        let (mut session, inputargs, jumpargs) = counting_loop(&driver);
        let unit = compile_loop(&mut jit, &mut session, &GreenKey(vec![1]), 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap()
            .owner;
        let before = log.borrow().submissions();

        let mut history = History::new();
        let p0 = history.add_input(Value::Ref(GcRef(0x100)));
        history.record_op(Operation::jump(vec![p0.into()], Descr::Cell(unit)));
        let mut bridge = TraceSession::new(Rc::clone(&driver), history);
        let resumekey = ResumeKey::FromInterp(ResumeFromInterpDescr::new(GreenKey(vec![2])));
        assert!(compile_trace(&mut jit, &mut bridge, &resumekey).unwrap().is_none());
        assert!(!bridge.has_partial_trace());
        assert_eq!(jit.stats.retraces_requested, 0);
        assert_eq!(log.borrow().submissions(), before);
    }

    #[test]
    fn test_retrace_without_procedure() {
        let (mut jit, _) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (mut session, _, jumpargs) = counting_loop(&driver);
        let resumekey = ResumeKey::FromInterp(ResumeFromInterpDescr::new(GreenKey(vec![2])));
        let err = compile_retrace(&mut jit, &mut session, &GreenKey(vec![9]), 0, &[], &jumpargs, &resumekey).unwrap_err();
        assert!(matches!(err, JitError::NoProcedureToken));
    }

    /// Guard of an already compiled unrolled loop, and that loop's unit.
    fn compiled_guard(jit: &mut JitContext, driver: &Rc<JitDriver>) -> (Rc<ResumeGuardDescr>, UnitHandle) {
        let (mut session, inputargs, jumpargs) = counting_loop(driver);
        let unit = compile_loop(jit, &mut session, &GreenKey(vec![1]), 0, &inputargs, &jumpargs, true, false)
            .unwrap()
            .unwrap()
            .owner;
        let descr = invent_fail_descr_for_op(OpCode::GuardTrue, driver);
        descr.set_rd_loop_token(unit);
        (descr, unit)
    }

    #[test]
    fn test_bridge_into_existing_unit() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (descr, unit) = compiled_guard(&mut jit, &driver);

        let mut history = History::new();
        let i0 = history.add_input(Value::Int(5));
        let i1 = history.record(OpCode::IntAdd, vec![i0.into(), Arg::int(2)], Type::Int).unwrap();
        history.record_op(Operation::jump(vec![i1.into()], Descr::Cell(unit)));
        let mut session = TraceSession::for_guard(Rc::clone(&driver), history, &descr);

        let resumekey = ResumeKey::Guard(Rc::clone(&descr));
        let target = compile_trace(&mut jit, &mut session, &resumekey).unwrap().unwrap();
        let target = target.as_target().unwrap();
        assert_eq!(target.owner, unit);
        assert!(!session.has_partial_trace());
        assert_eq!(jit.stats.bridges_compiled, 1);
        let log = log.borrow();
        assert_eq!(log.bridges.len(), 1);
        assert!(Rc::ptr_eq(&log.bridges[0].faildescr, &descr));
    }

    #[test]
    fn test_invalid_bridge_is_not_submitted() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (descr, unit) = compiled_guard(&mut jit, &driver);
        let before = log.borrow().submissions();

        let mut history = History::new();
        let i0 = history.add_input(Value::Int(5));
        history.record_op(Operation::new(OpCode::GuardTrue, vec![Arg::int(0)]));
        history.record_op(Operation::jump(vec![i0.into()], Descr::Cell(unit)));
        let mut session = TraceSession::for_guard(Rc::clone(&driver), history, &descr);

        let resumekey = ResumeKey::Guard(Rc::clone(&descr));
        assert!(compile_trace(&mut jit, &mut session, &resumekey).unwrap().is_none());
        assert_eq!(log.borrow().submissions(), before);
        assert_eq!(jit.stats.bridges_compiled, 0);
    }

    /// `i1 = int_add(<forwarded>, 1); finish(i1)` over input `i0`, with the
    /// forwarded value still pending in the trace's table.
    fn trace_with_pending_forward(driver: &JitDriver, forwarded: Var, to: Arg) -> (Trace, Var) {
        let mut values = ValueAllocator::new();
        let i0 = values.fresh(Type::Int);
        let i1 = values.fresh(Type::Int);
        let mut trace = Trace::new("pending", values);
        trace.inputargs = vec![i0];
        trace.operations = vec![
            Operation::new(OpCode::IntAdd, vec![forwarded.into(), Arg::int(1)]).with_result(i1),
            Operation::new(OpCode::Finish, vec![i1.into()]).with_descr(Descr::Final(driver.done_descr())),
        ];
        trace.forwarding.forward(forwarded, to);
        (trace, i0)
    }

    #[test]
    fn test_loop_submission_resolves_and_clears_forwarding() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let unit = jit.registry.make_unit(driver.id);
        let stale = Var::int(50);
        let (mut trace, i0) = trace_with_pending_forward(&driver, stale, Arg::Var(Var::int(0)));
        trace.original_token = Some(unit);

        send_loop_to_backend(&mut jit, None, &driver, &mut trace, "loop", &[]).unwrap();
        assert!(trace.forwarding.is_empty());
        let log = log.borrow();
        let submitted = &log.loop_for(unit).unwrap().operations;
        assert_eq!(submitted[0].args[0], Arg::Var(i0));
    }

    #[test]
    fn test_bridge_submission_resolves_and_clears_forwarding() {
        let (mut jit, log) = recording_context();
        let driver = driver_with(OptimizerConfig::all());
        let (descr, unit) = compiled_guard(&mut jit, &driver);
        let (mut trace, _) = trace_with_pending_forward(&driver, Var::int(50), Arg::int(3));

        send_bridge_to_backend(&mut jit, &driver, &descr, &mut trace, unit).unwrap();
        assert!(trace.forwarding.is_empty());
        let log = log.borrow();
        assert_eq!(log.bridges[0].operations[0].args[0], Arg::int(3));
        assert_eq!(jit.stats.bridges_compiled, 1);
    }
}
