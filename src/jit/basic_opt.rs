//! The default optimizer.
//!
//! A single forward pass over the trace: arguments are resolved through the
//! forwarding table, integer arithmetic on constants is folded, guards whose
//! outcome is known are dropped (or reject the trace), and every surviving
//! guard gets its own descriptor. Loops are peeled by running the pass a
//! second time with every result renamed.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::ir::{Arg, Descr, OpCode, Operation, QuasiImmutId, Type, Value, Var};
use crate::jit::driver::Optimization;
use crate::jit::guard::{ResumeGuardDescr, invent_fail_descr_for_op};
use crate::jit::optimizer::{CallPureKey, ExportedState, InvalidLoop, LoopInfo, OptContext, Optimizer};
use crate::jit::resume::Tagged;
use crate::jit::token::TargetToken;

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicOptimizer;

impl BasicOptimizer {
    pub fn new() -> Self {
        BasicOptimizer
    }
}

#[derive(Default)]
struct Pass {
    out: Vec<Operation>,
    deps: BTreeSet<QuasiImmutId>,
    not_invalidated: bool,
    /// Give every result a fresh id (second iteration of a peeled loop).
    rename: bool,
}

impl Pass {
    fn renaming() -> Self {
        Pass {
            rename: true,
            ..Self::default()
        }
    }

    /// Optimize `ops` up to the first `jump` or `finish`, which is returned
    /// with its arguments resolved but not emitted.
    fn run(&mut self, ctx: &mut OptContext<'_>, ops: &[Operation]) -> Result<Option<Operation>, InvalidLoop> {
        for op in ops {
            if op.opcode.is_final() {
                let mut last = op.clone();
                ctx.forwarding.apply(&mut last);
                return Ok(Some(last));
            }
            self.optimize_op(ctx, op)?;
        }
        Ok(None)
    }

    fn optimize_op(&mut self, ctx: &mut OptContext<'_>, recorded: &Operation) -> Result<(), InvalidLoop> {
        let mut op = recorded.clone();
        ctx.forwarding.apply(&mut op);
        match op.opcode {
            OpCode::SameAs => {
                if let Some(result) = op.result {
                    ctx.forwarding.forward(result, op.arg(0));
                }
                return Ok(());
            }
            OpCode::QuasiimmutField => {
                if let Some(Descr::QuasiImmut(id)) = op.descr {
                    self.deps.insert(id);
                }
                if self.not_invalidated {
                    return Ok(());
                }
                self.not_invalidated = true;
                op = Operation::new(OpCode::GuardNotInvalidated, Vec::new());
            }
            OpCode::GuardNotInvalidated => {
                if self.not_invalidated {
                    return Ok(());
                }
                self.not_invalidated = true;
            }
            OpCode::CallPure if ctx.enable_opts.contains(Optimization::Pure) => {
                if let Some(result) = op.result
                    && let Some(value) = lookup_pure(ctx, &op.args)
                {
                    ctx.forwarding.forward(result, Arg::Const(value));
                    return Ok(());
                }
            }
            opcode if opcode.is_foldable_int() && ctx.enable_opts.contains(Optimization::Rewrite) => {
                if let Some(result) = op.result
                    && let Some(value) = fold_int(opcode, &op.args)
                {
                    ctx.forwarding.forward(result, Arg::int(value));
                    return Ok(());
                }
            }
            opcode if opcode.is_guard() => match guard_outcome(&op) {
                Some(true) => return Ok(()),
                Some(false) => return Err(InvalidLoop::new(format!("{op} always fails"))),
                None => {}
            },
            _ => {}
        }

        if self.rename
            && let Some(result) = op.result
        {
            let fresh = ctx.fresh(result.ty);
            ctx.forwarding.forward(result, Arg::Var(fresh));
            op.result = Some(fresh);
        }
        if op.is_guard() {
            self.finish_guard(ctx, &mut op, recorded.fail_args());
        }
        let guarded = match (op.opcode, op.args.as_slice()) {
            (OpCode::GuardValue, [Arg::Var(var), constant @ Arg::Const(_)]) => Some((*var, *constant)),
            _ => None,
        };
        self.out.push(op);
        if let Some((var, constant)) = guarded {
            ctx.forwarding.forward(var, constant);
        }
        Ok(())
    }

    /// Give a surviving guard its descriptor, resume data and counter slot.
    fn finish_guard(&self, ctx: &mut OptContext<'_>, op: &mut Operation, recorded: &[Option<Var>]) {
        if matches!(op.descr, Some(Descr::Final(_))) {
            return;
        }
        let descr = match op.descr.as_ref().and_then(Descr::as_guard) {
            Some(existing) if !self.rename => Rc::clone(existing),
            Some(existing) => {
                let copy = Rc::new(ResumeGuardDescr::new(existing.guard_opnum(), existing.kind()));
                copy.copy_all_attributes_from(existing);
                copy
            }
            None => invent_fail_descr_for_op(op.opcode, ctx.driver),
        };

        let mut data = descr.resume_data().clone();
        data.numb.clear();
        data.consts.clear();
        let mut boxes = Vec::with_capacity(recorded.len());
        for (i, slot) in recorded.iter().enumerate() {
            match slot.map(|var| ctx.resolve(Arg::Var(var))) {
                None => {
                    data.numb.push(Tagged::Null);
                    boxes.push(None);
                }
                Some(Arg::Var(var)) => {
                    data.numb.push(Tagged::Box(i as u32));
                    boxes.push(Some(var));
                }
                Some(Arg::Const(value)) => {
                    data.numb.push(Tagged::Const(data.consts.len() as u32));
                    data.consts.push(value);
                    boxes.push(None);
                }
            }
        }
        data.count = boxes.len();
        descr.set_resume_data(data);
        descr.store_final_boxes(op, boxes, ctx.counter);
        if op.opcode == OpCode::GuardValue {
            descr.make_a_counter_per_value(op);
        }
        op.descr = Some(Descr::Guard(descr));
    }

    fn finish(self, last: Option<Operation>) -> (Vec<Operation>, BTreeSet<QuasiImmutId>) {
        let Pass { mut out, deps, .. } = self;
        out.extend(last);
        (out, deps)
    }
}

fn lookup_pure(ctx: &OptContext<'_>, args: &[Arg]) -> Option<Value> {
    let values: Option<Vec<Value>> = args.iter().map(Arg::as_const).collect();
    let key = CallPureKey::new(&values?);
    ctx.call_pure_results?.get(&key).copied()
}

fn fold_int(opcode: OpCode, args: &[Arg]) -> Option<i64> {
    let ints: Option<Vec<i64>> = args.iter().map(|a| a.as_const().and_then(|c| c.as_int())).collect();
    let value = match (opcode, ints?.as_slice()) {
        (OpCode::IntAdd, [a, b]) => a.wrapping_add(*b),
        (OpCode::IntSub, [a, b]) => a.wrapping_sub(*b),
        (OpCode::IntMul, [a, b]) => a.wrapping_mul(*b),
        (OpCode::IntAnd, [a, b]) => a & b,
        (OpCode::IntOr, [a, b]) => a | b,
        (OpCode::IntXor, [a, b]) => a ^ b,
        (OpCode::IntLshift, [a, b]) => a.checked_shl(u32::try_from(*b).ok()?)?,
        (OpCode::IntRshift, [a, b]) => a.checked_shr(u32::try_from(*b).ok()?)?,
        (OpCode::IntNeg, [a]) => a.wrapping_neg(),
        (OpCode::IntIsTrue, [a]) => (*a != 0) as i64,
        (OpCode::IntLt, [a, b]) => (a < b) as i64,
        (OpCode::IntLe, [a, b]) => (a <= b) as i64,
        (OpCode::IntEq, [a, b]) => (a == b) as i64,
        (OpCode::IntNe, [a, b]) => (a != b) as i64,
        (OpCode::IntGt, [a, b]) => (a > b) as i64,
        (OpCode::IntGe, [a, b]) => (a >= b) as i64,
        _ => return None,
    };
    Some(value)
}

/// `Some(holds)` when the guard's outcome is known at compile time.
fn guard_outcome(op: &Operation) -> Option<bool> {
    match (op.opcode, op.args.as_slice()) {
        (OpCode::GuardTrue, [Arg::Const(Value::Int(n))]) => Some(*n != 0),
        (OpCode::GuardFalse, [Arg::Const(Value::Int(n))]) => Some(*n == 0),
        (OpCode::GuardValue, [Arg::Const(a), Arg::Const(b)]) => Some(a.same_constant(b)),
        (OpCode::GuardNonnull, [Arg::Const(Value::Ref(r))]) => Some(!r.is_null()),
        (OpCode::GuardIsnull, [Arg::Const(Value::Ref(r))]) => Some(r.is_null()),
        _ => None,
    }
}

/// Entry point of the target unit a bridge with `types` may jump to.
///
/// With the short preamble inlined any entry fits, the latest first.
/// Otherwise only the unit's first entry (its preamble) is eligible.
fn pick_target(targets: &[Rc<TargetToken>], types: &[Type], inline_short_preamble: bool) -> Option<Rc<TargetToken>> {
    let fits = |t: &&Rc<TargetToken>| t.arg_types == types;
    if inline_short_preamble {
        targets.iter().rev().find(fits).cloned()
    } else {
        targets.first().filter(fits).cloned()
    }
}

impl Optimizer for BasicOptimizer {
    fn propagate_all_forward(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        ops: &[Operation],
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
        let inputargs = start_label.label_args();
        let mut pass = Pass::default();
        let last = pass.run(ctx, ops)?;
        let (out, deps) = pass.finish(last);
        Ok((LoopInfo::finished(inputargs, deps), out))
    }

    fn optimize_preamble(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        end_label: &Operation,
        ops: &[Operation],
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
        let inputargs = start_label.label_args();
        let mut pass = Pass::default();
        pass.run(ctx, ops)?;
        let (out, deps) = pass.finish(None);
        let state = ExportedState {
            renamed_inputargs: inputargs,
            end_args: end_label.args.iter().map(|a| ctx.resolve(*a)).collect(),
            quasi_immutable_deps: deps,
        };
        Ok((LoopInfo::exported(state), out))
    }

    fn optimize_peeled_loop(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        end_jump: &Operation,
        ops: &[Operation],
        state: &ExportedState,
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
        let Some(Descr::Cell(unit)) = end_jump.descr else {
            return Err(InvalidLoop::new("peeled loop does not close on a unit"));
        };
        let start_args = start_label.label_args();
        if start_args.len() != state.end_args.len() {
            return Err(InvalidLoop::new("loop header arity differs from the preamble"));
        }

        // A label argument must be a variable that appears once and does not
        // name a different input, or forwarding the inputs would loop.
        let mut label_args: Vec<Var> = Vec::with_capacity(start_args.len());
        let mut extra_same_as = Vec::new();
        for (i, end_arg) in state.end_args.iter().enumerate() {
            let reusable = match end_arg {
                Arg::Var(v) => {
                    !label_args.contains(v) && !start_args.iter().enumerate().any(|(j, s)| j != i && s.id == v.id)
                }
                Arg::Const(_) => false,
            };
            let var = match end_arg {
                Arg::Var(v) if reusable => *v,
                other => {
                    let fresh = ctx.fresh(other.ty());
                    extra_same_as.push(Operation::new(OpCode::SameAs, vec![*other]).with_result(fresh));
                    fresh
                }
            };
            label_args.push(var);
        }
        for (input, var) in start_args.iter().zip(&label_args) {
            ctx.forwarding.forward(*input, Arg::Var(*var));
        }

        let mut pass = Pass::renaming();
        pass.run(ctx, ops)?;
        let mut jump = end_jump.clone();
        ctx.forwarding.apply(&mut jump);
        if jump.args.len() != label_args.len() {
            return Err(InvalidLoop::new("jump arity differs from the loop header"));
        }
        let target = TargetToken::new(unit, label_args.iter().map(|v| v.ty).collect());
        jump.descr = Some(Descr::Target(Rc::clone(&target)));
        let (out, deps) = pass.finish(Some(jump));

        let mut info = LoopInfo::finished(start_args, deps);
        info.label_op = Some(Operation::label(&label_args, Descr::Target(target)));
        info.extra_same_as = extra_same_as;
        Ok((info, out))
    }

    fn optimize_bridge(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        ops: &[Operation],
        inline_short_preamble: bool,
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
        let inputargs = start_label.label_args();
        let mut pass = Pass::default();
        let last = pass.run(ctx, ops)?;
        let Some(mut jump) = last.filter(|op| op.opcode == OpCode::Jump) else {
            return Err(InvalidLoop::new("bridge does not end in a jump"));
        };
        let unit = match &jump.descr {
            Some(Descr::Cell(h)) => *h,
            Some(Descr::Target(t)) => t.owner,
            _ => return Err(InvalidLoop::new("bridge jump has no target unit")),
        };
        let types: Vec<Type> = jump.args.iter().map(Arg::ty).collect();
        let target = ctx
            .registry
            .get(unit)
            .and_then(|token| pick_target(&token.target_tokens, &types, inline_short_preamble));
        match target {
            Some(target) => {
                jump.descr = Some(Descr::Target(target));
                let (out, deps) = pass.finish(Some(jump));
                Ok((LoopInfo::finished(inputargs, deps), out))
            }
            None => {
                let (out, deps) = pass.finish(None);
                let state = ExportedState {
                    renamed_inputargs: inputargs,
                    end_args: jump.args,
                    quasi_immutable_deps: deps,
                };
                Ok((LoopInfo::exported(state), out))
            }
        }
    }
}
