//! Scripted stand-ins for the interpreter and the garbage collector.
//!
//! [`run`] replays a [`TraceFile`] end to end: it compiles the loop, feeds
//! the scripted guard failures through the normal failure path, and traces
//! bridges from the histories the file provides.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::JitConfig;
use crate::error::{JitError, RunError, TraceFileError};
use crate::ir::{Arg, ArrayDescr, Descr, FieldDescr, GcRef, History, OpCode, Operation, SizeDescr, Value, format_ops};
use crate::jit::{
    BackendLog, BasicOptimizer, DeadFrame, DriverId, FailDescr, FrameExit, GreenKey, InterpreterHooks, JitContext,
    JitDriver, JitStats, RecordingBackend, ResumeFromInterpDescr, ResumeGuardDescr, ResumeKey, ResumeReader,
    TraceSession, UnitHandle, VirtualCache, VirtualHeap, WarmState, compile_loop, compile_retrace,
    compile_tmp_callback, compile_trace, guards_in,
};
use crate::tracefile::{BridgeSpec, EntrySpec, Recorder, TraceFile};

const ARENA_BASE: u64 = 0x1000_0000;
const OBJECT_ALIGN: u64 = 16;

#[derive(Debug, Default)]
struct HeapObject {
    fields: HashMap<Rc<str>, Value>,
    items: Vec<Value>,
}

/// Bump allocator for materialized virtuals. Objects are never freed.
#[derive(Debug, Default)]
pub struct ArenaHeap {
    objects: Vec<HeapObject>,
}

impl ArenaHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.objects.len()
    }

    fn push(&mut self, object: HeapObject) -> GcRef {
        let index = self.objects.len() as u64;
        self.objects.push(object);
        GcRef(ARENA_BASE + index * OBJECT_ALIGN)
    }

    fn object(&self, obj: GcRef) -> Option<&HeapObject> {
        let offset = obj.0.checked_sub(ARENA_BASE)?;
        self.objects.get((offset / OBJECT_ALIGN) as usize)
    }

    fn object_mut(&mut self, obj: GcRef) -> Option<&mut HeapObject> {
        let offset = obj.0.checked_sub(ARENA_BASE)?;
        self.objects.get_mut((offset / OBJECT_ALIGN) as usize)
    }

    pub fn field(&self, obj: GcRef, name: &str) -> Option<Value> {
        self.object(obj)?.fields.get(name).copied()
    }

    pub fn item(&self, array: GcRef, index: usize) -> Option<Value> {
        self.object(array)?.items.get(index).copied()
    }
}

impl VirtualHeap for ArenaHeap {
    fn allocate_struct(&mut self, _descr: &SizeDescr) -> GcRef {
        self.push(HeapObject::default())
    }

    fn allocate_array(&mut self, descr: &ArrayDescr, len: usize) -> GcRef {
        self.push(HeapObject {
            items: vec![descr.item_ty.zero(); len],
            ..HeapObject::default()
        })
    }

    fn set_field(&mut self, obj: GcRef, field: &FieldDescr, value: Value) {
        if let Some(object) = self.object_mut(obj) {
            object.fields.insert(Rc::clone(&field.name), value);
        }
    }

    fn set_array_item(&mut self, array: GcRef, index: usize, value: Value) {
        if let Some(slot) = self.object_mut(array).and_then(|o| o.items.get_mut(index)) {
            *slot = value;
        }
    }
}

/// Interpreter hooks driven by the histories of a trace file.
pub struct ScriptedInterpreter<'a> {
    file: &'a TraceFile,
    positions: HashMap<String, u32>,
    greenkey: GreenKey,
    pub heap: ArenaHeap,
    pub traced: usize,
    pub blackholed: usize,
}

impl<'a> ScriptedInterpreter<'a> {
    pub fn new(file: &'a TraceFile) -> Self {
        ScriptedInterpreter {
            file,
            positions: file.guard_positions(),
            greenkey: GreenKey(file.greenkey.clone()),
            heap: ArenaHeap::new(),
            traced: 0,
            blackholed: 0,
        }
    }

    fn bridge_at(&self, position: u32) -> Option<&'a BridgeSpec> {
        let file = self.file;
        file.bridges
            .iter()
            .find(|b| self.positions.get(&b.guard) == Some(&position))
    }

    fn procedure(&self, driver: &JitDriver) -> Option<UnitHandle> {
        driver.warmstate.borrow().get_procedure_token(&self.greenkey)
    }

    /// Record a bridge history starting from the values of `frame`.
    fn record_bridge(
        &self,
        driver: &JitDriver,
        bridge: &BridgeSpec,
        frame: &DeadFrame,
    ) -> Result<Option<History>, TraceFileError> {
        let mut recorder = Recorder::new(driver, &self.positions);
        for (name, value) in bridge.inputs.iter().zip(&frame.values) {
            recorder.input(name, *value);
        }
        recorder.ops(&bridge.ops)?;
        let index = bridge.ops.len();
        let closing = match (&bridge.jump, &bridge.finish) {
            (Some(args), None) => {
                let Some(unit) = self.procedure(driver) else {
                    return Ok(None);
                };
                Operation::jump(recorder.args(args, index)?, Descr::Cell(unit))
            }
            (None, Some(args)) => Operation::new(OpCode::Finish, recorder.args(args, index)?)
                .with_descr(Descr::Final(driver.done_descr())),
            _ => {
                return Err(TraceFileError::Malformed {
                    index,
                    reason: format!("bridge from `{}` needs exactly one of jump or finish", bridge.guard),
                });
            }
        };
        Ok(Some(recorder.finish(closing)))
    }

    /// Trace one more iteration of the loop after a bridge that found no
    /// entry point, and compile bridge and loop together.
    fn retrace(
        &self,
        jit: &mut JitContext,
        session: &mut TraceSession,
        resumekey: &ResumeKey,
    ) -> Result<(), JitError> {
        let driver = Rc::clone(&session.driver);
        let Some(jump) = session.history.operations.last() else {
            return Ok(());
        };
        let Some(entry_vars) = jump.args.iter().map(Arg::as_var).collect::<Option<Vec<_>>>() else {
            debug!(target: "jit-compile", "bridge jumps with constants, not retracing");
            session.take_partial_trace();
            return Ok(());
        };
        let history = std::mem::take(&mut session.history);
        let mut recorder = Recorder::continuing(history, &driver, &self.positions);
        for (input, var) in self.file.inputs.iter().zip(&entry_vars) {
            recorder.alias(&input.name, *var);
        }
        let start = recorder.history.operations.len();
        let recorded = recorder
            .ops(&self.file.body)
            .and_then(|()| recorder.args(&self.file.jump, self.file.body.len()));
        session.history = recorder.history;
        let jumpargs = match recorded {
            Ok(args) => args,
            Err(err) => {
                warn!(target: "jit-compile", %err, "cannot record the loop for a retrace");
                session.take_partial_trace();
                return Ok(());
            }
        };
        let target = compile_retrace(jit, session, &self.greenkey, start, &entry_vars, &jumpargs, resumekey)?;
        debug!(target: "jit-compile", compiled = target.is_some(), "retrace finished");
        Ok(())
    }

    /// Compile a trace entering the loop from the interpreter.
    pub fn entry_bridge(
        &self,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        spec: &EntrySpec,
    ) -> Result<Option<UnitHandle>, RunError> {
        let Some(unit) = self.procedure(driver) else {
            return Ok(None);
        };
        let mut recorder = Recorder::new(driver, &self.positions);
        recorder.inputs(&spec.inputs);
        recorder.ops(&spec.ops)?;
        let args = recorder.args(&spec.jump, spec.ops.len())?;
        let history = recorder.finish(Operation::jump(args, Descr::Cell(unit)));
        let greenkey = GreenKey(spec.greenkey.clone());
        let mut session = TraceSession::new(Rc::clone(driver), history);
        let resumekey = ResumeKey::FromInterp(ResumeFromInterpDescr::new(greenkey.clone()));
        compile_trace(jit, &mut session, &resumekey)?;
        Ok(driver.warmstate.borrow().get_procedure_token(&greenkey))
    }
}

impl InterpreterHooks for ScriptedInterpreter<'_> {
    fn trace_from_guard(
        &mut self,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        key: &Rc<ResumeGuardDescr>,
        frame: &DeadFrame,
    ) -> Result<FrameExit, JitError> {
        let position = key.resume_data().position;
        let history = match self.bridge_at(position).map(|b| self.record_bridge(driver, b, frame)) {
            Some(Ok(Some(history))) => history,
            Some(Err(err)) => {
                warn!(target: "jit-guard", %err, "cannot record bridge");
                return self.resume_in_blackhole(jit, driver, key, frame, None);
            }
            _ => return self.resume_in_blackhole(jit, driver, key, frame, None),
        };
        self.traced += 1;
        let mut session = TraceSession::for_guard(Rc::clone(driver), history, key);
        let resumekey = ResumeKey::Guard(Rc::clone(key));
        if compile_trace(jit, &mut session, &resumekey)?.is_none() && session.has_partial_trace() {
            self.retrace(jit, &mut session, &resumekey)?;
        }
        Ok(FrameExit::ContinueRunningNormally(frame.values.clone()))
    }

    fn resume_in_blackhole(
        &mut self,
        _jit: &mut JitContext,
        _driver: &Rc<JitDriver>,
        descr: &ResumeGuardDescr,
        frame: &DeadFrame,
        all_virtuals: Option<&VirtualCache>,
    ) -> Result<FrameExit, JitError> {
        let data = descr.resume_data().clone();
        let mut reader = ResumeReader::new(&data, &frame.values, &mut self.heap);
        if let Some(cache) = all_virtuals {
            reader = reader.with_cache(cache.clone());
        }
        let values = reader.read_frame();
        reader.apply_pending_fields();
        self.blackholed += 1;
        debug!(target: "jit-guard", position = data.position, "resumed in blackhole");
        Ok(FrameExit::ContinueRunningNormally(values))
    }
}

/// Outcome of [`run`].
#[derive(Debug)]
pub struct RunReport {
    pub stats: JitStats,
    pub exits: Vec<FrameExit>,
    /// Failures that went into an already attached bridge.
    pub bridge_runs: usize,
    /// Units invalidated by quasi-immutable writes.
    pub invalidated: usize,
    pub live_units: usize,
    /// Text of every compiled loop and bridge.
    pub dump: String,
}

/// Guard descriptor for resume position `position`: taken from the loop
/// body of `unit` if it has one there, else from the latest bridge.
fn find_guard(log: &BackendLog, unit: UnitHandle, position: u32) -> Option<Rc<ResumeGuardDescr>> {
    let at_position = |g: &Rc<ResumeGuardDescr>| g.resume_data().position == position;
    if let Some(guard) = log.guards_of(unit).into_iter().rev().find(at_position) {
        return Some(guard);
    }
    log.bridges
        .iter()
        .rev()
        .flat_map(|b| guards_in(&b.operations))
        .find(at_position)
}

fn dump_log(log: &BackendLog) -> String {
    let mut out = String::new();
    for compiled in &log.loops {
        let _ = writeln!(out, "# {} (Loop{})", compiled.name, compiled.token.index());
        out.push_str(&format_ops(&compiled.inputargs, &compiled.operations));
    }
    for bridge in &log.bridges {
        let _ = writeln!(
            out,
            "# bridge from {} of Loop{}",
            bridge.faildescr.guard_opnum(),
            bridge.original.index()
        );
        out.push_str(&format_ops(&bridge.inputargs, &bridge.operations));
    }
    out
}

/// Compile the loop of `file` and replay its events.
pub fn run(file: &TraceFile, config: &JitConfig) -> Result<RunReport, RunError> {
    let backend = RecordingBackend::new();
    let log = backend.log();
    let mut jit = JitContext::new(config, Box::new(backend), Box::new(BasicOptimizer::new()));
    let driver = Rc::new(
        JitDriver::new(DriverId(0), file.driver.name.clone(), file.driver.red_args, file.driver.result)
            .with_warmstate(WarmState::from_config(config)?),
    );
    let greenkey = GreenKey(file.greenkey.clone());
    let mut interp = ScriptedInterpreter::new(file);

    let mut recorder = Recorder::new(&driver, &interp.positions);
    recorder.inputs(&file.inputs);
    recorder.ops(&file.body)?;
    let jumpargs = recorder.args(&file.jump, file.body.len())?;
    let history = recorder.history;
    let inputargs = history.inputargs.clone();
    let mut session = TraceSession::new(Rc::clone(&driver), history);
    let mut entry = compile_loop(&mut jit, &mut session, &greenkey, 0, &inputargs, &jumpargs, true, false)?;
    if entry.is_none() {
        info!(target: "jit-compile", "retrying the loop without unrolling");
        entry = compile_loop(&mut jit, &mut session, &greenkey, 0, &inputargs, &jumpargs, true, true)?;
    }
    let unit = entry.ok_or(RunError::LoopNotCompiled)?.owner;

    for spec in &file.entry_bridges {
        interp.entry_bridge(&mut jit, &driver, spec)?;
    }

    let mut exits = Vec::new();
    let mut bridge_runs = 0;
    for failure in &file.failures {
        let position = *interp
            .positions
            .get(&failure.guard)
            .ok_or_else(|| RunError::UnknownGuard(failure.guard.clone()))?;
        let values: Vec<Value> = failure.values.iter().map(|v| (*v).into()).collect();
        for _ in 0..failure.times {
            let guard = find_guard(&log.borrow(), unit, position)
                .ok_or_else(|| RunError::UnknownGuard(failure.guard.clone()))?;
            if guard.bridge_count() > 0 {
                // the attached bridge runs instead of the failure path
                debug!(target: "jit-guard", guard = %failure.guard, "failure taken by bridge");
                bridge_runs += 1;
                continue;
            }
            let descr = FailDescr::Guard(guard);
            let mut frame = DeadFrame::new(descr.clone(), values.clone());
            exits.push(descr.handle_fail(&mut jit, &driver, &mut interp, &mut frame)?);
        }
    }

    let mut invalidated = 0;
    for field in &file.invalidate {
        invalidated += jit.quasi_immut.invalidate(*field, &mut jit.registry);
    }
    for (index, callback) in file.tmp_callbacks.iter().enumerate() {
        if callback.reds.len() != driver.num_red_args {
            return Err(TraceFileError::Malformed {
                index,
                reason: format!("callback needs {} red arguments", driver.num_red_args),
            }
            .into());
        }
        let greens: Vec<Arg> = callback.greens.iter().map(|g| Arg::int(*g)).collect();
        compile_tmp_callback(&mut jit, &driver, &greens, &callback.reds)?;
    }
    for _ in 0..file.generations {
        jit.next_generation();
    }

    let dump = dump_log(&log.borrow());
    info!(
        target: "jit-compile",
        traced = interp.traced,
        blackholed = interp.blackholed,
        "replay finished"
    );
    Ok(RunReport {
        stats: jit.stats.clone(),
        exits,
        bridge_runs,
        invalidated,
        live_units: jit.registry.len(),
        dump,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn test_arena_addresses_are_distinct() {
        let mut heap = ArenaHeap::new();
        let a = heap.allocate_struct(&SizeDescr { type_id: 1, size: 16 });
        let b = heap.allocate_array(&ArrayDescr { item_ty: Type::Int }, 3);
        assert_ne!(a, b);
        assert_eq!(heap.allocations(), 2);
        assert_eq!(heap.item(b, 2), Some(Value::Int(0)));
        assert_eq!(heap.item(b, 3), None);
    }

    #[test]
    fn test_arena_stores() {
        let mut heap = ArenaHeap::new();
        let obj = heap.allocate_struct(&SizeDescr { type_id: 1, size: 16 });
        heap.set_field(obj, &FieldDescr::new("x", Type::Int, 0), Value::Int(4));
        assert_eq!(heap.field(obj, "x"), Some(Value::Int(4)));
        assert_eq!(heap.field(obj, "y"), None);
        assert_eq!(heap.field(GcRef::NULL, "x"), None);
    }

    const COUNTDOWN: &str = r#"{
        "driver": {"name": "countdown"},
        "inputs": [{"name": "i0", "value": 100}],
        "loop": [
            {"result": "i1", "op": "int_gt", "args": ["i0", 0]},
            {"op": "guard_true", "args": ["i1"], "fail_args": ["i0"], "guard": "done"},
            {"result": "i2", "op": "int_sub", "args": ["i0", 1]}
        ],
        "jump": ["i2"],
        "bridges": [
            {"guard": "done", "inputs": ["i5"], "finish": ["i5"]}
        ],
        "failures": [{"guard": "done", "values": [0], "times": 3}]
    }"#;

    fn config(eagerness: u32) -> JitConfig {
        JitConfig {
            trace_eagerness: eagerness,
            ..JitConfig::default()
        }
    }

    #[test]
    fn test_countdown_compiles_bridge_on_third_failure() {
        let file = TraceFile::from_json(COUNTDOWN).unwrap();
        let report = run(&file, &config(3)).unwrap();
        assert_eq!(report.stats.loops_compiled, 1);
        assert_eq!(report.stats.guard_failures, 3);
        assert_eq!(report.stats.blackholes, 2);
        assert_eq!(report.stats.bridges_compiled, 1);
        assert_eq!(report.exits.len(), 3);
        assert!(report.dump.contains("# bridge from guard_true"));
    }

    #[test]
    fn test_attached_bridge_takes_later_failures() {
        let file = TraceFile::from_json(COUNTDOWN).unwrap();
        let report = run(&file, &config(1)).unwrap();
        assert_eq!(report.stats.bridges_compiled, 1);
        assert_eq!(report.stats.bridge_traces, 1);
        assert_eq!(report.stats.guard_failures, 1);
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.bridge_runs, 2);
        assert_eq!(report.dump.matches("# bridge from").count(), 1);
    }

    #[test]
    fn test_unknown_failure_guard() {
        let file = TraceFile::from_json(&COUNTDOWN.replace(r#"{"guard": "done", "values""#, r#"{"guard": "nope", "values""#))
            .unwrap();
        assert!(matches!(run(&file, &config(3)), Err(RunError::UnknownGuard(label)) if label == "nope"));
    }
}
