//! Interface to the native-code backend, plus an in-memory backend.
//!
//! [`RecordingBackend`] does not generate code. It keeps every submitted
//! operation list, hands out fake code addresses, and plays the part of the
//! running machine code for forcing: frames parked under a [`ForceToken`] can
//! be forced and re-installed. Its state sits behind a shared handle so
//! callers can inspect it after boxing the backend into a context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::ir::{GcRef, Operation, Value, Var};
use crate::jit::driver::DriverId;
use crate::jit::frame::{DeadFrame, ForceToken};
use crate::jit::guard::ResumeGuardDescr;
use crate::jit::token::UnitHandle;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected {what}: {reason}")]
    Rejected { what: String, reason: String },
    #[error("no running frame for force token {0:?}")]
    UnknownForceToken(ForceToken),
}

/// What the backend reports about freshly assembled code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsmInfo {
    pub code_addr: u64,
    pub code_size: usize,
    /// Code offset of each operation.
    pub ops_offset: Vec<usize>,
}

pub trait Backend {
    /// Assemble a new loop for `token`.
    fn compile_loop(
        &mut self,
        driver: DriverId,
        inputargs: &[Var],
        operations: &[Operation],
        token: UnitHandle,
        name: &str,
    ) -> Result<AsmInfo, BackendError>;

    /// Assemble a bridge and patch it onto the failure path of `faildescr`.
    fn compile_bridge(
        &mut self,
        faildescr: &Rc<ResumeGuardDescr>,
        inputargs: &[Var],
        operations: &[Operation],
        original: UnitHandle,
    ) -> Result<AsmInfo, BackendError>;

    /// Stop the frame behind `token` at its `guard_not_forced` and return it.
    fn force(&mut self, token: ForceToken) -> Result<DeadFrame, BackendError>;

    /// Hand a forced frame back so the running code sees the saved data.
    fn install_forced_frame(&mut self, token: ForceToken, frame: DeadFrame);

    fn free_loop_and_bridges(&mut self, _token: UnitHandle) {}

    fn get_int_value(&self, frame: &DeadFrame, index: usize) -> i64 {
        frame.values.get(index).and_then(Value::as_int).unwrap_or(0)
    }

    fn get_ref_value(&self, frame: &DeadFrame, index: usize) -> GcRef {
        frame.values.get(index).and_then(Value::as_ref).unwrap_or(GcRef::NULL)
    }

    fn get_float_value(&self, frame: &DeadFrame, index: usize) -> f64 {
        frame.values.get(index).and_then(Value::as_float).unwrap_or(0.0)
    }

    fn grab_exc_value(&self, frame: &DeadFrame) -> GcRef {
        frame.exception.unwrap_or(GcRef::NULL)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledLoop {
    pub token: UnitHandle,
    pub driver: DriverId,
    pub name: String,
    pub inputargs: Vec<Var>,
    pub operations: Vec<Operation>,
    pub asm: AsmInfo,
}

#[derive(Debug, Clone)]
pub struct CompiledBridge {
    pub faildescr: Rc<ResumeGuardDescr>,
    pub original: UnitHandle,
    pub inputargs: Vec<Var>,
    pub operations: Vec<Operation>,
    pub asm: AsmInfo,
}

/// Everything the recording backend has seen.
#[derive(Debug, Default)]
pub struct BackendLog {
    pub loops: Vec<CompiledLoop>,
    pub bridges: Vec<CompiledBridge>,
    pub freed: Vec<UnitHandle>,
    /// Frames that are "running" and can be forced.
    pub running: HashMap<ForceToken, DeadFrame>,
    /// Frames handed back after forcing.
    pub forced: HashMap<ForceToken, DeadFrame>,
    reject: Option<String>,
    next_addr: u64,
}

impl BackendLog {
    pub fn loop_for(&self, token: UnitHandle) -> Option<&CompiledLoop> {
        self.loops.iter().rev().find(|l| l.token == token)
    }

    /// Guard descriptors in the code of `token`, in operation order.
    pub fn guards_of(&self, token: UnitHandle) -> Vec<Rc<ResumeGuardDescr>> {
        self.loop_for(token).map(|l| guards_in(&l.operations)).unwrap_or_default()
    }

    pub fn submissions(&self) -> usize {
        self.loops.len() + self.bridges.len()
    }

    /// Make the next compile request fail with `reason`.
    pub fn reject_next(&mut self, reason: impl Into<String>) {
        self.reject = Some(reason.into());
    }

    fn assemble(&mut self, what: &str, operations: &[Operation]) -> Result<AsmInfo, BackendError> {
        if let Some(reason) = self.reject.take() {
            return Err(BackendError::Rejected {
                what: what.to_string(),
                reason,
            });
        }
        if self.next_addr == 0 {
            self.next_addr = 0x10000;
        }
        let code_addr = self.next_addr;
        let ops_offset: Vec<usize> = (0..operations.len()).map(|i| i * 16).collect();
        let code_size = operations.len() * 16;
        self.next_addr += (code_size as u64).max(16).next_multiple_of(0x100);
        Ok(AsmInfo {
            code_addr,
            code_size,
            ops_offset,
        })
    }
}

/// Guard descriptors attached to the guards of `operations`.
pub fn guards_in(operations: &[Operation]) -> Vec<Rc<ResumeGuardDescr>> {
    operations
        .iter()
        .filter(|op| op.is_guard())
        .filter_map(|op| op.descr.as_ref().and_then(|d| d.as_guard()).cloned())
        .collect()
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    state: Rc<RefCell<BackendLog>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the backend's log.
    pub fn log(&self) -> Rc<RefCell<BackendLog>> {
        Rc::clone(&self.state)
    }

    /// Make the next compile request fail with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.state.borrow_mut().reject_next(reason);
    }

    /// Register a frame that later `force` calls can stop.
    pub fn park_frame(&self, token: ForceToken, frame: DeadFrame) {
        self.state.borrow_mut().running.insert(token, frame);
    }
}

impl Backend for RecordingBackend {
    fn compile_loop(
        &mut self,
        driver: DriverId,
        inputargs: &[Var],
        operations: &[Operation],
        token: UnitHandle,
        name: &str,
    ) -> Result<AsmInfo, BackendError> {
        let mut log = self.state.borrow_mut();
        let asm = log.assemble(name, operations)?;
        log.loops.push(CompiledLoop {
            token,
            driver,
            name: name.to_string(),
            inputargs: inputargs.to_vec(),
            operations: operations.to_vec(),
            asm: asm.clone(),
        });
        Ok(asm)
    }

    fn compile_bridge(
        &mut self,
        faildescr: &Rc<ResumeGuardDescr>,
        inputargs: &[Var],
        operations: &[Operation],
        original: UnitHandle,
    ) -> Result<AsmInfo, BackendError> {
        let mut log = self.state.borrow_mut();
        let asm = log.assemble("bridge", operations)?;
        log.bridges.push(CompiledBridge {
            faildescr: Rc::clone(faildescr),
            original,
            inputargs: inputargs.to_vec(),
            operations: operations.to_vec(),
            asm: asm.clone(),
        });
        Ok(asm)
    }

    fn force(&mut self, token: ForceToken) -> Result<DeadFrame, BackendError> {
        self.state
            .borrow_mut()
            .running
            .remove(&token)
            .ok_or(BackendError::UnknownForceToken(token))
    }

    fn install_forced_frame(&mut self, token: ForceToken, frame: DeadFrame) {
        self.state.borrow_mut().forced.insert(token, frame);
    }

    fn free_loop_and_bridges(&mut self, token: UnitHandle) {
        let mut log = self.state.borrow_mut();
        log.freed.push(token);
        log.bridges.retain(|b| b.original != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpCode;
    use crate::jit::done::FinalDescr;
    use crate::jit::frame::FailDescr;

    fn ops() -> Vec<Operation> {
        vec![Operation::new(OpCode::Finish, vec![]).with_descr(crate::ir::Descr::Final(FinalDescr::DoneVoid))]
    }

    #[test]
    fn test_compile_loop_records_operations() {
        let mut backend = RecordingBackend::new();
        let log = backend.log();
        let asm = backend
            .compile_loop(DriverId(0), &[], &ops(), UnitHandle::dangling(), "Loop-0")
            .unwrap();
        assert_eq!(asm.ops_offset, vec![0]);
        let log = log.borrow();
        assert_eq!(log.loops.len(), 1);
        assert_eq!(log.loops[0].name, "Loop-0");
        assert_eq!(log.loops[0].asm.code_addr, asm.code_addr);
    }

    #[test]
    fn test_distinct_code_addresses() {
        let mut backend = RecordingBackend::new();
        let a = backend.compile_loop(DriverId(0), &[], &ops(), UnitHandle::dangling(), "a").unwrap();
        let b = backend.compile_loop(DriverId(0), &[], &ops(), UnitHandle::dangling(), "b").unwrap();
        assert_ne!(a.code_addr, b.code_addr);
    }

    #[test]
    fn test_reject_next() {
        let mut backend = RecordingBackend::new();
        backend.reject_next("out of code space");
        let err = backend
            .compile_loop(DriverId(0), &[], &ops(), UnitHandle::dangling(), "Loop-0")
            .unwrap_err();
        assert!(err.to_string().contains("out of code space"));
        assert!(backend.compile_loop(DriverId(0), &[], &ops(), UnitHandle::dangling(), "Loop-0").is_ok());
    }

    #[test]
    fn test_force_unknown_token() {
        let mut backend = RecordingBackend::new();
        assert!(matches!(backend.force(ForceToken(9)), Err(BackendError::UnknownForceToken(ForceToken(9)))));
    }

    #[test]
    fn test_force_takes_parked_frame() {
        let mut backend = RecordingBackend::new();
        let frame = DeadFrame::new(FailDescr::Final(FinalDescr::DoneVoid), vec![Value::Int(1)]);
        backend.park_frame(ForceToken(1), frame);
        let forced = backend.force(ForceToken(1)).unwrap();
        assert_eq!(forced.values, vec![Value::Int(1)]);
        assert!(backend.force(ForceToken(1)).is_err());
    }

    #[test]
    fn test_default_value_accessors() {
        let backend = RecordingBackend::new();
        let mut frame = DeadFrame::new(
            FailDescr::Final(FinalDescr::DoneVoid),
            vec![Value::Int(3), Value::Ref(GcRef(16)), Value::Float(2.5)],
        );
        frame.exception = Some(GcRef(32));
        assert_eq!(backend.get_int_value(&frame, 0), 3);
        assert_eq!(backend.get_ref_value(&frame, 1), GcRef(16));
        assert_eq!(backend.get_float_value(&frame, 2), 2.5);
        assert_eq!(backend.grab_exc_value(&frame), GcRef(32));
    }
}
