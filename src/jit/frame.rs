//! Dead frames: the state left behind when compiled code exits.

use std::rc::Rc;

use crate::error::JitError;
use crate::ir::{GcRef, Value};
use crate::jit::context::JitContext;
use crate::jit::done::FinalDescr;
use crate::jit::driver::JitDriver;
use crate::jit::guard::ResumeGuardDescr;
use crate::jit::interp::InterpreterHooks;
use crate::jit::resume::VirtualCache;

/// Token identifying a frame that is still running native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForceToken(pub u64);

/// Extra data attached to a dead frame between forcing and failing.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Virtuals materialized by an earlier `force_now` on this frame.
    ForcedVirtuals(VirtualCache),
}

/// The descriptor a frame exited through.
#[derive(Debug, Clone)]
pub enum FailDescr {
    Guard(Rc<ResumeGuardDescr>),
    Final(FinalDescr),
}

impl FailDescr {
    /// Entry point used by the backend once compiled code has exited.
    pub fn handle_fail(
        &self,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        hooks: &mut dyn InterpreterHooks,
        frame: &mut DeadFrame,
    ) -> Result<FrameExit, JitError> {
        match self {
            FailDescr::Guard(guard) => guard.handle_fail(jit, driver, hooks, frame),
            FailDescr::Final(descr) => Ok(descr.handle_fail(jit.backend.as_ref(), frame)),
        }
    }

    pub fn as_guard(&self) -> Option<&Rc<ResumeGuardDescr>> {
        match self {
            FailDescr::Guard(g) => Some(g),
            FailDescr::Final(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadFrame {
    pub descr: FailDescr,
    /// Values of the fail arguments, in fail-argument order.
    pub values: Vec<Value>,
    pub exception: Option<GcRef>,
    pub force_token: Option<ForceToken>,
    pub savedata: Option<FramePayload>,
}

impl DeadFrame {
    pub fn new(descr: FailDescr, values: Vec<Value>) -> Self {
        DeadFrame {
            descr,
            values,
            exception: None,
            force_token: None,
            savedata: None,
        }
    }

    pub fn with_force_token(mut self, token: ForceToken) -> Self {
        self.force_token = Some(token);
        self
    }

    /// Take the virtuals stored by a previous forcing, if any.
    pub fn take_forced_virtuals(&mut self) -> Option<VirtualCache> {
        match self.savedata.take() {
            Some(FramePayload::ForcedVirtuals(cache)) => Some(cache),
            None => None,
        }
    }
}

/// How the interpreter continues after compiled code exits.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameExit {
    DoneWithThisFrame(Value),
    ExitFrameWithException(GcRef),
    /// Keep interpreting with these frame values.
    ContinueRunningNormally(Vec<Value>),
}
