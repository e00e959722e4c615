//! Hooks into the tracer and the blackhole interpreter.

use std::rc::Rc;

use crate::error::JitError;
use crate::jit::context::JitContext;
use crate::jit::driver::JitDriver;
use crate::jit::frame::{DeadFrame, FrameExit};
use crate::jit::guard::ResumeGuardDescr;
use crate::jit::resume::VirtualCache;

/// The interpreter side of guard failures.
pub trait InterpreterHooks {
    /// Re-run the interpreter from the guard's resume point, recording a
    /// history and handing it to [`compile_trace`](crate::jit::compile_trace).
    ///
    /// Called while `key` is busy.
    fn trace_from_guard(
        &mut self,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        key: &Rc<ResumeGuardDescr>,
        frame: &DeadFrame,
    ) -> Result<FrameExit, JitError>;

    /// Continue in the blackhole interpreter from the guard's resume data.
    /// `all_virtuals` is set for `guard_not_forced` failures.
    fn resume_in_blackhole(
        &mut self,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        descr: &ResumeGuardDescr,
        frame: &DeadFrame,
        all_virtuals: Option<&VirtualCache>,
    ) -> Result<FrameExit, JitError>;
}
