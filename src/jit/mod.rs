//! Compilation orchestration for the tracing JIT.
//!
//! This module sits between the tracer and the machine-code backend:
//! - Compile units and their entry points ([`UnitRegistry`], [`TargetToken`])
//! - Driving the optimizer over recorded histories ([`compile_loop`], [`compile_trace`])
//! - Guard failure handling and bridge compilation ([`ResumeGuardDescr`])
//! - Forcing virtuals out of running frames ([`force_now`])
//! - Aging out unused loops ([`MemoryManager`])
//!
//! The backend and the optimizer are trait objects supplied by the embedder.
//! [`RecordingBackend`] and [`BasicOptimizer`] are the implementations used by
//! the `tracejit` command and the tests.

mod backend;
mod basic_opt;
mod compile;
mod compile_data;
mod context;
mod counter;
mod done;
mod driver;
mod force;
mod frame;
mod guard;
mod interp;
mod memmgr;
mod optimizer;
mod resume;
mod stats;
mod token;

pub use backend::{AsmInfo, Backend, BackendError, BackendLog, CompiledBridge, CompiledLoop, RecordingBackend, guards_in};
pub use basic_opt::BasicOptimizer;
pub use compile::{
    ResumeKey, TraceSession, compile_loop, compile_retrace, compile_simple_loop, compile_tmp_callback, compile_trace,
    emit_op, patch_new_loop_to_load_virtualizable_fields, propagate_original_jitcell_token, record_loop_or_bridge,
    send_bridge_to_backend, send_loop_to_backend,
};
pub use compile_data::{CompileData, CompileKind, optimize_trace};
pub use context::{JitContext, LoopNumbering};
pub use counter::JitCounter;
pub use done::{FinalDescr, MEMORY_ERROR};
pub use driver::{
    DriverId, FixedLayout, GreenKey, JitDriver, Optimization, OptimizerConfig, VirtualizableInfo, VirtualizableLayout,
    WarmState,
};
pub use force::{CriticalSection, Preemption, force_now};
pub use frame::{DeadFrame, FailDescr, ForceToken, FrameExit, FramePayload};
pub use guard::{CompilingGuard, GuardKind, ResumeFromInterpDescr, ResumeGuardDescr, invent_fail_descr_for_op};
pub use interp::InterpreterHooks;
pub use memmgr::{MemoryManager, QuasiImmutRegistry};
pub use optimizer::{CallPureKey, CallPureResults, ExportedState, InvalidLoop, LoopInfo, OptContext, Optimizer};
pub use resume::{PendingField, ResumeData, ResumeReader, Tagged, VirtualCache, VirtualHeap, VirtualInfo};
pub use stats::JitStats;
pub use token::{CompiledLoopToken, JitCellToken, TargetToken, UnitHandle, UnitRegistry};

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::JitConfig;
    use crate::error::JitError;
    use crate::ir::Type;

    /// Hooks that only count how often they were called.
    #[derive(Debug, Default)]
    pub struct NoopHooks {
        pub traced: usize,
        pub blackholed: usize,
        pub last_virtuals: Option<VirtualCache>,
    }

    impl InterpreterHooks for NoopHooks {
        fn trace_from_guard(
            &mut self,
            _jit: &mut JitContext,
            _driver: &Rc<JitDriver>,
            _key: &Rc<ResumeGuardDescr>,
            frame: &DeadFrame,
        ) -> Result<FrameExit, JitError> {
            self.traced += 1;
            Ok(FrameExit::ContinueRunningNormally(frame.values.clone()))
        }

        fn resume_in_blackhole(
            &mut self,
            _jit: &mut JitContext,
            _driver: &Rc<JitDriver>,
            _descr: &ResumeGuardDescr,
            frame: &DeadFrame,
            all_virtuals: Option<&VirtualCache>,
        ) -> Result<FrameExit, JitError> {
            self.blackholed += 1;
            self.last_virtuals = all_virtuals.cloned();
            Ok(FrameExit::ContinueRunningNormally(frame.values.clone()))
        }
    }

    /// Driver with one red argument of type int and every optimization on.
    pub fn test_driver(trace_eagerness: u32) -> JitDriver {
        JitDriver::new(DriverId(0), "test", 1, Type::Int)
            .with_warmstate(WarmState::new(OptimizerConfig::all(), trace_eagerness))
    }

    pub fn test_context() -> JitContext {
        recording_context().0
    }

    /// Context over a [`RecordingBackend`], together with the backend's log.
    pub fn recording_context() -> (JitContext, Rc<RefCell<BackendLog>>) {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let jit = JitContext::new(&JitConfig::default(), Box::new(backend), Box::new(BasicOptimizer::new()));
        (jit, log)
    }
}
