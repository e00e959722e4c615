//! Forcing virtuals out of a running frame.
//!
//! The backend calls [`force_now`] from inside a residual call when the
//! callee needs to see objects the compiled code kept virtual. Forcing
//! reconstructs them from the `guard_not_forced` resume data and leaves them
//! on the frame, where the later failure of that guard picks them up.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use crate::error::JitError;
use crate::jit::context::JitContext;
use crate::jit::frame::{FailDescr, ForceToken, FramePayload};
use crate::jit::guard::GuardKind;
use crate::jit::resume::{VirtualHeap, force_from_resumedata};

/// Non-preemptible regions and the interrupts deferred while inside one.
#[derive(Debug, Default)]
pub struct Preemption {
    depth: Cell<u32>,
    pending: Cell<bool>,
}

impl Preemption {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a critical section; it ends when the returned value is dropped.
    pub fn critical_section(&self) -> CriticalSection<'_> {
        self.depth.set(self.depth.get() + 1);
        CriticalSection { owner: self }
    }

    pub fn in_critical_section(&self) -> bool {
        self.depth.get() > 0
    }

    /// Ask for an interrupt at the next checkpoint outside a critical section.
    pub fn request_interrupt(&self) {
        self.pending.set(true);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.pending.get()
    }

    /// Deliver a pending interrupt, unless inside a critical section.
    pub fn checkpoint(&self) -> Result<(), JitError> {
        if self.in_critical_section() || !self.pending.get() {
            return Ok(());
        }
        self.pending.set(false);
        Err(JitError::Interrupted)
    }
}

#[must_use]
pub struct CriticalSection<'a> {
    owner: &'a Preemption,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.owner.depth.set(self.owner.depth.get() - 1);
    }
}

/// Force every virtual of the frame behind `token`.
///
/// The force and the save of the reconstructed virtuals happen inside one
/// critical section, so no interrupt can observe a forced frame without its
/// saved data. An interrupt requested meanwhile is delivered once the
/// section ends, after the frame has been handed back.
pub fn force_now(jit: &mut JitContext, heap: &mut dyn VirtualHeap, token: ForceToken) -> Result<(), JitError> {
    let preemption = Rc::clone(&jit.preemption);
    {
        let _section = preemption.critical_section();

        let mut frame = jit.backend.force(token)?;
        let descr = match &frame.descr {
            FailDescr::Guard(g) if matches!(g.kind(), GuardKind::Forced { .. }) => Rc::clone(g),
            other => unreachable!("forced frame stopped at {other:?} instead of guard_not_forced"),
        };
        let all_virtuals = {
            let data = descr.resume_data();
            force_from_resumedata(&data, &frame.values, heap)
        };
        debug!(target: "jit-guard", token = token.0, virtuals = all_virtuals.len(), "forced frame");
        frame.savedata = Some(FramePayload::ForcedVirtuals(all_virtuals));
        jit.backend.install_forced_frame(token, frame);
        jit.stats.forcings += 1;
    }
    preemption.checkpoint()
}
