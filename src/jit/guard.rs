//! Guard descriptors and their failure lifecycle.
//!
//! A guard descriptor is idle until a failure of its guard makes
//! [`ResumeGuardDescr::must_compile`] say yes. It is then busy for as long as
//! a bridge is being traced from it; failures seen while busy go straight to
//! the blackhole interpreter without counting.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::JitError;
use crate::ir::{InputArg, OpCode, Operation, Trace, Type, Var};
use crate::jit::compile::{TraceSession, propagate_original_jitcell_token, send_bridge_to_backend, send_loop_to_backend};
use crate::jit::context::JitContext;
use crate::jit::counter::JitCounter;
use crate::jit::driver::{DriverId, GreenKey, JitDriver};
use crate::jit::frame::{DeadFrame, FrameExit};
use crate::jit::interp::InterpreterHooks;
use crate::jit::resume::{ResumeData, VirtualCache};
use crate::jit::token::UnitHandle;

/// Set while a bridge is being traced from this guard.
pub const ST_BUSY_FLAG: u64 = 0x01;
/// Type of the guard-value slot (`TY_*`).
pub const ST_TYPE_MASK: u64 = 0x06;
/// `status >> ST_SHIFT` is the counter hash (`TY_NONE`) or the index of the
/// guarded value among the fail arguments.
pub const ST_SHIFT: u32 = 3;
pub const ST_SHIFT_MASK: u64 = !((1 << ST_SHIFT) - 1);
pub const TY_NONE: u64 = 0x00;
pub const TY_INT: u64 = 0x02;
pub const TY_REF: u64 = 0x04;
pub const TY_FLOAT: u64 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Plain,
    /// `guard_not_forced`: never compiled, may carry forced virtuals.
    Forced { driver: DriverId },
    NotInvalidated,
    /// `guard_future_condition`: bridges from here skip the short preamble.
    AtPosition,
}

/// Per-guard deoptimization record.
#[derive(Debug)]
pub struct ResumeGuardDescr {
    guard_opnum: OpCode,
    kind: GuardKind,
    status: Cell<u64>,
    resume: RefCell<ResumeData>,
    rd_loop_token: Cell<Option<UnitHandle>>,
    bridges: Cell<usize>,
    trace_attempts: Cell<usize>,
}

impl ResumeGuardDescr {
    pub fn new(guard_opnum: OpCode, kind: GuardKind) -> Self {
        ResumeGuardDescr {
            guard_opnum,
            kind,
            status: Cell::new(0),
            resume: RefCell::new(ResumeData::default()),
            rd_loop_token: Cell::new(None),
            bridges: Cell::new(0),
            trace_attempts: Cell::new(0),
        }
    }

    pub fn guard_opnum(&self) -> OpCode {
        self.guard_opnum
    }

    pub fn kind(&self) -> GuardKind {
        self.kind
    }

    pub fn status(&self) -> u64 {
        self.status.get()
    }

    pub fn is_busy(&self) -> bool {
        self.status.get() & ST_BUSY_FLAG != 0
    }

    /// Unit whose code contains this guard, set once the unit is recorded.
    pub fn rd_loop_token(&self) -> Option<UnitHandle> {
        self.rd_loop_token.get()
    }

    pub fn set_rd_loop_token(&self, token: UnitHandle) {
        self.rd_loop_token.set(Some(token));
    }

    pub fn resume_data(&self) -> Ref<'_, ResumeData> {
        self.resume.borrow()
    }

    pub fn set_resume_data(&self, data: ResumeData) {
        *self.resume.borrow_mut() = data;
    }

    /// Number of bridges attached to this guard so far.
    pub fn bridge_count(&self) -> usize {
        self.bridges.get()
    }

    /// Number of times tracing has started from this guard.
    pub fn trace_attempts(&self) -> usize {
        self.trace_attempts.get()
    }

    /// Share the resume data of `other`. The status word is not copied.
    pub fn copy_all_attributes_from(&self, other: &ResumeGuardDescr) {
        let data = other.resume.borrow().clone();
        *self.resume.borrow_mut() = data;
    }

    /// Install the final fail arguments of `guard_op` and give the guard its
    /// own counter slot.
    pub fn store_final_boxes(&self, guard_op: &mut Operation, boxes: Vec<Option<Var>>, counter: &mut JitCounter) {
        {
            let mut resume = self.resume.borrow_mut();
            if resume.numb.is_empty() {
                resume.numb = ResumeData::for_fail_args(boxes.len()).numb;
            }
            resume.count = boxes.len();
        }
        guard_op.fail_args = Some(boxes);
        let hash = counter.fetch_next_hash() as u64;
        self.status.set(hash & ST_SHIFT_MASK);
    }

    /// Switch a `guard_value` to counting per observed value.
    pub fn make_a_counter_per_value(&self, guard_value_op: &Operation) {
        debug_assert_eq!(guard_value_op.opcode, OpCode::GuardValue);
        let Some(var) = guard_value_op.args.first().and_then(|a| a.as_var()) else {
            return;
        };
        let Some(i) = guard_value_op.fail_args().iter().position(|slot| *slot == Some(var)) else {
            return;
        };
        let ty = match var.ty {
            Type::Int => TY_INT,
            Type::Ref => TY_REF,
            Type::Float => TY_FLOAT,
            Type::Void => unreachable!("guard_value on a void value"),
        };
        self.status.set(ty | ((i as u64) << ST_SHIFT));
    }

    pub fn get_index_of_guard_value(&self) -> Option<usize> {
        let status = self.status.get();
        if status & ST_TYPE_MASK == TY_NONE {
            return None;
        }
        Some((status >> ST_SHIFT) as usize)
    }

    /// Mark the guard busy until the returned guard is dropped.
    pub fn start_compiling(&self) -> CompilingGuard<'_> {
        self.status.set(self.status.get() | ST_BUSY_FLAG);
        self.trace_attempts.set(self.trace_attempts.get() + 1);
        CompilingGuard { descr: self }
    }

    /// Clear the busy flag. If no bridge was produced, the counter slot was
    /// already reset when it fired and stayed untouched while busy.
    pub fn done_compiling(&self) {
        self.status.set(self.status.get() & !ST_BUSY_FLAG);
    }

    /// Count this failure and decide whether to trace a bridge now.
    pub fn must_compile(&self, jit: &mut JitContext, driver: &JitDriver, frame: &DeadFrame) -> bool {
        let status = self.status.get();
        let hash = if status & (ST_BUSY_FLAG | ST_TYPE_MASK) == 0 {
            status as u32
        } else if status & ST_BUSY_FLAG != 0 {
            return false;
        } else {
            let index = (status >> ST_SHIFT) as usize;
            let backend = jit.backend.as_ref();
            let intval = match status & ST_TYPE_MASK {
                TY_INT => backend.get_int_value(frame, index),
                TY_REF => backend.get_ref_value(frame, index).0 as i64,
                TY_FLOAT => float_hash(backend.get_float_value(frame, index)),
                tag => unreachable!("bad guard type tag {tag:#x}"),
            };
            self.guard_value_hash(intval)
        };
        jit.counter.tick(hash, driver.trace_eagerness())
    }

    /// Counter hash for one observed value at this guard. Different guards
    /// may collide; they then share a count.
    pub fn guard_value_hash(&self, intval: i64) -> u32 {
        let addr = self as *const Self as usize as u64;
        addr.wrapping_mul(777767777)
            .wrapping_add((intval as u64).wrapping_mul(1442968193)) as u32
    }

    /// Called when compiled code exits through this guard.
    pub fn handle_fail(
        self: &Rc<Self>,
        jit: &mut JitContext,
        driver: &Rc<JitDriver>,
        hooks: &mut dyn InterpreterHooks,
        frame: &mut DeadFrame,
    ) -> Result<FrameExit, JitError> {
        if let GuardKind::Forced { driver: owner } = self.kind {
            // Never compiled: pick up what force_now stored, if anything.
            debug_assert_eq!(owner, driver.id);
            let all_virtuals = frame.take_forced_virtuals().unwrap_or_else(VirtualCache::empty);
            jit.stats.blackholes += 1;
            return hooks.resume_in_blackhole(jit, driver, self, frame, Some(&all_virtuals));
        }
        if self.is_busy() {
            // re-entered while tracing from this guard: no counting at all
            trace!(target: "jit-guard", guard = %self.guard_opnum, "guard busy, resuming in blackhole");
            return hooks.resume_in_blackhole(jit, driver, self, frame, None);
        }
        jit.stats.guard_failures += 1;
        if self.must_compile(jit, driver, frame) {
            let _compiling = self.start_compiling();
            debug!(target: "jit-guard", guard = %self.guard_opnum, "tracing bridge from guard");
            jit.stats.bridge_traces += 1;
            hooks.trace_from_guard(jit, driver, self, frame)
        } else {
            trace!(target: "jit-guard", guard = %self.guard_opnum, "resuming in blackhole");
            jit.stats.blackholes += 1;
            hooks.resume_in_blackhole(jit, driver, self, frame, None)
        }
    }

    /// Attach a traced bridge to this guard and compile it.
    pub fn compile_and_attach(
        self: &Rc<Self>,
        jit: &mut JitContext,
        session: &TraceSession,
        new_loop: &mut Trace,
    ) -> Result<(), JitError> {
        let original = session
            .resumekey_original_loop_token
            .filter(|h| jit.registry.is_alive(*h))
            .ok_or(JitError::MissingOriginalToken)?;
        new_loop.original_token = Some(original);
        propagate_original_jitcell_token(new_loop);
        send_bridge_to_backend(jit, &session.driver, self, new_loop, original)?;
        self.bridges.set(self.bridges.get() + 1);
        Ok(())
    }
}

/// Keeps a guard descriptor busy; clears the flag when dropped, including
/// during unwinding.
#[must_use]
pub struct CompilingGuard<'a> {
    descr: &'a ResumeGuardDescr,
}

impl Drop for CompilingGuard<'_> {
    fn drop(&mut self) {
        self.descr.done_compiling();
    }
}

fn float_hash(value: f64) -> i64 {
    let bits = value.to_bits();
    (bits ^ (bits >> 32)) as i64
}

/// Build the descriptor for a guard the optimizer emits without one.
pub fn invent_fail_descr_for_op(opcode: OpCode, driver: &JitDriver) -> Rc<ResumeGuardDescr> {
    let kind = match opcode {
        OpCode::GuardNotForced | OpCode::GuardNotForced2 => GuardKind::Forced { driver: driver.id },
        OpCode::GuardNotInvalidated => GuardKind::NotInvalidated,
        OpCode::GuardFutureCondition => GuardKind::AtPosition,
        OpCode::GuardValue
        | OpCode::GuardNonnull
        | OpCode::GuardIsnull
        | OpCode::GuardNonnullClass
        | OpCode::GuardClass
        | OpCode::GuardTrue
        | OpCode::GuardFalse
        | OpCode::GuardException
        | OpCode::GuardNoException
        | OpCode::GuardOverflow
        | OpCode::GuardNoOverflow => GuardKind::Plain,
        other => unreachable!("no fail descriptor for {other}"),
    };
    Rc::new(ResumeGuardDescr::new(opcode, kind))
}

/// Resume point for a bridge that starts in the interpreter itself, at the
/// loop header identified by `original_greenkey`.
#[derive(Debug, Clone)]
pub struct ResumeFromInterpDescr {
    pub original_greenkey: GreenKey,
}

impl ResumeFromInterpDescr {
    pub fn new(original_greenkey: GreenKey) -> Self {
        ResumeFromInterpDescr { original_greenkey }
    }

    /// Compile `new_loop` (which ends in a jump to existing code) as a unit
    /// of its own and make it the procedure for the green key.
    pub fn compile_and_attach(
        &self,
        jit: &mut JitContext,
        session: &TraceSession,
        new_loop: &mut Trace,
        orig_inputargs: &[InputArg],
    ) -> Result<UnitHandle, JitError> {
        let driver = &session.driver;
        let token = jit.registry.make_unit(driver.id);
        new_loop.original_token = Some(token);
        propagate_original_jitcell_token(new_loop);
        if let Err(err) = send_loop_to_backend(
            jit,
            Some(&self.original_greenkey),
            driver,
            new_loop,
            "entry bridge",
            orig_inputargs,
        ) {
            jit.registry.release(token);
            return Err(err);
        }
        driver
            .warmstate
            .borrow_mut()
            .attach_procedure_to_interp(self.original_greenkey.clone(), token);
        jit.stats.entry_bridges += 1;
        Ok(token)
    }
}
