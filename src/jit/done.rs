//! Descriptors of the operations that leave compiled code for good.

use crate::ir::{GcRef, Type, Value};
use crate::jit::backend::Backend;
use crate::jit::frame::{DeadFrame, FrameExit};

/// Reserved exception object reported when a pending exception could not be
/// materialized. Never a valid heap address.
pub const MEMORY_ERROR: GcRef = GcRef(u64::MAX - 0xf);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalDescr {
    DoneVoid,
    DoneInt,
    DoneRef,
    DoneFloat,
    ExitFrameWithExceptionRef,
    /// Attached to the `guard_no_exception` of temporary callbacks.
    PropagateException,
}

impl FinalDescr {
    pub fn done_with_this_frame(result_type: Type) -> Self {
        match result_type {
            Type::Void => FinalDescr::DoneVoid,
            Type::Int => FinalDescr::DoneInt,
            Type::Ref => FinalDescr::DoneRef,
            Type::Float => FinalDescr::DoneFloat,
        }
    }

    /// Turn a frame that left through this descriptor into an exit.
    pub fn handle_fail(&self, backend: &dyn Backend, frame: &DeadFrame) -> FrameExit {
        match self {
            FinalDescr::DoneVoid => FrameExit::DoneWithThisFrame(Value::Void),
            FinalDescr::DoneInt => FrameExit::DoneWithThisFrame(Value::Int(backend.get_int_value(frame, 0))),
            FinalDescr::DoneRef => FrameExit::DoneWithThisFrame(Value::Ref(backend.get_ref_value(frame, 0))),
            FinalDescr::DoneFloat => {
                FrameExit::DoneWithThisFrame(Value::Float(backend.get_float_value(frame, 0)))
            }
            FinalDescr::ExitFrameWithExceptionRef => {
                FrameExit::ExitFrameWithException(backend.get_ref_value(frame, 0))
            }
            FinalDescr::PropagateException => {
                let mut exception = backend.grab_exc_value(frame);
                if exception.is_null() {
                    exception = MEMORY_ERROR;
                }
                FrameExit::ExitFrameWithException(exception)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::RecordingBackend;
    use crate::jit::frame::FailDescr;

    fn frame(values: Vec<Value>, exception: Option<GcRef>) -> DeadFrame {
        let mut f = DeadFrame::new(FailDescr::Final(FinalDescr::DoneVoid), values);
        f.exception = exception;
        f
    }

    #[test]
    fn test_done_int() {
        let backend = RecordingBackend::new();
        let exit = FinalDescr::DoneInt.handle_fail(&backend, &frame(vec![Value::Int(42)], None));
        assert_eq!(exit, FrameExit::DoneWithThisFrame(Value::Int(42)));
    }

    #[test]
    fn test_exit_with_exception() {
        let backend = RecordingBackend::new();
        let exit = FinalDescr::ExitFrameWithExceptionRef
            .handle_fail(&backend, &frame(vec![Value::Ref(GcRef(0x40))], None));
        assert_eq!(exit, FrameExit::ExitFrameWithException(GcRef(0x40)));
    }

    #[test]
    fn test_propagate_exception_uses_pending_exception() {
        let backend = RecordingBackend::new();
        let exit = FinalDescr::PropagateException.handle_fail(&backend, &frame(vec![], Some(GcRef(0x80))));
        assert_eq!(exit, FrameExit::ExitFrameWithException(GcRef(0x80)));
    }

    #[test]
    fn test_propagate_exception_without_exception_reports_memory_error() {
        let backend = RecordingBackend::new();
        let exit = FinalDescr::PropagateException.handle_fail(&backend, &frame(vec![], None));
        assert_eq!(exit, FrameExit::ExitFrameWithException(MEMORY_ERROR));
    }
}
