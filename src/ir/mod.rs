//! Trace intermediate representation.

mod dump;
mod forwarding;
mod history;
mod op;
mod trace;

pub use dump::format_ops;
pub use forwarding::ForwardingTable;
pub use history::{History, InputArg, ValueAllocator};
pub use op::{
    Arg, ArrayDescr, CallDescr, Descr, FieldDescr, GcRef, OpCode, Operation, QuasiImmutId, SizeDescr, Type,
    Value, ValueId, Var,
};
pub use trace::{ConsistencyError, Trace};
