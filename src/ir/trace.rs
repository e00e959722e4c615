//! A trace being assembled for the backend.

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use super::forwarding::ForwardingTable;
use super::history::ValueAllocator;
use super::op::{Arg, OpCode, Operation, QuasiImmutId, ValueId, Var};
use crate::jit::UnitHandle;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsistencyError {
    #[error("{op} uses {value:?} before it is defined")]
    UndefinedValue { op: OpCode, value: Var },
    #[error("{0:?} is defined twice")]
    Redefined(Var),
    #[error("input {0:?} appears twice")]
    DuplicateInput(Var),
    #[error("trace does not end with jump or finish")]
    MissingFinalOp,
    #[error("{0} appears before the end of the trace")]
    EarlyFinalOp(OpCode),
}

/// Loop or bridge under construction.
///
/// Owned by the compile call that built it until [`record_loop_or_bridge`]
/// detaches it from its unit.
///
/// [`record_loop_or_bridge`]: crate::jit::record_loop_or_bridge
#[derive(Debug, Clone)]
pub struct Trace {
    pub name: String,
    pub inputargs: Vec<Var>,
    pub operations: Vec<Operation>,
    pub original_token: Option<UnitHandle>,
    pub quasi_immutable_deps: BTreeSet<QuasiImmutId>,
    /// Scratch replacements; empty once the trace reaches the backend.
    pub forwarding: ForwardingTable,
    pub values: ValueAllocator,
    /// Loop number assigned on submission, kept after detaching.
    pub number: Option<u64>,
}

impl Trace {
    pub fn new(name: impl Into<String>, values: ValueAllocator) -> Self {
        Trace {
            name: name.into(),
            inputargs: Vec::new(),
            operations: Vec::new(),
            original_token: None,
            quasi_immutable_deps: BTreeSet::new(),
            forwarding: ForwardingTable::new(),
            values,
            number: None,
        }
    }

    /// Resolve every pending replacement into the operations, then drop the
    /// table.
    pub fn forget_optimization_info(&mut self) {
        if self.forwarding.is_empty() {
            return;
        }
        for op in self.operations.iter_mut() {
            self.forwarding.apply(op);
        }
        self.forwarding.clear();
    }

    /// Check that every value is defined before use and the trace is closed.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        let mut seen = HashSet::new();
        for var in &self.inputargs {
            if !seen.insert(var.id) {
                return Err(ConsistencyError::DuplicateInput(*var));
            }
        }
        Self::check_consistency_of_branch(&self.operations, seen)
    }

    /// Same as [`check_consistency`](Self::check_consistency) for an
    /// operation list whose inputs are `seen`.
    pub fn check_consistency_of_branch(
        operations: &[Operation],
        mut seen: HashSet<ValueId>,
    ) -> Result<(), ConsistencyError> {
        let Some(last) = operations.last() else {
            return Err(ConsistencyError::MissingFinalOp);
        };
        if !last.opcode.is_final() {
            return Err(ConsistencyError::MissingFinalOp);
        }
        let end = operations.len() - 1;
        for (i, op) in operations.iter().enumerate() {
            if i < end && op.opcode.is_final() {
                return Err(ConsistencyError::EarlyFinalOp(op.opcode));
            }
            for arg in &op.args {
                if let Arg::Var(v) = arg
                    && !seen.contains(&v.id)
                {
                    return Err(ConsistencyError::UndefinedValue { op: op.opcode, value: *v });
                }
            }
            for v in op.fail_args().iter().flatten() {
                if !seen.contains(&v.id) {
                    return Err(ConsistencyError::UndefinedValue { op: op.opcode, value: *v });
                }
            }
            if op.opcode == OpCode::Label {
                seen = op.label_args().iter().map(|v| v.id).collect();
                continue;
            }
            if let Some(result) = op.result
                && !seen.insert(result.id)
            {
                return Err(ConsistencyError::Redefined(result));
            }
        }
        Ok(())
    }
}
