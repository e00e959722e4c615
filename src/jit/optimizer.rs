//! Contract between the compile driver and the trace optimizer.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::ir::{Arg, ForwardingTable, Operation, QuasiImmutId, Type, Value, ValueAllocator, Var};
use crate::jit::counter::JitCounter;
use crate::jit::driver::{JitDriver, OptimizerConfig};
use crate::jit::token::UnitRegistry;

/// The optimizer proved the trace cannot be compiled soundly.
///
/// Recoverable: the compile attempt is abandoned and the interpreter keeps
/// running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid loop: {reason}")]
pub struct InvalidLoop {
    pub reason: String,
}

impl InvalidLoop {
    pub fn new(reason: impl Into<String>) -> Self {
        InvalidLoop { reason: reason.into() }
    }
}

/// Key of a memoized pure call: the constant arguments, function first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallPureKey(Vec<u64>);

impl CallPureKey {
    pub fn new(args: &[Value]) -> Self {
        CallPureKey(
            args.iter()
                .map(|v| match v {
                    Value::Int(n) => *n as u64,
                    Value::Ref(r) => r.0,
                    Value::Float(x) => x.to_bits(),
                    Value::Void => 0,
                })
                .collect(),
        )
    }
}

/// Results of pure calls observed while tracing.
pub type CallPureResults = HashMap<CallPureKey, Value>;

/// What a preamble pass hands to the peeled-loop pass.
#[derive(Debug, Clone, Default)]
pub struct ExportedState {
    /// Inputs of the preamble label.
    pub renamed_inputargs: Vec<Var>,
    /// Values flowing into the loop header at the end of the preamble, one
    /// per original input.
    pub end_args: Vec<Arg>,
    pub quasi_immutable_deps: BTreeSet<QuasiImmutId>,
}

/// Result description of one optimizer pass.
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    pub inputargs: Vec<Var>,
    /// Inputs to use when the trace has to be retraced.
    pub renamed_inputargs: Vec<Var>,
    pub quasi_immutable_deps: BTreeSet<QuasiImmutId>,
    /// Header label of a peeled loop.
    pub label_op: Option<Operation>,
    /// Operations that must run just before `label_op`.
    pub extra_same_as: Vec<Operation>,
    /// Output of a preamble pass, or of a bridge that found no target.
    pub state: Option<ExportedState>,
    final_: bool,
}

impl LoopInfo {
    /// Info for a pass whose output is complete.
    pub fn finished(inputargs: Vec<Var>, quasi_immutable_deps: BTreeSet<QuasiImmutId>) -> Self {
        LoopInfo {
            renamed_inputargs: inputargs.clone(),
            inputargs,
            quasi_immutable_deps,
            final_: true,
            ..Self::default()
        }
    }

    /// Info for a pass that stops at a loop header it cannot close itself:
    /// a preamble, or a bridge with no matching entry point.
    pub fn exported(state: ExportedState) -> Self {
        LoopInfo {
            inputargs: state.renamed_inputargs.clone(),
            renamed_inputargs: state.renamed_inputargs.clone(),
            quasi_immutable_deps: state.quasi_immutable_deps.clone(),
            state: Some(state),
            final_: false,
            ..Self::default()
        }
    }

    /// Does the optimized trace end in code that can be submitted as is?
    pub fn is_final(&self) -> bool {
        self.final_
    }
}

/// Everything a pass may read or update besides its input operations.
pub struct OptContext<'a> {
    pub driver: &'a JitDriver,
    pub registry: &'a UnitRegistry,
    pub counter: &'a mut JitCounter,
    pub forwarding: &'a mut ForwardingTable,
    pub values: &'a mut ValueAllocator,
    pub enable_opts: &'a OptimizerConfig,
    pub call_pure_results: Option<&'a CallPureResults>,
}

impl OptContext<'_> {
    pub fn resolve(&self, arg: Arg) -> Arg {
        self.forwarding.resolve_arg(arg)
    }

    pub fn fresh(&mut self, ty: Type) -> Var {
        self.values.fresh(ty)
    }
}

/// The trace optimizer. Each method returns the pass description and the
/// optimized operations.
pub trait Optimizer {
    /// Single forward pass over `ops`, which start at `start_label`.
    fn propagate_all_forward(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        ops: &[Operation],
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop>;

    /// First pass of an unrolled loop. The returned info carries the
    /// [`ExportedState`] for [`optimize_peeled_loop`](Self::optimize_peeled_loop);
    /// the operations are the preamble body without a closing jump.
    fn optimize_preamble(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        end_label: &Operation,
        ops: &[Operation],
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop>;

    /// Second pass of an unrolled loop: one more iteration of `ops`, entered
    /// with `state`. The info carries the loop header label and the
    /// `extra_same_as` operations that precede it.
    fn optimize_peeled_loop(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        end_jump: &Operation,
        ops: &[Operation],
        state: &ExportedState,
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop>;

    /// Bridge ending in a jump to an existing unit. A non-final result means
    /// no entry of that unit fits and the loop must be retraced.
    fn optimize_bridge(
        &mut self,
        ctx: &mut OptContext<'_>,
        start_label: &Operation,
        ops: &[Operation],
        inline_short_preamble: bool,
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GcRef;

    #[test]
    fn test_loop_info_final() {
        let info = LoopInfo::finished(vec![Var::int(0)], BTreeSet::new());
        assert!(info.is_final());
        assert_eq!(info.renamed_inputargs, info.inputargs);
    }

    #[test]
    fn test_loop_info_exported() {
        let state = ExportedState {
            renamed_inputargs: vec![Var::int(3)],
            end_args: vec![Arg::int(1)],
            quasi_immutable_deps: [QuasiImmutId(2)].into_iter().collect(),
        };
        let info = LoopInfo::exported(state);
        assert!(!info.is_final());
        assert_eq!(info.renamed_inputargs, vec![Var::int(3)]);
        assert!(info.quasi_immutable_deps.contains(&QuasiImmutId(2)));
    }

    #[test]
    fn test_call_pure_key() {
        let a = CallPureKey::new(&[Value::Int(1), Value::Ref(GcRef(2))]);
        let b = CallPureKey::new(&[Value::Int(1), Value::Ref(GcRef(2))]);
        assert_eq!(a, b);
        assert_ne!(a, CallPureKey::new(&[Value::Int(1)]));
    }
}
