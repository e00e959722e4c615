//! Compile requests and how each one drives the optimizer.

use std::time::Instant;

use tracing::debug;

use crate::ir::{ForwardingTable, Operation, ValueAllocator};
use crate::jit::context::JitContext;
use crate::jit::counter::JitCounter;
use crate::jit::driver::{JitDriver, Optimization, OptimizerConfig};
use crate::jit::optimizer::{CallPureResults, ExportedState, InvalidLoop, LoopInfo, OptContext, Optimizer};
use crate::jit::token::UnitRegistry;

#[derive(Debug, Clone)]
pub enum CompileKind {
    /// Flat loop or bridge, one forward pass.
    Simple,
    /// Preamble pass of an unrolled loop.
    Loop { end_label: Operation },
    /// Trace ending in a jump to another unit.
    Bridge { inline_short_preamble: bool },
    /// Peeled-loop pass, fed by a preamble's exported state.
    Unrolled { end_jump: Operation, state: ExportedState },
}

/// One request to the optimizer. Used for a single `optimize` call.
#[derive(Debug, Clone)]
pub struct CompileData {
    pub kind: CompileKind,
    pub start_label: Operation,
    pub operations: Vec<Operation>,
    pub call_pure_results: Option<CallPureResults>,
    pub enable_opts: OptimizerConfig,
    /// Replacements made while optimizing; cleared afterwards.
    pub forwarding: ForwardingTable,
}

/// Context pieces an optimize call borrows for its duration.
pub struct OptEnv<'a> {
    pub driver: &'a JitDriver,
    pub registry: &'a UnitRegistry,
    pub counter: &'a mut JitCounter,
    pub values: &'a mut ValueAllocator,
}

impl CompileData {
    fn new(
        kind: CompileKind,
        start_label: Operation,
        operations: Vec<Operation>,
        call_pure_results: Option<CallPureResults>,
        enable_opts: OptimizerConfig,
    ) -> Self {
        CompileData {
            kind,
            start_label,
            operations,
            call_pure_results,
            enable_opts,
            forwarding: ForwardingTable::new(),
        }
    }

    pub fn simple(
        start_label: Operation,
        operations: Vec<Operation>,
        call_pure_results: Option<CallPureResults>,
        enable_opts: OptimizerConfig,
    ) -> Self {
        Self::new(CompileKind::Simple, start_label, operations, call_pure_results, enable_opts)
    }

    pub fn loop_with_preamble(
        start_label: Operation,
        end_label: Operation,
        operations: Vec<Operation>,
        call_pure_results: Option<CallPureResults>,
        enable_opts: OptimizerConfig,
    ) -> Self {
        Self::new(
            CompileKind::Loop { end_label },
            start_label,
            operations,
            call_pure_results,
            enable_opts,
        )
    }

    pub fn bridge(
        start_label: Operation,
        operations: Vec<Operation>,
        call_pure_results: Option<CallPureResults>,
        enable_opts: OptimizerConfig,
        inline_short_preamble: bool,
    ) -> Self {
        Self::new(
            CompileKind::Bridge { inline_short_preamble },
            start_label,
            operations,
            call_pure_results,
            enable_opts,
        )
    }

    pub fn unrolled(
        start_label: Operation,
        end_jump: Operation,
        operations: Vec<Operation>,
        state: ExportedState,
        call_pure_results: Option<CallPureResults>,
        enable_opts: OptimizerConfig,
    ) -> Self {
        Self::new(
            CompileKind::Unrolled { end_jump, state },
            start_label,
            operations,
            call_pure_results,
            enable_opts,
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            CompileKind::Simple => "simple",
            CompileKind::Loop { .. } => "preamble",
            CompileKind::Bridge { .. } => "bridge",
            CompileKind::Unrolled { .. } => "peeled loop",
        }
    }

    /// Run the optimizer pass matching this request.
    pub fn optimize(
        &mut self,
        optimizer: &mut dyn Optimizer,
        env: OptEnv<'_>,
        unroll: bool,
    ) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
        let CompileData {
            kind,
            start_label,
            operations,
            call_pure_results,
            enable_opts,
            forwarding,
        } = self;
        let mut ctx = OptContext {
            driver: env.driver,
            registry: env.registry,
            counter: env.counter,
            forwarding,
            values: env.values,
            enable_opts,
            call_pure_results: call_pure_results.as_ref(),
        };
        match kind {
            CompileKind::Simple => optimizer.propagate_all_forward(&mut ctx, start_label, operations),
            CompileKind::Loop { end_label } => {
                if unroll {
                    optimizer.optimize_preamble(&mut ctx, start_label, end_label, operations)
                } else {
                    optimizer.propagate_all_forward(&mut ctx, start_label, operations)
                }
            }
            CompileKind::Bridge { inline_short_preamble } => {
                optimizer.optimize_bridge(&mut ctx, start_label, operations, *inline_short_preamble)
            }
            CompileKind::Unrolled { end_jump, state } => {
                debug_assert!(unroll, "peeled-loop pass with unrolling disabled");
                optimizer.optimize_peeled_loop(&mut ctx, start_label, end_jump, operations, state)
            }
        }
    }

    pub fn forget_optimization_info(&mut self) {
        self.forwarding.clear();
    }
}

/// Optimize `data` with the context's optimizer.
///
/// The request's replacement table is always cleared afterwards, whether
/// the pass succeeded or not.
pub fn optimize_trace(
    jit: &mut JitContext,
    driver: &JitDriver,
    data: &mut CompileData,
    values: &mut ValueAllocator,
) -> Result<(LoopInfo, Vec<Operation>), InvalidLoop> {
    let unroll = data.enable_opts.contains(Optimization::Unroll);
    let started = Instant::now();
    let JitContext {
        optimizer,
        registry,
        counter,
        stats,
        ..
    } = jit;
    let env = OptEnv {
        driver,
        registry,
        counter,
        values,
    };
    let result = data.optimize(optimizer.as_mut(), env, unroll);
    stats.add_optimize_time(started.elapsed());
    data.forget_optimization_info();
    match &result {
        Ok((_, ops)) => {
            debug!(target: "jit-compile", kind = data.kind_name(), ops = ops.len(), "optimized trace")
        }
        Err(err) => {
            stats.invalid_loops += 1;
            debug!(target: "jit-compile", kind = data.kind_name(), %err, "optimizer rejected trace");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Arg, Descr, OpCode, Var};
    use crate::jit::testing::{test_context, test_driver};
    use crate::jit::token::UnitHandle;

    fn simple_loop_data() -> CompileData {
        let x = Var::int(0);
        let y = Var::int(1);
        let label = Operation::label(&[x], Descr::Cell(UnitHandle::dangling()));
        let ops = vec![
            Operation::new(OpCode::IntAdd, vec![x.into(), Arg::int(1)]).with_result(y),
            Operation::jump(vec![y.into()], Descr::Cell(UnitHandle::dangling())),
        ];
        CompileData::simple(label, ops, None, OptimizerConfig::all())
    }

    #[test]
    fn test_simple_loop_keeps_single_input() {
        let mut jit = test_context();
        let driver = test_driver(3);
        let mut data = simple_loop_data();
        let mut values = ValueAllocator::starting_at(2);
        let (info, ops) = optimize_trace(&mut jit, &driver, &mut data, &mut values).unwrap();
        assert_eq!(info.inputargs, vec![Var::int(0)]);
        assert!(info.is_final());
        assert_eq!(ops.last().unwrap().opcode, OpCode::Jump);
    }

    #[test]
    fn test_forwarding_cleared_after_optimize() {
        let mut jit = test_context();
        let driver = test_driver(3);
        let mut data = simple_loop_data();
        data.operations.insert(
            0,
            Operation::new(OpCode::SameAs, vec![Var::int(0).into()]).with_result(Var::int(5)),
        );
        let mut values = ValueAllocator::starting_at(6);
        optimize_trace(&mut jit, &driver, &mut data, &mut values).unwrap();
        assert!(data.forwarding.is_empty());
    }

    #[test]
    fn test_forwarding_cleared_after_invalid_loop() {
        let mut jit = test_context();
        let driver = test_driver(3);
        let mut data = simple_loop_data();
        data.operations.insert(0, Operation::new(OpCode::GuardTrue, vec![Arg::int(0)]).with_fail_args(vec![]));
        let mut values = ValueAllocator::starting_at(2);
        assert!(optimize_trace(&mut jit, &driver, &mut data, &mut values).is_err());
        assert!(data.forwarding.is_empty());
        assert_eq!(jit.stats.invalid_loops, 1);
    }

    #[test]
    fn test_loop_without_unroll_uses_forward_pass() {
        let mut jit = test_context();
        let driver = test_driver(3);
        let simple = simple_loop_data();
        let end_label = Operation::label(&[Var::int(1)], Descr::Cell(UnitHandle::dangling()));
        let mut data = CompileData::loop_with_preamble(
            simple.start_label,
            end_label,
            simple.operations,
            None,
            OptimizerConfig::all().without(Optimization::Unroll),
        );
        let mut values = ValueAllocator::starting_at(2);
        let (info, _) = optimize_trace(&mut jit, &driver, &mut data, &mut values).unwrap();
        assert!(info.state.is_none());
    }
}
