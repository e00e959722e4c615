//! Recorded histories and the value-id allocator.

use super::op::{Arg, OpCode, Operation, Type, Value, Var};

/// Hands out fresh [`Var`]s for one tracing session.
#[derive(Debug, Clone, Default)]
pub struct ValueAllocator {
    next: u32,
}

impl ValueAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first fresh id is `next`.
    pub fn starting_at(next: u32) -> Self {
        ValueAllocator { next }
    }

    pub fn fresh(&mut self, ty: Type) -> Var {
        let var = Var::new(self.next, ty);
        self.next += 1;
        var
    }

    /// Make sure ids up to and including `var` are never handed out again.
    pub fn reserve(&mut self, var: Var) {
        if var.id.0 >= self.next {
            self.next = var.id.0 + 1;
        }
    }

    pub fn peek(&self) -> u32 {
        self.next
    }
}

/// An input argument of a history together with its runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputArg {
    pub var: Var,
    pub value: Value,
}

/// The linear record of operations produced by the tracer.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub inputargs: Vec<InputArg>,
    pub operations: Vec<Operation>,
    pub values: ValueAllocator,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input argument bound to `value`.
    pub fn add_input(&mut self, value: Value) -> Var {
        let var = self.values.fresh(value.ty());
        self.inputargs.push(InputArg { var, value });
        var
    }

    /// Add an input argument with an id chosen by the caller.
    pub fn add_input_var(&mut self, var: Var, value: Value) {
        self.values.reserve(var);
        self.inputargs.push(InputArg { var, value });
    }

    /// Record a value-producing (or void, for `Type::Void`) operation.
    pub fn record(&mut self, opcode: OpCode, args: Vec<Arg>, result_ty: Type) -> Option<Var> {
        let result = (result_ty != Type::Void).then(|| self.values.fresh(result_ty));
        let mut op = Operation::new(opcode, args);
        op.result = result;
        self.operations.push(op);
        result
    }

    pub fn record_guard(&mut self, opcode: OpCode, args: Vec<Arg>, fail_args: &[Var]) {
        debug_assert!(opcode.is_guard());
        let op = Operation::new(opcode, args).with_fail_args(fail_args.iter().copied().map(Some).collect());
        self.operations.push(op);
    }

    /// Append an already built operation, reserving its result id.
    pub fn record_op(&mut self, op: Operation) {
        if let Some(result) = op.result {
            self.values.reserve(result);
        }
        self.operations.push(op);
    }

    pub fn input_vars(&self) -> Vec<Var> {
        self.inputargs.iter().map(|a| a.var).collect()
    }

    pub fn ends_with_jump(&self) -> bool {
        self.operations.last().is_some_and(|op| op.opcode == OpCode::Jump)
    }
}
