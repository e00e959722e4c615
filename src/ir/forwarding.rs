//! Value replacement table used while a trace is being rewritten.
//!
//! The optimizer and the submission prologue both need to say "from now on,
//! uses of value X mean Y". Instead of stamping that onto the operations,
//! the mapping lives here and is dropped once the rewrite is done.

use std::collections::HashMap;

use super::op::{Arg, Operation, ValueId, Var};

#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    map: HashMap<ValueId, Arg>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every later use of `from` with `to`.
    pub fn forward(&mut self, from: Var, to: Arg) {
        if to.as_var() == Some(from) {
            return;
        }
        self.map.insert(from.id, to);
    }

    /// Follow the chain of replacements for one argument.
    pub fn resolve_arg(&self, arg: Arg) -> Arg {
        let mut current = arg;
        // Chains are short; bound the walk anyway so a cycle cannot hang us.
        for _ in 0..=self.map.len() {
            match current {
                Arg::Var(v) => match self.map.get(&v.id) {
                    Some(next) => current = *next,
                    None => return current,
                },
                Arg::Const(_) => return current,
            }
        }
        current
    }

    /// Like [`resolve_arg`](Self::resolve_arg) but for fail-argument slots,
    /// which can only hold variables. A slot forwarded to a constant keeps
    /// its original variable.
    pub fn resolve_var(&self, var: Var) -> Var {
        self.resolve_arg(Arg::Var(var)).as_var().unwrap_or(var)
    }

    pub fn get(&self, var: Var) -> Option<Arg> {
        self.map.get(&var.id).copied()
    }

    /// Rewrite the arguments and fail arguments of `op` in place.
    pub fn apply(&self, op: &mut Operation) {
        if self.map.is_empty() {
            return;
        }
        for arg in op.args.iter_mut() {
            *arg = self.resolve_arg(*arg);
        }
        if let Some(fail_args) = op.fail_args.as_mut() {
            for slot in fail_args.iter_mut().flatten() {
                *slot = self.resolve_var(*slot);
            }
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpCode, Value};

    #[test]
    fn test_resolves_chains() {
        let mut table = ForwardingTable::new();
        table.forward(Var::int(0), Arg::Var(Var::int(1)));
        table.forward(Var::int(1), Arg::int(7));
        assert_eq!(table.resolve_arg(Arg::Var(Var::int(0))), Arg::Const(Value::Int(7)));
        assert_eq!(table.resolve_arg(Arg::Var(Var::int(2))), Arg::Var(Var::int(2)));
    }

    #[test]
    fn test_self_forward_is_ignored() {
        let mut table = ForwardingTable::new();
        table.forward(Var::int(3), Arg::Var(Var::int(3)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_apply_rewrites_fail_args() {
        let mut table = ForwardingTable::new();
        table.forward(Var::int(0), Arg::Var(Var::int(5)));
        table.forward(Var::int(1), Arg::int(2));
        let mut op = Operation::new(OpCode::GuardTrue, vec![Arg::Var(Var::int(0))])
            .with_fail_args(vec![Some(Var::int(0)), None, Some(Var::int(1))]);
        table.apply(&mut op);
        assert_eq!(op.args[0], Arg::Var(Var::int(5)));
        assert_eq!(op.fail_args(), &[Some(Var::int(5)), None, Some(Var::int(1))]);
    }

    #[test]
    fn test_clear() {
        let mut table = ForwardingTable::new();
        table.forward(Var::int(0), Arg::int(1));
        assert_eq!(table.len(), 1);
        table.clear();
        assert!(table.is_empty());
    }
}
