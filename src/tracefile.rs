//! JSON trace files: a recorded loop plus the events to replay against it.
//!
//! Values are referred to by name. The first letter of a name gives its type
//! (`i` int, `p` ref, `f` float), the way the operation dumps print them.
//! Constants are written inline: `3`, `1.5`, or `{"ref": 4096}`.
//!
//! ```json
//! {
//!   "driver": {"name": "countdown"},
//!   "inputs": [{"name": "i0", "value": 100}],
//!   "loop": [
//!     {"result": "i1", "op": "int_gt", "args": ["i0", 0]},
//!     {"op": "guard_true", "args": ["i1"], "fail_args": ["i0"], "guard": "done"},
//!     {"result": "i2", "op": "int_sub", "args": ["i0", 1]}
//!   ],
//!   "jump": ["i2"],
//!   "failures": [{"guard": "done", "values": [0], "times": 3}]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::TraceFileError;
use crate::ir::{Arg, Descr, GcRef, History, OpCode, Operation, QuasiImmutId, Type, Value, Var};
use crate::jit::{JitDriver, ResumeData, invent_fail_descr_for_op};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceFile {
    pub driver: DriverSpec,
    #[serde(default)]
    pub greenkey: Vec<i64>,
    pub inputs: Vec<InputSpec>,
    #[serde(rename = "loop")]
    pub body: Vec<OpSpec>,
    pub jump: Vec<ArgSpec>,
    /// Histories traced when a guard of the loop gets hot.
    #[serde(default)]
    pub bridges: Vec<BridgeSpec>,
    /// Traces entering the loop from the interpreter at another green key.
    #[serde(default)]
    pub entry_bridges: Vec<EntrySpec>,
    #[serde(default)]
    pub failures: Vec<FailureSpec>,
    /// Quasi-immutable fields written after the failures are replayed.
    #[serde(default)]
    pub invalidate: Vec<QuasiImmutId>,
    #[serde(default)]
    pub tmp_callbacks: Vec<CallbackSpec>,
    /// Memory-manager generations to advance at the end of the run.
    #[serde(default)]
    pub generations: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSpec {
    pub name: String,
    #[serde(default = "default_red_args")]
    pub red_args: usize,
    #[serde(default = "default_result")]
    pub result: Type,
}

fn default_red_args() -> usize {
    1
}

fn default_result() -> Type {
    Type::Int
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub name: String,
    pub value: ValueSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Int(i64),
    Float(f64),
    Ref {
        #[serde(rename = "ref")]
        addr: u64,
    },
}

impl From<ValueSpec> for Value {
    fn from(spec: ValueSpec) -> Self {
        match spec {
            ValueSpec::Int(n) => Value::Int(n),
            ValueSpec::Float(x) => Value::Float(x),
            ValueSpec::Ref { addr } => Value::Ref(GcRef(addr)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Const(ValueSpec),
    Name(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpSpec {
    #[serde(default)]
    pub result: Option<String>,
    pub op: OpCode,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub fail_args: Vec<String>,
    /// Label failures and bridges use to refer to this guard.
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub quasi: Option<QuasiImmutId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSpec {
    pub guard: String,
    /// Names bound to the guard's fail arguments, in order.
    pub inputs: Vec<String>,
    #[serde(default)]
    pub ops: Vec<OpSpec>,
    #[serde(default)]
    pub jump: Option<Vec<ArgSpec>>,
    #[serde(default)]
    pub finish: Option<Vec<ArgSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrySpec {
    pub greenkey: Vec<i64>,
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub ops: Vec<OpSpec>,
    pub jump: Vec<ArgSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureSpec {
    pub guard: String,
    pub values: Vec<ValueSpec>,
    #[serde(default = "default_times")]
    pub times: u32,
}

fn default_times() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackSpec {
    pub greens: Vec<i64>,
    pub reds: Vec<Type>,
}

impl TraceFile {
    pub fn load(path: &Path) -> Result<Self, TraceFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| TraceFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, TraceFileError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Resume position of every labelled guard, loop guards first, then
    /// the guards of each bridge.
    pub fn guard_positions(&self) -> HashMap<String, u32> {
        let ops = self.body.iter().chain(self.bridges.iter().flat_map(|b| b.ops.iter()));
        ops.enumerate()
            .filter_map(|(position, op)| op.guard.clone().map(|label| (label, position as u32)))
            .collect()
    }
}

/// Records named operations into a history.
pub struct Recorder<'a> {
    pub history: History,
    names: HashMap<String, Var>,
    positions: &'a HashMap<String, u32>,
    driver: &'a JitDriver,
}

impl<'a> Recorder<'a> {
    pub fn new(driver: &'a JitDriver, positions: &'a HashMap<String, u32>) -> Self {
        Recorder {
            history: History::new(),
            names: HashMap::new(),
            positions,
            driver,
        }
    }

    /// Keep recording into `history`, which already holds a trace.
    pub fn continuing(history: History, driver: &'a JitDriver, positions: &'a HashMap<String, u32>) -> Self {
        Recorder {
            history,
            ..Recorder::new(driver, positions)
        }
    }

    pub fn input(&mut self, name: &str, value: Value) {
        let var = self.history.add_input(value);
        self.names.insert(name.to_string(), var);
    }

    pub fn inputs(&mut self, inputs: &[InputSpec]) {
        for input in inputs {
            self.input(&input.name, input.value.into());
        }
    }

    /// Bind `name` to an already recorded variable.
    pub fn alias(&mut self, name: &str, var: Var) {
        self.names.insert(name.to_string(), var);
    }

    pub fn var(&self, name: &str, index: usize) -> Result<Var, TraceFileError> {
        self.names.get(name).copied().ok_or_else(|| TraceFileError::UndefinedValue {
            index,
            name: name.to_string(),
        })
    }

    pub fn args(&self, args: &[ArgSpec], index: usize) -> Result<Vec<Arg>, TraceFileError> {
        args.iter()
            .map(|arg| match arg {
                ArgSpec::Const(value) => Ok(Arg::Const((*value).into())),
                ArgSpec::Name(name) => self.var(name, index).map(Arg::Var),
            })
            .collect()
    }

    pub fn ops(&mut self, ops: &[OpSpec]) -> Result<(), TraceFileError> {
        for (index, spec) in ops.iter().enumerate() {
            self.op(spec, index)?;
        }
        Ok(())
    }

    fn op(&mut self, spec: &OpSpec, index: usize) -> Result<(), TraceFileError> {
        if spec.op.is_final() || spec.op == OpCode::Label {
            return Err(TraceFileError::Malformed {
                index,
                reason: format!("`{}` cannot appear inside a trace body", spec.op),
            });
        }
        let mut op = Operation::new(spec.op, self.args(&spec.args, index)?);
        if spec.op.is_guard() {
            let descr = invent_fail_descr_for_op(spec.op, self.driver);
            if let Some(label) = &spec.guard {
                let position = self.positions.get(label).copied().unwrap_or_default();
                descr.set_resume_data(ResumeData::at_position(position));
            }
            let fail_args = spec
                .fail_args
                .iter()
                .map(|name| self.var(name, index).map(Some))
                .collect::<Result<Vec<_>, _>>()?;
            op = op.with_descr(Descr::Guard(descr)).with_fail_args(fail_args);
        }
        if let Some(field) = spec.quasi {
            op = op.with_descr(Descr::QuasiImmut(field));
        }
        if let Some(name) = &spec.result {
            let ty = type_of_name(name).ok_or_else(|| TraceFileError::Malformed {
                index,
                reason: format!("cannot tell the type of `{name}`"),
            })?;
            let var = self.history.values.fresh(ty);
            self.names.insert(name.clone(), var);
            op = op.with_result(var);
        }
        self.history.record_op(op);
        Ok(())
    }

    pub fn finish(mut self, closing: Operation) -> History {
        self.history.record_op(closing);
        self.history
    }
}

/// Type named by the first letter of a value name.
pub fn type_of_name(name: &str) -> Option<Type> {
    match name.chars().next()? {
        'i' => Some(Type::Int),
        'p' => Some(Type::Ref),
        'f' => Some(Type::Float),
        _ => None,
    }
}
