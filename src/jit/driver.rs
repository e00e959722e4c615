//! Per-driver static data: the compilation root a loop belongs to.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, JitConfig};
use crate::ir::{ArrayDescr, CallDescr, FieldDescr, GcRef, Type};
use crate::jit::done::FinalDescr;
use crate::jit::token::UnitHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(pub u32);

/// Values of the green (loop-invariant) variables identifying a loop site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GreenKey(pub Vec<i64>);

impl fmt::Display for GreenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(i64::to_string).collect();
        write!(f, "<{}>", parts.join(","))
    }
}

/// Optimization passes that can be switched on or off per driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimization {
    Intbounds,
    Rewrite,
    Virtualize,
    String,
    Pure,
    Earlyforce,
    Heap,
    Unroll,
}

impl Optimization {
    pub const ALL: [Optimization; 8] = [
        Optimization::Intbounds,
        Optimization::Rewrite,
        Optimization::Virtualize,
        Optimization::String,
        Optimization::Pure,
        Optimization::Earlyforce,
        Optimization::Heap,
        Optimization::Unroll,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Optimization::Intbounds => "intbounds",
            Optimization::Rewrite => "rewrite",
            Optimization::Virtualize => "virtualize",
            Optimization::String => "string",
            Optimization::Pure => "pure",
            Optimization::Earlyforce => "earlyforce",
            Optimization::Heap => "heap",
            Optimization::Unroll => "unroll",
        }
    }
}

impl FromStr for Optimization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Optimization::ALL
            .into_iter()
            .find(|opt| opt.name() == s)
            .ok_or_else(|| ConfigError::UnknownOptimization(s.to_string()))
    }
}

/// Set of enabled optimizations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptimizerConfig {
    enabled: BTreeSet<Optimization>,
}

impl OptimizerConfig {
    pub fn all() -> Self {
        OptimizerConfig {
            enabled: Optimization::ALL.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Parse `"all"` or a colon-separated list such as `"rewrite:unroll"`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec == "all" {
            return Ok(Self::all());
        }
        let mut enabled = BTreeSet::new();
        for part in spec.split(':').filter(|p| !p.is_empty()) {
            enabled.insert(part.parse()?);
        }
        Ok(OptimizerConfig { enabled })
    }

    pub fn contains(&self, opt: Optimization) -> bool {
        self.enabled.contains(&opt)
    }

    pub fn insert(&mut self, opt: Optimization) {
        self.enabled.insert(opt);
    }

    pub fn remove(&mut self, opt: Optimization) -> bool {
        self.enabled.remove(&opt)
    }

    /// Copy of this set with `opt` removed.
    pub fn without(&self, opt: Optimization) -> Self {
        let mut copy = self.clone();
        copy.remove(opt);
        copy
    }
}

impl fmt::Display for OptimizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.enabled.iter().map(|o| o.name()).collect();
        f.write_str(&names.join(":"))
    }
}

/// Mutable per-driver state: tuning knobs and the procedures attached to
/// each green key.
#[derive(Debug, Clone)]
pub struct WarmState {
    pub enable_opts: OptimizerConfig,
    /// Failures needed before a guard starts tracing a bridge.
    pub trace_eagerness: u32,
    procedures: HashMap<GreenKey, UnitHandle>,
}

impl WarmState {
    pub fn new(enable_opts: OptimizerConfig, trace_eagerness: u32) -> Self {
        WarmState {
            enable_opts,
            trace_eagerness,
            procedures: HashMap::new(),
        }
    }

    pub fn from_config(config: &JitConfig) -> Result<Self, ConfigError> {
        Ok(WarmState::new(config.optimizer_config()?, config.trace_eagerness))
    }

    /// Make `token` the unit the interpreter enters for `greenkey`.
    pub fn attach_procedure_to_interp(&mut self, greenkey: GreenKey, token: UnitHandle) {
        self.procedures.insert(greenkey, token);
    }

    pub fn get_procedure_token(&self, greenkey: &GreenKey) -> Option<UnitHandle> {
        self.procedures.get(greenkey).copied()
    }
}

impl Default for WarmState {
    fn default() -> Self {
        WarmState::new(OptimizerConfig::all(), 200)
    }
}

/// Lengths of a virtualizable's array fields, which vary per object.
pub trait VirtualizableLayout {
    fn array_length(&self, vable: GcRef, array_index: usize) -> usize;
}

/// Layout whose arrays always have the same lengths.
#[derive(Debug, Clone, Default)]
pub struct FixedLayout(pub Vec<usize>);

impl VirtualizableLayout for FixedLayout {
    fn array_length(&self, _vable: GcRef, array_index: usize) -> usize {
        self.0.get(array_index).copied().unwrap_or(0)
    }
}

/// Fields of the virtualizable frame object a loop keeps in registers.
#[derive(Clone)]
pub struct VirtualizableInfo {
    pub static_field_descrs: Vec<FieldDescr>,
    pub array_field_descrs: Vec<FieldDescr>,
    pub array_descrs: Vec<ArrayDescr>,
    pub layout: Rc<dyn VirtualizableLayout>,
}

impl VirtualizableInfo {
    pub fn get_array_length(&self, vable: GcRef, array_index: usize) -> usize {
        self.layout.array_length(vable, array_index)
    }
}

impl fmt::Debug for VirtualizableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualizableInfo")
            .field("static_field_descrs", &self.static_field_descrs)
            .field("array_field_descrs", &self.array_field_descrs)
            .finish_non_exhaustive()
    }
}

/// One jit driver: the outermost compilation root of a set of loops.
#[derive(Debug)]
pub struct JitDriver {
    pub id: DriverId,
    pub name: String,
    pub num_red_args: usize,
    pub result_type: Type,
    pub virtualizable: Option<VirtualizableInfo>,
    pub index_of_virtualizable: usize,
    pub portal_calldescr: CallDescr,
    pub portal_runner_adr: i64,
    pub warmstate: RefCell<WarmState>,
}

impl JitDriver {
    pub fn new(id: DriverId, name: impl Into<String>, num_red_args: usize, result_type: Type) -> Self {
        JitDriver {
            id,
            name: name.into(),
            num_red_args,
            result_type,
            virtualizable: None,
            index_of_virtualizable: 0,
            portal_calldescr: CallDescr {
                args: Vec::new(),
                result: result_type,
            },
            portal_runner_adr: 0,
            warmstate: RefCell::new(WarmState::default()),
        }
    }

    pub fn with_warmstate(self, warmstate: WarmState) -> Self {
        JitDriver {
            warmstate: RefCell::new(warmstate),
            ..self
        }
    }

    pub fn with_virtualizable(self, index: usize, info: VirtualizableInfo) -> Self {
        JitDriver {
            virtualizable: Some(info),
            index_of_virtualizable: index,
            ..self
        }
    }

    pub fn with_portal(self, calldescr: CallDescr, runner_adr: i64) -> Self {
        JitDriver {
            portal_calldescr: calldescr,
            portal_runner_adr: runner_adr,
            ..self
        }
    }

    /// Descriptor used by `finish` when the portal returns normally.
    pub fn done_descr(&self) -> FinalDescr {
        FinalDescr::done_with_this_frame(self.result_type)
    }

    pub fn trace_eagerness(&self) -> u32 {
        self.warmstate.borrow().trace_eagerness
    }

    pub fn enable_opts(&self) -> OptimizerConfig {
        self.warmstate.borrow().enable_opts.clone()
    }
}
