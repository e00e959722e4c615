//! Compilation statistics.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Counters for one context. Serialized for `--stats=json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitStats {
    pub loops_compiled: u64,
    pub bridges_compiled: u64,
    pub entry_bridges: u64,
    pub invalid_loops: u64,
    pub retraces_requested: u64,
    pub guard_failures: u64,
    pub bridge_traces: u64,
    pub blackholes: u64,
    pub forcings: u64,
    pub freed_loops: u64,
    pub optimize_us: u64,
    pub backend_us: u64,
    /// Names of every loop submitted, in order.
    #[serde(skip)]
    pub loop_names: Vec<String>,
    #[serde(skip)]
    next_loop: u64,
}

impl JitStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name for the next trace being assembled.
    pub fn name_for_new_loop(&mut self) -> String {
        let name = format!("Loop-{}", self.next_loop);
        self.next_loop += 1;
        name
    }

    pub fn add_new_loop(&mut self, name: &str) {
        self.loops_compiled += 1;
        self.loop_names.push(name.to_string());
    }

    pub fn add_optimize_time(&mut self, elapsed: Duration) {
        self.optimize_us += elapsed.as_micros() as u64;
    }

    pub fn add_backend_time(&mut self, elapsed: Duration) {
        self.backend_us += elapsed.as_micros() as u64;
    }
}

impl fmt::Display for JitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "loops compiled:     {}", self.loops_compiled)?;
        writeln!(f, "bridges compiled:   {}", self.bridges_compiled)?;
        writeln!(f, "entry bridges:      {}", self.entry_bridges)?;
        writeln!(f, "invalid loops:      {}", self.invalid_loops)?;
        writeln!(f, "retraces requested: {}", self.retraces_requested)?;
        writeln!(f, "guard failures:     {}", self.guard_failures)?;
        writeln!(f, "bridge traces:      {}", self.bridge_traces)?;
        writeln!(f, "blackholes:         {}", self.blackholes)?;
        writeln!(f, "forcings:           {}", self.forcings)?;
        writeln!(f, "freed loops:        {}", self.freed_loops)?;
        writeln!(f, "optimize time:      {}us", self.optimize_us)?;
        write!(f, "backend time:       {}us", self.backend_us)
    }
}
