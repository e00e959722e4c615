//! JIT configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Command-line flags are applied on top of the loaded file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jit::OptimizerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown optimization `{0}`")]
    UnknownOptimization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Guard failures before a bridge is traced.
    pub trace_eagerness: u32,
    /// `"all"` or a colon-separated list of optimization names.
    pub enable_opts: String,
    /// Generations a loop survives without being entered.
    pub loop_longevity: u64,
    /// Hit-counter table size, as a power of two.
    pub counter_bits: u32,
    /// Log compilation events at debug level.
    pub trace_jit: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            trace_eagerness: 200,
            enable_opts: "all".to_string(),
            loop_longevity: 1000,
            counter_bits: 12,
            trace_jit: false,
        }
    }
}

impl JitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(content)?;
        // reject bad optimization names at load time
        config.optimizer_config()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn optimizer_config(&self) -> Result<OptimizerConfig, ConfigError> {
        OptimizerConfig::parse(&self.enable_opts)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::jit::Optimization;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = JitConfig::from_toml("trace_eagerness = 3\n").unwrap();
        assert_eq!(config.trace_eagerness, 3);
        assert_eq!(config.loop_longevity, 1000);
        assert_eq!(config.enable_opts, "all");
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = JitConfig::default().to_toml().unwrap();
        assert!(text.contains("trace_eagerness = 200"));
        assert_eq!(JitConfig::from_toml(&text).unwrap(), JitConfig::default());
    }

    #[test]
    fn test_unknown_optimization_rejected() {
        let err = JitConfig::from_toml("enable_opts = \"rewrite:bogus\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOptimization(name) if name == "bogus"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enable_opts = \"rewrite:unroll\"").unwrap();
        writeln!(file, "counter_bits = 4").unwrap();
        let config = JitConfig::load(file.path()).unwrap();
        assert_eq!(config.counter_bits, 4);
        let opts = config.optimizer_config().unwrap();
        assert!(opts.contains(Optimization::Unroll));
        assert!(!opts.contains(Optimization::Pure));
    }
}
