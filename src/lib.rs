//! tracejit - compilation orchestration for a tracing JIT
//!
//! This library turns recorded traces into compiled loops and bridges,
//! manages guard failures and keeps compiled units alive while they are used.
//! The optimizer and the native backend plug in through traits.

pub mod config;
pub mod error;
pub mod ir;
pub mod jit;
pub mod sim;
pub mod tracefile;

// Re-export commonly used types
pub use config::JitConfig;
pub use error::{JitError, RunError, TraceFileError};
pub use jit::{JitContext, JitDriver, JitStats};
