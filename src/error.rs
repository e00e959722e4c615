//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::jit::BackendError;

/// Failures of the compile and deoptimization paths.
///
/// An optimizer rejection is not among them: it is reported as
/// [`InvalidLoop`](crate::jit::InvalidLoop) and turned into "nothing
/// compiled" by the compile entry points.
#[derive(Debug, Error)]
pub enum JitError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Stop tracing and continue in the blackhole interpreter.
    #[error("switching to the blackhole interpreter")]
    SwitchToBlackhole,
    #[error("the unit this trace belongs to has been freed")]
    MissingOriginalToken,
    #[error("no compiled procedure for this green key")]
    NoProcedureToken,
    #[error("interrupted")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum TraceFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse trace file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("operation {index} uses undefined value `{name}`")]
    UndefinedValue { index: usize, name: String },
    #[error("operation {index}: {reason}")]
    Malformed { index: usize, reason: String },
}

/// Failures of a scripted run of a trace file.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    TraceFile(#[from] TraceFileError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Jit(#[from] JitError),
    #[error("the loop could not be compiled")]
    LoopNotCompiled,
    #[error("no compiled guard labelled `{0}`")]
    UnknownGuard(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_is_transparent() {
        let err = JitError::from(BackendError::Rejected {
            what: "loop".to_string(),
            reason: "full".to_string(),
        });
        assert_eq!(err.to_string(), BackendError::Rejected {
            what: "loop".to_string(),
            reason: "full".to_string(),
        }
        .to_string());
    }
}
