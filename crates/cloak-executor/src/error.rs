//! Executor error types.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("empty command")]
    EmptyCommand,

    #[error("unresolved variables in `{template}`: {}", .names.join(", "))]
    Unresolved { template: String, names: Vec<String> },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}", .code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    ExitStatus { program: String, code: Option<i32> },

    #[error("{program} timed out after {:?}", .after)]
    Timeout { program: String, after: Duration },

    #[error("expected output {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
