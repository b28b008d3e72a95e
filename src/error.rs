//! Error taxonomy for the scheduler core.
//!
//! A single enum gives each failure mode a named variant and a `Display`
//! message while staying a thin wrapper around the underlying cause, so
//! callers can distinguish, for example, a resource-exceeded ledger update
//! from a missing job.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum JqsError {
    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("resource limit exceeded: cores={new_cores}/{cores_total}, mem={new_mem}/{mem_mb_total}MB")]
    ResourceExceeded {
        new_cores: i64,
        cores_total: i64,
        new_mem: i64,
        mem_mb_total: i64,
    },

    #[error("resource usage cannot be negative")]
    Negative,

    #[error("supervisor failed to launch unit '{unit}' (exit code {code})")]
    SupervisorLaunchFailed { unit: String, code: i32 },

    #[error("supervisor failed to stop unit '{0}'")]
    SupervisorStopFailed(String),

    #[error("supervisor status query failed for unit '{0}'")]
    SupervisorStatusFailed(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid script header in {0}: {1}")]
    InvalidDirective(PathBuf, String),
}

impl JqsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, JqsError>;
