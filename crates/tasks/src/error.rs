//! Error type for the task store and monitor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid task marker {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize task data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid age '{0}' (expected e.g. 3d, -2h, 30m, 45s)")]
    InvalidAge(String),

    #[error("unknown task status '{0}'")]
    UnknownStatus(String),

    #[error("cannot start monitor threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> TaskError {
    TaskError::Io {
        path: path.display().to_string(),
        source,
    }
}
