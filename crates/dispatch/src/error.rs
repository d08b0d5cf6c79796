//! Dispatch-level error type.

use tasks::TaskError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    // -----------------------------------------------------------------------
    // Interruption
    // -----------------------------------------------------------------------
    /// The awaiting process was interrupted. Not a task failure.
    #[error("interrupted while awaiting dispatched tasks (process {pid})")]
    Interrupted { pid: u32 },

    // -----------------------------------------------------------------------
    // Remote queue
    // -----------------------------------------------------------------------
    #[error("broker failed for task {task_id}: {message}")]
    Broker { task_id: String, message: String },

    #[error("giving up on task {task_id} after {attempts} failed reads: {message}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        message: String,
    },

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------
    #[error("task {0} was killed")]
    Killed(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}
