//! `tasks` crate: the on-disk marker protocol of dispatched tasks and the
//! lifecycle monitor built on it.
//!
//! A dispatched task has no live status channel. Its state is derived from
//! a handful of marker files next to each other in a task store:
//!
//! | suffix    | meaning                                        |
//! |-----------|------------------------------------------------|
//! | `.task`   | definition, written when the task is created   |
//! | `.pulse`  | heartbeat, touched by a live worker            |
//! | `.res`    | result, written when the worker finishes       |
//! | `.sh`     | submission script, written on remote submission|
//! | `.job_id` | job id returned by the remote submitter        |
//!
//! [`status::classify`] turns marker timestamps into a verdict without
//! touching the filesystem; [`TaskMonitor`] drives it against a real store.

pub mod age;
pub mod cache;
pub mod clock;
pub mod error;
pub mod lock;
pub mod markers;
pub mod monitor;
pub mod status;

pub use age::AgeFilter;
pub use cache::StatusCache;
pub use clock::{Clock, SystemClock};
pub use error::TaskError;
pub use markers::{MarkerKind, TaskDefinition, TaskResult, TaskStore};
pub use monitor::{
    MonitorConfig, PurgeOptions, PurgeSummary, TaskFilter, TaskMonitor, TaskReport,
};
pub use status::{StatusEntry, TaskStatus};
