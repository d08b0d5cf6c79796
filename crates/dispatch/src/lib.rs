//! `dispatch` crate: how a step hands work to something that runs it.
//!
//! Every backend implements [`DispatchBackend`]: requests are submitted in
//! group order and [`DispatchBackend::await_all`] returns one
//! [`TaskOutcome`] per submission, ordered by group index whatever order
//! the tasks finished in.
//!
//! - [`SyncBackend`] runs each task inline.
//! - [`LocalPool`] runs tasks on a bounded pool of blocking threads.
//! - [`RemoteQueue`] hands requests to a [`Broker`] and polls for results.
//!   [`MarkerBroker`] is a broker backed by the task marker store; the
//!   matching worker side is [`run_marked_task`].

pub mod backend;
pub mod error;
pub mod marker;
pub mod pool;
pub mod remote;
pub mod request;
pub mod runner;
pub mod sync;
pub mod worker;

pub use backend::{BackendKind, DispatchBackend, Interrupt};
pub use error::DispatchError;
pub use marker::MarkerBroker;
pub use pool::LocalPool;
pub use remote::{Broker, BrokerError, RemoteConfig, RemoteQueue};
pub use request::{task_id, TaskHandle, TaskOutcome, TaskRequest};
pub use runner::execute_task;
pub use sync::SyncBackend;
pub use worker::run_marked_task;
