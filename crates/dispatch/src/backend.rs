//! The submit/await contract shared by all dispatch backends.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{DispatchError, TaskHandle, TaskOutcome, TaskRequest};

#[async_trait]
pub trait DispatchBackend: Send {
    fn name(&self) -> &'static str;

    /// Called once per step, before the first submission, with the number
    /// of groups the step will process.
    fn prepare(&mut self, groups: usize) {
        let _ = groups;
    }

    async fn submit(&mut self, request: TaskRequest) -> Result<TaskHandle, DispatchError>;

    /// Wait for every task submitted since the last call. Outcomes are
    /// ordered by group index.
    ///
    /// # Errors
    /// [`DispatchError::Interrupted`] if the wait was interrupted; task
    /// failures are reported in the outcomes instead.
    async fn await_all(&mut self) -> Result<Vec<TaskOutcome>, DispatchError>;
}

/// Which backend a run dispatches to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sync,
    Pool,
    Remote,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(BackendKind::Sync),
            "pool" => Ok(BackendKind::Pool),
            "remote" => Ok(BackendKind::Remote),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Sync => "sync",
            BackendKind::Pool => "pool",
            BackendKind::Remote => "remote",
        })
    }
}

/// Interrupt source for backends that wait: Ctrl-C, or an explicit
/// [`Interrupt::trigger`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    notify: Arc<Notify>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the current (or the next) wait.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    self.notify.notified().await;
                }
            }
            _ = self.notify.notified() => {}
        }
    }
}

/// Order outcomes by group index.
pub(crate) fn by_index(mut outcomes: Vec<TaskOutcome>) -> Vec<TaskOutcome> {
    outcomes.sort_by_key(|o| o.index);
    outcomes
}
