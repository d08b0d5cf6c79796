//! Remote queue backend over a pluggable [`Broker`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::by_index;
use crate::{DispatchBackend, DispatchError, Interrupt, TaskHandle, TaskOutcome, TaskRequest};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    /// Worth retrying: a read raced a write, the broker was busy, ...
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("broker error: {0}")]
    Fatal(String),
}

/// External queue that accepts serialized requests and reports results.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queue a request; returns the broker's job id.
    async fn enqueue(&self, request: &TaskRequest) -> Result<String, BrokerError>;

    /// The outcome of a task, `None` while it has not finished.
    async fn fetch_result(&self, handle: &TaskHandle) -> Result<Option<TaskOutcome>, BrokerError>;
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Pause between polls of an unfinished task.
    pub poll_interval: Duration,
    /// Fixed back-off after a transient error.
    pub retry_delay: Duration,
    /// Consecutive transient errors tolerated per task.
    pub max_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_millis(500),
            max_retries: 5,
        }
    }
}

pub struct RemoteQueue {
    broker: Arc<dyn Broker>,
    config: RemoteConfig,
    pending: Vec<TaskHandle>,
    interrupt: Interrupt,
}

impl RemoteQueue {
    pub fn new(broker: Arc<dyn Broker>, config: RemoteConfig) -> Self {
        Self {
            broker,
            config,
            pending: Vec::new(),
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    async fn wait_for(&self, handle: &TaskHandle) -> Result<TaskOutcome, DispatchError> {
        let mut failures = 0u32;
        loop {
            match self.broker.fetch_result(handle).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    failures = 0;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(BrokerError::Transient(message)) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(DispatchError::RetriesExhausted {
                            task_id: handle.task_id.clone(),
                            attempts: failures,
                            message,
                        });
                    }
                    warn!(
                        "reading result of {} failed (attempt {}/{}): {message}",
                        handle.task_id, failures, self.config.max_retries
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(BrokerError::Fatal(message)) => {
                    return Err(DispatchError::Broker {
                        task_id: handle.task_id.clone(),
                        message,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl DispatchBackend for RemoteQueue {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn submit(&mut self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        let handle = request.handle();
        let job_id = self
            .broker
            .enqueue(&request)
            .await
            .map_err(|e| DispatchError::Broker {
                task_id: handle.task_id.clone(),
                message: e.to_string(),
            })?;
        info!("task {} submitted as job {job_id}", handle.task_id);
        self.pending.push(handle.clone());
        Ok(handle)
    }

    async fn await_all(&mut self) -> Result<Vec<TaskOutcome>, DispatchError> {
        let pending = std::mem::take(&mut self.pending);
        let this = &*self;
        let collect = async {
            let mut outcomes = Vec::with_capacity(pending.len());
            for handle in &pending {
                outcomes.push(this.wait_for(handle).await?);
                debug!("task {} finished", handle.task_id);
            }
            Ok::<_, DispatchError>(by_index(outcomes))
        };

        tokio::select! {
            outcomes = collect => outcomes,
            _ = this.interrupt.wait() => {
                Err(DispatchError::Interrupted { pid: std::process::id() })
            }
        }
    }
}
