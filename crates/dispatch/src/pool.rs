//! Bounded local worker pool.
//!
//! Tasks run on tokio's blocking threads; a semaphore caps how many run at
//! once. The semaphore is created on the first submission of a step, sized
//! to the lesser of `max_jobs` and the step's group count, and dropped once
//! the step's tasks have been awaited.

use std::sync::Arc;

use async_trait::async_trait;
use eval::Evaluator;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::backend::by_index;
use crate::{
    execute_task, DispatchBackend, DispatchError, Interrupt, TaskHandle, TaskOutcome,
    TaskRequest,
};

type Running = (TaskHandle, JoinHandle<Result<TaskOutcome, JoinError>>);

pub struct LocalPool {
    evaluator: Arc<dyn Evaluator>,
    max_jobs: usize,
    size: usize,
    permits: Option<Arc<Semaphore>>,
    running: Vec<Running>,
    interrupt: Interrupt,
}

impl LocalPool {
    pub fn new(evaluator: Arc<dyn Evaluator>, max_jobs: usize) -> Self {
        let max_jobs = max_jobs.max(1);
        Self {
            evaluator,
            max_jobs,
            size: max_jobs,
            permits: None,
            running: Vec::new(),
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Number of workers the pool runs with (or will start with).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_started(&self) -> bool {
        self.permits.is_some()
    }
}

#[async_trait]
impl DispatchBackend for LocalPool {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn prepare(&mut self, groups: usize) {
        self.size = self.max_jobs.min(groups).max(1);
    }

    async fn submit(&mut self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        let size = self.size;
        let permits = self
            .permits
            .get_or_insert_with(|| {
                info!("starting local pool with {size} workers");
                Arc::new(Semaphore::new(size))
            })
            .clone();

        let handle = request.handle();
        let evaluator = Arc::clone(&self.evaluator);
        let queued = handle.clone();
        let join = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Ok(TaskOutcome::failure(&queued, "pool shut down before the task started"));
            };
            tokio::task::spawn_blocking(move || execute_task(evaluator.as_ref(), &request)).await
        });
        debug!("queued task {} for group {}", handle.task_id, handle.index);
        self.running.push((handle.clone(), join));
        Ok(handle)
    }

    async fn await_all(&mut self) -> Result<Vec<TaskOutcome>, DispatchError> {
        let running = std::mem::take(&mut self.running);
        let aborts: Vec<_> = running.iter().map(|(_, join)| join.abort_handle()).collect();

        let collect = async move {
            let mut outcomes = Vec::with_capacity(running.len());
            for (handle, join) in running {
                let outcome = match join.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) | Err(e) => {
                        TaskOutcome::failure(&handle, format!("worker did not finish: {e}"))
                    }
                };
                outcomes.push(outcome);
            }
            outcomes
        };

        let result = tokio::select! {
            outcomes = collect => Ok(by_index(outcomes)),
            _ = self.interrupt.wait() => {
                warn!("interrupted, stopping {} queued tasks", aborts.len());
                if let Some(permits) = &self.permits {
                    permits.close();
                }
                for abort in &aborts {
                    abort.abort();
                }
                Err(DispatchError::Interrupted { pid: std::process::id() })
            }
        };

        if self.permits.take().is_some() {
            debug!("local pool drained");
        }
        result
    }
}
