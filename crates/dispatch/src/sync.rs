//! Inline backend: `submit` runs the task before returning.

use std::sync::Arc;

use async_trait::async_trait;
use eval::Evaluator;

use crate::backend::by_index;
use crate::{execute_task, DispatchBackend, DispatchError, TaskHandle, TaskOutcome, TaskRequest};

pub struct SyncBackend {
    evaluator: Arc<dyn Evaluator>,
    done: Vec<TaskOutcome>,
}

impl SyncBackend {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            done: Vec::new(),
        }
    }
}

#[async_trait]
impl DispatchBackend for SyncBackend {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn submit(&mut self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        let outcome = execute_task(self.evaluator.as_ref(), &request);
        self.done.push(outcome);
        Ok(request.handle())
    }

    async fn await_all(&mut self) -> Result<Vec<TaskOutcome>, DispatchError> {
        Ok(by_index(std::mem::take(&mut self.done)))
    }
}
