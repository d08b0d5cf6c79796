//! A [`Broker`] backed by the task marker store.
//!
//! `enqueue` writes the definition, the submission script and a job id
//! marker; whatever runs the script (a scheduler, a remote shell, a test
//! thread) calls [`crate::run_marked_task`]. `fetch_result` reads status
//! the same way the task monitor does.

use async_trait::async_trait;
use tasks::{MarkerKind, TaskError, TaskMonitor, TaskStatus};
use tracing::debug;
use uuid::Uuid;

use crate::{Broker, BrokerError, TaskHandle, TaskOutcome, TaskRequest};

const DEFAULT_COMMAND: &str = "stepflow execute {task}";

#[derive(Debug, Clone)]
pub struct MarkerBroker {
    monitor: TaskMonitor,
    command: String,
}

impl MarkerBroker {
    pub fn new(monitor: TaskMonitor) -> Self {
        Self {
            monitor,
            command: DEFAULT_COMMAND.into(),
        }
    }

    /// Command line of the submission script; `{task}` is replaced by the
    /// task id.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn transient(e: TaskError) -> BrokerError {
        BrokerError::Transient(e.to_string())
    }
}

#[async_trait]
impl Broker for MarkerBroker {
    async fn enqueue(&self, request: &TaskRequest) -> Result<String, BrokerError> {
        let store = self.monitor.store();
        let fatal = |e: TaskError| BrokerError::Fatal(e.to_string());

        // markers of an earlier run of the same task must not be mistaken
        // for this one
        for kind in [MarkerKind::Result, MarkerKind::Pulse] {
            store.remove_marker(&request.id, kind).map_err(fatal)?;
        }

        store.write_definition(&request.to_definition()).map_err(fatal)?;
        let script = format!(
            "#!/bin/sh\n{}\n",
            self.command.replace("{task}", &request.id)
        );
        store
            .write_text(&request.id, MarkerKind::Script, &script)
            .map_err(fatal)?;
        let job_id = Uuid::new_v4().to_string();
        store
            .write_text(&request.id, MarkerKind::JobId, &job_id)
            .map_err(fatal)?;
        Ok(job_id)
    }

    async fn fetch_result(&self, handle: &TaskHandle) -> Result<Option<TaskOutcome>, BrokerError> {
        let monitor = self.monitor.clone();
        let id = handle.task_id.clone();
        let entry = tokio::task::spawn_blocking(move || monitor.check_task(&id, None))
            .await
            .map_err(|e| BrokerError::Fatal(e.to_string()))?
            .map_err(Self::transient)?;
        let status = entry.map_or(TaskStatus::Missing, |e| e.status);
        debug!("task {} is {status}", handle.task_id);

        match status {
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::SignatureMismatch => {
                let result = self
                    .monitor
                    .store()
                    .read_result(&handle.task_id)
                    .map_err(Self::transient)?;
                Ok(Some(TaskOutcome {
                    task_id: handle.task_id.clone(),
                    index: handle.index,
                    ret_code: result.ret_code,
                    output: result.output_files,
                    error: result.error,
                    skipped: false,
                }))
            }
            TaskStatus::Aborted | TaskStatus::Killed => {
                Ok(Some(TaskOutcome::failure(handle, format!("task was {status}"))))
            }
            TaskStatus::Missing => Err(BrokerError::Fatal(format!(
                "task {} has no definition",
                handle.task_id
            ))),
            TaskStatus::Pending | TaskStatus::Submitted | TaskStatus::Running => Ok(None),
        }
    }
}
