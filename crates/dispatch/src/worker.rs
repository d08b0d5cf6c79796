//! Worker side of a marker-dispatched task.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use eval::{Evaluator, FileSet, FileSignature, FileTarget, Target};
use tasks::{MarkerKind, TaskResult, TaskStore};
use tracing::{info, warn};

use crate::{execute_task, DispatchError, TaskRequest};

/// Background thread that touches the pulse marker every `interval` until
/// stopped, or until the marker is made read-only by a kill.
struct Heartbeat {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Heartbeat {
    fn start(store: TaskStore, id: String, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel();
        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if !store.pulse_writable(&id) {
                        warn!("task {id} was killed, heartbeat stopped");
                        break;
                    }
                    if let Err(e) = store.touch_pulse(&id) {
                        warn!("heartbeat of {id} failed: {e}");
                        break;
                    }
                }
                _ => break,
            }
        });
        Self { stop, thread }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("heartbeat thread panicked");
        }
    }
}

fn signatures(files: Option<&FileSet>) -> BTreeMap<String, FileSignature> {
    files
        .and_then(FileSet::files)
        .unwrap_or_default()
        .iter()
        .filter_map(|path| match FileTarget::new(path).signature() {
            Ok(Some(signature)) => Some((path.clone(), signature)),
            _ => None,
        })
        .collect()
}

/// Run the task `id` of `store`: heartbeat while the script runs, then
/// write the result marker.
///
/// # Errors
/// [`DispatchError::Killed`] when the task was killed before it started or
/// while it ran; no result is written then.
pub fn run_marked_task(
    store: &TaskStore,
    id: &str,
    evaluator: &dyn Evaluator,
    interval: Duration,
) -> Result<TaskResult, DispatchError> {
    let killed = || store.mtime(id, MarkerKind::Pulse).is_some() && !store.pulse_writable(id);
    if killed() {
        return Err(DispatchError::Killed(id.to_owned()));
    }

    let request = TaskRequest::from_definition(store.read_definition(id)?);
    store.touch_pulse(id)?;
    let started_at = Utc::now();
    info!("running task {id}");

    let heartbeat = Heartbeat::start(store.clone(), id.to_owned(), interval);
    let outcome = execute_task(evaluator, &request);
    heartbeat.stop();

    if killed() {
        return Err(DispatchError::Killed(id.to_owned()));
    }

    let slots = &request.namespace.slots;
    let output = outcome.output.clone().map(FileSet::Files);
    let result = TaskResult {
        ret_code: outcome.ret_code,
        error: outcome.error,
        output_files: outcome.output,
        input: signatures(slots.step_input.as_ref()),
        output: signatures(output.as_ref().or(slots.step_output.as_ref())),
        depends: signatures(slots.step_depends.as_ref()),
        started_at,
        finished_at: Utc::now(),
    };
    store.write_result(id, &result)?;
    info!("task {id} finished with code {}", result.ret_code);
    Ok(result)
}
