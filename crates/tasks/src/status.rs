//! Task status inference.
//!
//! Everything in this module is a pure function of marker timestamps, the
//! current time and the caller's previous hint, so the rules can be tested
//! without real files or real sleeps. [`crate::TaskMonitor`] collects the
//! timestamps and acts on the returned [`Verdict`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TaskError;

/// A pulse marker up to this many seconds older than the definition still
/// counts as written after it (coarse filesystem timestamps).
pub const PULSE_SKEW_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Missing,
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    SignatureMismatch,
    Aborted,
    /// Only reported by a kill request on a running task.
    Killed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Missing => "missing",
            TaskStatus::Pending => "pending",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::SignatureMismatch => "signature-mismatch",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Killed => "killed",
        }
    }

    /// Pending and running tasks can change without any cached marker
    /// changing, so their cache entries are never trusted blindly.
    pub fn is_volatile(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "missing" => TaskStatus::Missing,
            "pending" => TaskStatus::Pending,
            "submitted" => TaskStatus::Submitted,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "signature-mismatch" => TaskStatus::SignatureMismatch,
            "aborted" => TaskStatus::Aborted,
            "killed" => TaskStatus::Killed,
            other => return Err(TaskError::UnknownStatus(other.to_owned())),
        };
        Ok(status)
    }
}

/// Last known status of a task and the marker mtimes it was derived from.
/// An mtime of `0` records that the marker did not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: TaskStatus,
    pub files: BTreeMap<String, f64>,
}

/// Whether every marker recorded in a non-volatile `hint` is exactly as it
/// was. `current` returns the mtime of a path, `None` if it is absent.
pub fn hint_still_valid<F>(hint: &StatusEntry, current: F) -> bool
where
    F: Fn(&str) -> Option<f64>,
{
    if hint.status.is_volatile() {
        return false;
    }
    hint.files.iter().all(|(path, &recorded)| match current(path) {
        Some(mtime) => recorded != 0.0 && mtime == recorded,
        None => recorded == 0.0,
    })
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseMarker {
    pub mtime: f64,
    pub writable: bool,
}

/// Marker timestamps of one task, sampled at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkerTimes {
    pub definition: Option<f64>,
    pub pulse: Option<PulseMarker>,
    pub result: Option<f64>,
    pub script: Option<f64>,
    pub job_id: Option<f64>,
}

impl MarkerTimes {
    /// A result marker at least as new as the definition.
    pub fn fresh_result(&self) -> bool {
        matches!((self.definition, self.result), (Some(d), Some(r)) if r >= d)
    }

    /// A pulse marker written after (or just before) the definition.
    pub fn fresh_pulse(&self) -> Option<PulseMarker> {
        let definition = self.definition?;
        self.pulse
            .filter(|p| p.mtime >= definition - PULSE_SKEW_TOLERANCE)
    }

    /// A submission script newer than the definition, with a job id newer
    /// still.
    pub fn submitted(&self) -> bool {
        match (self.definition, self.script, self.job_id) {
            (Some(d), Some(s), Some(j)) => s >= d && j >= s,
            _ => false,
        }
    }
}

/// What the monitor should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Report(TaskStatus),
    /// The caller's hint is still accurate.
    Unchanged,
    /// A fresh result marker exists; its content decides the status.
    LoadResult,
    /// The heartbeat is overdue: look once more for a result that may have
    /// just arrived, otherwise the task is aborted.
    Overdue,
    /// Ambiguous heartbeat age: wait `2 * interval`, then compare the pulse
    /// mtime against `stamp` with [`classify_resample`].
    Resample { stamp: f64 },
}

fn running(hint: Option<TaskStatus>) -> Verdict {
    if hint == Some(TaskStatus::Running) {
        Verdict::Unchanged
    } else {
        Verdict::Report(TaskStatus::Running)
    }
}

/// Classify a task from its markers.
///
/// `hint_definition` is the definition mtime recorded with a `pending` hint.
pub fn classify(
    times: &MarkerTimes,
    now: f64,
    interval: f64,
    hint: Option<TaskStatus>,
    hint_definition: Option<f64>,
) -> Verdict {
    let Some(definition) = times.definition else {
        return Verdict::Report(TaskStatus::Missing);
    };

    if times.fresh_result() {
        return Verdict::LoadResult;
    }

    if let Some(pulse) = times.fresh_pulse() {
        if !pulse.writable {
            return Verdict::Report(TaskStatus::Aborted);
        }
        let elapsed = now - pulse.mtime;
        if elapsed < interval {
            return running(hint);
        }
        if elapsed > 2.0 * interval {
            return Verdict::Overdue;
        }
        return Verdict::Resample { stamp: pulse.mtime };
    }

    if times.submitted() {
        return Verdict::Report(TaskStatus::Submitted);
    }

    if hint == Some(TaskStatus::Pending) && hint_definition == Some(definition) {
        Verdict::Unchanged
    } else {
        Verdict::Report(TaskStatus::Pending)
    }
}

/// Second look after an overdue heartbeat.
pub fn classify_overdue(times: &MarkerTimes) -> Verdict {
    if times.fresh_result() {
        Verdict::LoadResult
    } else {
        Verdict::Report(TaskStatus::Aborted)
    }
}

/// Second look after waiting out an ambiguous heartbeat.
pub fn classify_resample(stamp: f64, times: &MarkerTimes, hint: Option<TaskStatus>) -> Verdict {
    if times.fresh_result() {
        return Verdict::LoadResult;
    }
    match times.pulse {
        Some(pulse) if pulse.mtime != stamp => running(hint),
        _ => Verdict::Report(TaskStatus::Aborted),
    }
}

/// Status of a task with a loaded result marker.
pub fn classify_result(ret_code: i32, files_unchanged: bool) -> TaskStatus {
    match (ret_code, files_unchanged) {
        (0, true) => TaskStatus::Completed,
        (0, false) => TaskStatus::SignatureMismatch,
        _ => TaskStatus::Failed,
    }
}
