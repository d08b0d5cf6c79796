//! Task Lifecycle Monitor: batch status checks, kill and purge over a task
//! store.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eval::{FileTarget, Target};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::status::{
    classify, classify_overdue, classify_resample, classify_result, hint_still_valid,
    MarkerTimes, PulseMarker, Verdict,
};
use crate::{
    AgeFilter, Clock, MarkerKind, StatusCache, StatusEntry, SystemClock, TaskError, TaskStatus,
    TaskStore,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directory holding the marker files.
    pub root: PathBuf,
    /// Heartbeat interval of workers; also the threshold for a live pulse.
    pub interval: Duration,
    /// Upper bound on concurrently checked tasks.
    pub max_concurrent: usize,
    /// Pause before re-reading a result marker caught mid-write.
    pub result_retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            root: TaskStore::default_root(),
            interval: Duration::from_secs(5),
            max_concurrent: 20,
            result_retry_delay: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Selection and reports
// ---------------------------------------------------------------------------

/// Narrows a task listing. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub age: Option<AgeFilter>,
    pub tags: Vec<String>,
    pub statuses: Vec<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub id: String,
    pub status: TaskStatus,
    /// Definition mtime; `None` for an id that matched no task.
    pub created: Option<f64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    pub ids: Vec<String>,
    /// Remove the whole marker tree, not only selected tasks.
    pub all: bool,
    pub filter: TaskFilter,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeSummary {
    pub tasks: Vec<String>,
    pub removed_files: usize,
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// TaskMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskMonitor {
    store: TaskStore,
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
}

impl TaskMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: TaskStore::new(config.root.clone()),
            config,
            clock,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn marker_key(&self, id: &str, kind: MarkerKind) -> String {
        self.store.marker(id, kind).display().to_string()
    }

    fn marker_times(&self, id: &str) -> MarkerTimes {
        MarkerTimes {
            definition: self.store.mtime(id, MarkerKind::Definition),
            pulse: self.store.mtime(id, MarkerKind::Pulse).map(|mtime| PulseMarker {
                mtime,
                writable: self.store.pulse_writable(id),
            }),
            result: self.store.mtime(id, MarkerKind::Result),
            script: self.store.mtime(id, MarkerKind::Script),
            job_id: self.store.mtime(id, MarkerKind::JobId),
        }
    }

    fn entry(&self, id: &str, status: TaskStatus) -> StatusEntry {
        let files = MarkerKind::ALL
            .iter()
            .map(|&kind| {
                (
                    self.marker_key(id, kind),
                    self.store.mtime(id, kind).unwrap_or(0.0),
                )
            })
            .collect();
        StatusEntry { status, files }
    }

    /// Derive the current status of one task.
    ///
    /// Returns `None` when `hint` is still accurate. Without a hint a status
    /// is always returned.
    pub fn check_task(
        &self,
        id: &str,
        hint: Option<&StatusEntry>,
    ) -> Result<Option<StatusEntry>, TaskError> {
        if let Some(hint) = hint {
            let still_valid = hint_still_valid(hint, |path| {
                fs::metadata(path).ok().map(|m| eval::target::mtime_secs(&m))
            });
            if still_valid {
                return Ok(None);
            }
        }

        let hint_status = hint.map(|h| h.status);
        let hint_definition = hint
            .and_then(|h| h.files.get(&self.marker_key(id, MarkerKind::Definition)))
            .copied()
            .filter(|&mtime| mtime != 0.0);
        let interval = self.config.interval.as_secs_f64();

        let mut verdict = classify(
            &self.marker_times(id),
            self.clock.now(),
            interval,
            hint_status,
            hint_definition,
        );
        loop {
            verdict = match verdict {
                Verdict::Report(status) => return Ok(Some(self.entry(id, status))),
                Verdict::Unchanged => return Ok(None),
                Verdict::LoadResult => {
                    let status = self.result_status(id)?;
                    return Ok(Some(self.entry(id, status)));
                }
                Verdict::Overdue => classify_overdue(&self.marker_times(id)),
                Verdict::Resample { stamp } => {
                    debug!("task {id}: ambiguous heartbeat, re-sampling");
                    self.clock.sleep(self.config.interval * 2);
                    classify_resample(stamp, &self.marker_times(id), hint_status)
                }
            };
        }
    }

    fn result_status(&self, id: &str) -> Result<TaskStatus, TaskError> {
        let result = match self.store.read_result(id) {
            Ok(result) => result,
            Err(TaskError::Parse { path, .. }) => {
                debug!("result {path} caught mid-write, retrying");
                self.clock.sleep(self.config.result_retry_delay);
                self.store.read_result(id)?
            }
            Err(e) => return Err(e),
        };

        let unchanged = result.signatures().all(|(path, recorded)| {
            match FileTarget::new(path).signature() {
                Ok(Some(current)) => &current == recorded,
                _ => false,
            }
        });
        Ok(classify_result(result.ret_code, unchanged))
    }

    /// Tasks matching `ids` (prefixes; everything when empty) after the age
    /// and tag filters. Status filters are left to the caller.
    fn select(
        &self,
        ids: &[String],
        filter: &TaskFilter,
    ) -> Result<Vec<(String, Option<f64>)>, TaskError> {
        let now = self.clock.now();
        let tasks = self
            .store
            .list(ids)?
            .into_iter()
            .filter(|(_, created)| match (&filter.age, created) {
                (None, _) => true,
                (Some(age), Some(created)) => age.matches(now - created),
                (Some(_), None) => false,
            })
            .filter(|(id, _)| {
                filter.tags.is_empty()
                    || self.store.tags(id).iter().any(|t| filter.tags.contains(t))
            })
            .collect();
        Ok(tasks)
    }

    /// Check many tasks with bounded concurrency and refresh the status
    /// cache. Reports are ordered oldest first.
    #[instrument(skip(self, ids, filter), fields(ids = ids.len()))]
    pub fn check_tasks(
        &self,
        ids: &[String],
        filter: &TaskFilter,
    ) -> Result<Vec<TaskReport>, TaskError> {
        let tasks = self.select(ids, filter)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let root = self.store.root();
        let hints = if root.is_dir() {
            StatusCache::read_locked(root)?
        } else {
            BTreeMap::new()
        };

        let threads = self.config.max_concurrent.min(tasks.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        let checked: Vec<Result<Option<StatusEntry>, TaskError>> = pool.install(|| {
            tasks
                .par_iter()
                .map(|(id, _)| self.check_task(id, hints.get(id)))
                .collect()
        });

        let mut reports = Vec::with_capacity(tasks.len());
        let mut current = BTreeMap::new();
        let mut changed = BTreeMap::new();
        for ((id, created), fresh) in tasks.into_iter().zip(checked) {
            let hint = hints.get(&id);
            let entry = match fresh? {
                Some(entry) => {
                    if hint != Some(&entry) {
                        changed.insert(id.clone(), entry.clone());
                    }
                    entry
                }
                None => match hint {
                    Some(hint) => hint.clone(),
                    None => continue,
                },
            };
            if entry.status != TaskStatus::Missing {
                current.insert(id.clone(), entry.clone());
            }
            if filter.statuses.is_empty() || filter.statuses.contains(&entry.status) {
                let tags = self.store.tags(&id);
                reports.push(TaskReport {
                    id,
                    status: entry.status,
                    created,
                    tags,
                });
            }
        }

        let rebuild = ids.is_empty() && filter.age.is_none() && filter.tags.is_empty();
        if changed.is_empty() && !rebuild {
            info!("No new status detected");
        } else if root.is_dir() {
            let saved = StatusCache::update(root, |cache| {
                if rebuild {
                    cache.replace_all(current);
                } else {
                    for (id, entry) in changed {
                        if entry.status == TaskStatus::Missing {
                            cache.remove(&id);
                        } else {
                            cache.insert(&id, entry);
                        }
                    }
                }
                cache.is_dirty()
            })?;
            if !saved {
                info!("No new status detected");
            }
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Kill
    // -----------------------------------------------------------------------

    /// Stop one task. Returns the status it was left in.
    pub fn kill_task(&self, id: &str) -> Result<TaskStatus, TaskError> {
        let status = self
            .check_task(id, None)?
            .map_or(TaskStatus::Missing, |entry| entry.status);
        let outcome = match status {
            TaskStatus::Pending | TaskStatus::Submitted => {
                self.store.freeze_pulse(id)?;
                TaskStatus::Aborted
            }
            TaskStatus::Running => {
                self.store.freeze_pulse(id)?;
                TaskStatus::Killed
            }
            other => other,
        };
        if let Err(e) = self.store.remove_marker(id, MarkerKind::Script) {
            warn!("failed to remove submission script of {id}: {e}");
        }
        info!("task {id}: {status} -> {outcome}");
        Ok(outcome)
    }

    pub fn kill_tasks(
        &self,
        ids: &[String],
        tags: &[String],
    ) -> Result<Vec<(String, TaskStatus)>, TaskError> {
        let filter = TaskFilter {
            tags: tags.to_vec(),
            ..TaskFilter::default()
        };
        let mut killed = Vec::new();
        for (id, created) in self.select(ids, &filter)? {
            if created.is_none() {
                warn!("no task matches '{id}'");
                continue;
            }
            let status = self.kill_task(&id)?;
            killed.push((id, status));
        }

        let root = self.store.root();
        if !killed.is_empty() && root.is_dir() {
            StatusCache::update(root, |cache| {
                for (id, _) in &killed {
                    cache.remove(id);
                }
            })?;
        }
        Ok(killed)
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    pub fn purge_tasks(&self, options: &PurgeOptions) -> Result<PurgeSummary, TaskError> {
        let root = self.store.root();
        if !root.is_dir() {
            return Ok(PurgeSummary::default());
        }
        if options.all {
            return Ok(self.purge_all());
        }

        let selected: Vec<String> = if options.filter.statuses.is_empty() {
            self.select(&options.ids, &options.filter)?
                .into_iter()
                .filter(|(_, created)| created.is_some())
                .map(|(id, _)| id)
                .collect()
        } else {
            self.check_tasks(&options.ids, &options.filter)?
                .into_iter()
                .filter(|r| r.created.is_some())
                .map(|r| r.id)
                .collect()
        };
        if selected.is_empty() {
            return Ok(PurgeSummary::default());
        }

        let wanted: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
        let lock = StatusCache::lock_path_in(root);
        let mut summary = PurgeSummary::default();
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || entry.path() == lock {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let stem = name.split('.').next().unwrap_or_default();
            if !wanted.contains(stem) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => summary.removed_files += 1,
                Err(e) => {
                    warn!("failed to remove {}: {e}", entry.path().display());
                    summary.failures += 1;
                }
            }
        }

        StatusCache::update(root, |cache| {
            for id in &selected {
                cache.remove(id);
            }
        })?;
        info!(
            "purged {} tasks ({} files)",
            selected.len(),
            summary.removed_files
        );
        summary.tasks = selected;
        Ok(summary)
    }

    /// Remove everything under the task store, cache included.
    fn purge_all(&self) -> PurgeSummary {
        let root = self.store.root();
        let tasks: Vec<String> = self
            .store
            .list(&[])
            .map(|listed| listed.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default();
        let lock = StatusCache::lock_path_in(root);

        let mut summary = PurgeSummary {
            tasks,
            ..PurgeSummary::default()
        };
        for entry in WalkDir::new(root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path() == lock {
                continue;
            }
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            match removed {
                Ok(()) if !entry.file_type().is_dir() => summary.removed_files += 1,
                Ok(()) => {}
                Err(e) => {
                    warn!("failed to remove {}: {e}", entry.path().display());
                    summary.failures += 1;
                }
            }
        }
        info!(
            "purged all {} tasks ({} files)",
            summary.tasks.len(),
            summary.removed_files
        );
        summary
    }
}
