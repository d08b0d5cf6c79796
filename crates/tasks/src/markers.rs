//! Marker file layout and payloads.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eval::fsutil::atomic_write_file;
use eval::target::mtime_secs;
use eval::{FileSignature, NamespaceSnapshot};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::io_err;
use crate::TaskError;

/// The marker files that make up one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Definition,
    Pulse,
    Result,
    Script,
    JobId,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 5] = [
        MarkerKind::Definition,
        MarkerKind::Pulse,
        MarkerKind::Result,
        MarkerKind::Script,
        MarkerKind::JobId,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            MarkerKind::Definition => "task",
            MarkerKind::Pulse => "pulse",
            MarkerKind::Result => "res",
            MarkerKind::Script => "sh",
            MarkerKind::JobId => "job_id",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Content of the `.task` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub global_def: String,
    pub namespace: NamespaceSnapshot,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Content of the `.res` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub ret_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    /// `_output` of the task namespace after the script ran.
    #[serde(default)]
    pub output_files: Option<Vec<String>>,
    #[serde(default)]
    pub input: BTreeMap<String, FileSignature>,
    #[serde(default)]
    pub output: BTreeMap<String, FileSignature>,
    #[serde(default)]
    pub depends: BTreeMap<String, FileSignature>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.ret_code == 0
    }

    /// Every recorded file signature.
    pub fn signatures(&self) -> impl Iterator<Item = (&String, &FileSignature)> {
        self.input.iter().chain(&self.output).chain(&self.depends)
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// A directory of task markers.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.stepflow/tasks`.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stepflow")
            .join("tasks")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker(&self, id: &str, kind: MarkerKind) -> PathBuf {
        self.root.join(format!("{id}.{}", kind.suffix()))
    }

    /// Modification time of a marker, `None` when it does not exist.
    pub fn mtime(&self, id: &str, kind: MarkerKind) -> Option<f64> {
        fs::metadata(self.marker(id, kind))
            .ok()
            .map(|m| mtime_secs(&m))
    }

    fn ensure_root(&self) -> Result<(), TaskError> {
        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))
    }

    pub fn write_definition(&self, definition: &TaskDefinition) -> Result<PathBuf, TaskError> {
        self.ensure_root()?;
        let path = self.marker(&definition.id, MarkerKind::Definition);
        let body = serde_json::to_vec_pretty(definition)?;
        atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))?;
        debug!("task {} defined at {}", definition.id, path.display());
        Ok(path)
    }

    pub fn read_definition(&self, id: &str) -> Result<TaskDefinition, TaskError> {
        read_json(&self.marker(id, MarkerKind::Definition))
    }

    pub fn write_result(&self, id: &str, result: &TaskResult) -> Result<(), TaskError> {
        self.ensure_root()?;
        let path = self.marker(id, MarkerKind::Result);
        let body = serde_json::to_vec_pretty(result)?;
        atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))
    }

    pub fn read_result(&self, id: &str) -> Result<TaskResult, TaskError> {
        read_json(&self.marker(id, MarkerKind::Result))
    }

    /// Write a plain-text marker (submission script, job id).
    pub fn write_text(&self, id: &str, kind: MarkerKind, text: &str) -> Result<(), TaskError> {
        self.ensure_root()?;
        let path = self.marker(id, kind);
        atomic_write_file(&path, text.as_bytes()).map_err(|e| io_err(&path, e))
    }

    /// Create the heartbeat marker or bump its timestamp.
    pub fn touch_pulse(&self, id: &str) -> Result<(), TaskError> {
        self.ensure_root()?;
        let path = self.marker(id, MarkerKind::Pulse);
        let line = format!("{}\n", Utc::now().timestamp());
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| io::Write::write_all(&mut file, line.as_bytes()))
            .map_err(|e| io_err(&path, e))
    }

    /// Whether the heartbeat marker can still be written by its owner.
    pub fn pulse_writable(&self, id: &str) -> bool {
        fs::metadata(self.marker(id, MarkerKind::Pulse))
            .map(|m| owner_writable(&m))
            .unwrap_or(false)
    }

    /// Revoke write permission on the heartbeat marker, creating it first
    /// if needed. A worker that finds its pulse read-only stops touching it
    /// and monitors classify the task as aborted.
    pub fn freeze_pulse(&self, id: &str) -> Result<(), TaskError> {
        self.ensure_root()?;
        let path = self.marker(id, MarkerKind::Pulse);
        if !path.exists() {
            fs::File::create(&path).map_err(|e| io_err(&path, e))?;
        }
        let mut perms = fs::metadata(&path).map_err(|e| io_err(&path, e))?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).map_err(|e| io_err(&path, e))
    }

    pub fn remove_marker(&self, id: &str, kind: MarkerKind) -> Result<bool, TaskError> {
        let path = self.marker(id, kind);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Tags of a task; an unreadable definition has none.
    pub fn tags(&self, id: &str) -> Vec<String> {
        self.read_definition(id).map(|d| d.tags).unwrap_or_default()
    }

    /// Tasks whose id starts with one of `prefixes` (all tasks when empty),
    /// paired with the definition mtime, oldest first. A prefix matching
    /// nothing is returned as-is with no timestamp.
    pub fn list(&self, prefixes: &[String]) -> Result<Vec<(String, Option<f64>)>, TaskError> {
        let definitions = self.definitions()?;
        let mut found: BTreeSet<(String, Option<u64>)> = BTreeSet::new();
        let mut tasks: Vec<(String, Option<f64>)> = Vec::new();

        let mut push = |id: &str, mtime: Option<f64>, tasks: &mut Vec<(String, Option<f64>)>| {
            if found.insert((id.to_owned(), mtime.map(f64::to_bits))) {
                tasks.push((id.to_owned(), mtime));
            }
        };

        if prefixes.is_empty() {
            for (id, mtime) in &definitions {
                push(id, Some(*mtime), &mut tasks);
            }
        } else {
            for prefix in prefixes {
                let matched: Vec<_> = definitions
                    .iter()
                    .filter(|(id, _)| id.starts_with(prefix.as_str()))
                    .collect();
                if matched.is_empty() {
                    push(prefix, None, &mut tasks);
                }
                for (id, mtime) in matched {
                    push(id, Some(*mtime), &mut tasks);
                }
            }
        }

        tasks.sort_by(|a, b| a.1.unwrap_or(0.0).total_cmp(&b.1.unwrap_or(0.0)));
        Ok(tasks)
    }

    fn definitions(&self) -> Result<Vec<(String, f64)>, TaskError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root, e)),
        };
        let suffix = format!(".{}", MarkerKind::Definition.suffix());
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) else {
                continue;
            };
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    found.push((id.to_owned(), mtime_secs(&metadata)));
                }
            }
        }
        Ok(found)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TaskError> {
    let raw = fs::read(path).map_err(|e| io_err(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| TaskError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(unix)]
fn owner_writable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o200 != 0
}

#[cfg(not(unix))]
fn owner_writable(metadata: &fs::Metadata) -> bool {
    !metadata.permissions().readonly()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, tags: &[&str]) -> TaskDefinition {
        TaskDefinition {
            id: id.into(),
            script: "echo hi".into(),
            global_def: String::new(),
            namespace: NamespaceSnapshot::default(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            workdir: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn definitions_round_trip_and_list_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.write_definition(&definition("abc123", &["align"])).unwrap();
        store.write_definition(&definition("abd456", &[])).unwrap();

        assert_eq!(store.tags("abc123"), vec!["align"]);

        let all = store.list(&[]).unwrap();
        assert_eq!(all.len(), 2);

        let some = store.list(&["abc".into(), "zzz".into()]).unwrap();
        let ids: Vec<_> = some.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"abc123"));
        assert!(ids.contains(&"zzz"));
        assert!(some.iter().any(|(id, t)| id == "zzz" && t.is_none()));
    }

    #[test]
    fn frozen_pulse_is_not_writable() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.touch_pulse("t1").unwrap();
        assert!(store.pulse_writable("t1"));
        store.freeze_pulse("t1").unwrap();
        assert!(!store.pulse_writable("t1"));
    }
}
