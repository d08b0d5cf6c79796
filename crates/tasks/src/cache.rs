//! Persisted status cache shared by every monitor process of a task store.
//!
//! The cache only saves work: a cached entry is a hint that the monitor
//! re-verifies against live marker mtimes before trusting it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eval::fsutil::atomic_write_file;
use tracing::{debug, warn};

use crate::error::io_err;
use crate::lock::LockFile;
use crate::{StatusEntry, TaskError};

pub const CACHE_FILE: &str = "status_cache.json";

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct StatusCache {
    path: PathBuf,
    entries: BTreeMap<String, StatusEntry>,
    dirty: bool,
}

impl StatusCache {
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CACHE_FILE)
    }

    /// Lock file guarding the cache: the cache path with a trailing `_`.
    pub fn lock_path_in(root: &Path) -> PathBuf {
        root.join(format!("{CACHE_FILE}_"))
    }

    /// Read the cache of `root`. A missing or unreadable cache is empty.
    pub fn load(root: &Path) -> Result<Self, TaskError> {
        let path = Self::path_in(root);
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("discarding unreadable status cache {}: {e}", path.display());
                BTreeMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    /// Run one locked read-modify-write cycle. The file is only rewritten
    /// when `apply` changed something.
    pub fn update<R>(
        root: &Path,
        apply: impl FnOnce(&mut StatusCache) -> R,
    ) -> Result<R, TaskError> {
        let _lock = LockFile::acquire(Self::lock_path_in(root), LOCK_TIMEOUT)?;
        let mut cache = Self::load(root)?;
        let out = apply(&mut cache);
        if cache.dirty {
            cache.save()?;
        }
        Ok(out)
    }

    /// Snapshot of the entries, read under the lock.
    pub fn read_locked(root: &Path) -> Result<BTreeMap<String, StatusEntry>, TaskError> {
        Self::update(root, |cache| cache.entries.clone())
    }

    pub fn get(&self, id: &str) -> Option<&StatusEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> &BTreeMap<String, StatusEntry> {
        &self.entries
    }

    /// Store `entry`; returns whether it differs from the cached one.
    pub fn insert(&mut self, id: &str, entry: StatusEntry) -> bool {
        if self.entries.get(id) == Some(&entry) {
            return false;
        }
        self.entries.insert(id.to_owned(), entry);
        self.dirty = true;
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<StatusEntry> {
        let removed = self.entries.remove(id);
        self.dirty |= removed.is_some();
        removed
    }

    /// Replace every entry.
    pub fn replace_all(&mut self, entries: BTreeMap<String, StatusEntry>) {
        if self.entries != entries {
            self.entries = entries;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn save(&mut self) -> Result<(), TaskError> {
        let body = serde_json::to_vec(&self.entries)?;
        atomic_write_file(&self.path, &body).map_err(|e| io_err(&self.path, e))?;
        debug!("status cache saved with {} entries", self.entries.len());
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskStatus;

    fn entry(status: TaskStatus) -> StatusEntry {
        StatusEntry {
            status,
            files: BTreeMap::new(),
        }
    }

    #[test]
    fn unchanged_updates_leave_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        StatusCache::update(root, |c| c.insert("t1", entry(TaskStatus::Pending))).unwrap();
        let path = StatusCache::path_in(root);
        let before = fs::read(&path).unwrap();

        let changed =
            StatusCache::update(root, |c| c.insert("t1", entry(TaskStatus::Pending))).unwrap();
        assert!(!changed);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!StatusCache::lock_path_in(root).exists());
    }

    #[test]
    fn removal_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        StatusCache::update(root, |c| {
            c.insert("a", entry(TaskStatus::Completed));
            c.insert("b", entry(TaskStatus::Failed));
        })
        .unwrap();
        StatusCache::update(root, |c| c.remove("a")).unwrap();

        let entries = StatusCache::read_locked(root).unwrap();
        assert!(!entries.contains_key("a"));
        assert_eq!(entries["b"].status, TaskStatus::Failed);
    }

    #[test]
    fn corrupt_cache_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(StatusCache::path_in(dir.path()), b"not json").unwrap();
        assert!(StatusCache::load(dir.path()).unwrap().entries().is_empty());
    }
}
