//! Targets: things a step declares as input, output or dependency, and the
//! signatures used to decide whether they changed.

use std::fmt::Debug;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Comparable fingerprint of a target.
///
/// A touched file gets a new `mtime` and therefore a new signature even
/// when its content is unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSignature {
    pub mtime: f64,
    pub size: u64,
    pub digest: String,
}

/// Anything whose existence and content can be checked.
pub trait Target: Send + Sync + Debug {
    fn name(&self) -> String;

    fn exists(&self) -> bool;

    /// `Ok(None)` when the target does not exist.
    fn signature(&self) -> io::Result<Option<FileSignature>>;
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Modification time in seconds since the epoch.
pub fn mtime_secs(metadata: &Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A plain file on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    path: PathBuf,
}

impl FileTarget {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: expand_user(path.as_ref()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Target for FileTarget {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn signature(&self) -> io::Result<Option<FileSignature>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            return Ok(Some(FileSignature {
                mtime: mtime_secs(&metadata),
                size: 0,
                digest: String::new(),
            }));
        }

        let mut hasher = Sha256::new();
        io::copy(&mut File::open(&self.path)?, &mut hasher)?;
        Ok(Some(FileSignature {
            mtime: mtime_secs(&metadata),
            size: metadata.len(),
            digest: format!("{:x}", hasher.finalize()),
        }))
    }
}
