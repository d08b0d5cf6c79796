//! File-backed signature store.
//!
//! Records live as JSON documents under one directory, named after a hash
//! of the invocation scope (step name and group index) and the input file
//! list. A changed content token overwrites the record of the same
//! invocation. Writes are atomic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use eval::fsutil::atomic_write_file;
use eval::{FileSet, FileTarget, Target};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{RecordedFile, SignatureError, SignatureRecord};

/// What the executor knows about one step invocation while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureHandle {
    key: String,
    content: String,
    input: Vec<String>,
    output: FileSet,
    depends: FileSet,
}

impl SignatureHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn output(&self) -> &FileSet {
        &self.output
    }

    /// Back-patch the output once it became determined.
    pub fn set_output(&mut self, output: FileSet) {
        self.output = output;
    }
}

#[derive(Debug, Clone)]
pub struct SignatureStore {
    dir: PathBuf,
}

impl SignatureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Describe an invocation. Nothing is read or written yet.
    ///
    /// `scope` names the invocation (for example `align_1:0`); together
    /// with the inputs it selects the record, while `content` is compared
    /// on validation.
    pub fn open(
        &self,
        scope: &str,
        content: &str,
        input: &[String],
        output: &FileSet,
        depends: Option<&FileSet>,
    ) -> SignatureHandle {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update([0u8]);
        for file in input {
            hasher.update(file.as_bytes());
            hasher.update(b"\n");
        }
        SignatureHandle {
            key: format!("{:x}", hasher.finalize()),
            content: content.to_owned(),
            input: input.to_vec(),
            output: output.clone(),
            depends: depends.cloned().unwrap_or_else(FileSet::empty),
        }
    }

    fn record_path(&self, handle: &SignatureHandle) -> PathBuf {
        self.dir.join(format!("{}.json", handle.key))
    }

    fn load(&self, handle: &SignatureHandle) -> Result<Option<SignatureRecord>, SignatureError> {
        let path = self.record_path(handle);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SignatureError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("ignoring unreadable signature {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    /// Return the stored record if it still describes the world.
    ///
    /// A record is valid only when its content token matches, the file sets
    /// the handle knows about match the recorded ones, and every recorded
    /// file still exists with an unchanged signature. When the handle's
    /// output is undetermined the recorded output is accepted as is.
    pub fn validate(
        &self,
        handle: &SignatureHandle,
    ) -> Result<Option<SignatureRecord>, SignatureError> {
        let Some(record) = self.load(handle)? else {
            debug!("no signature recorded for {}", handle.key);
            return Ok(None);
        };

        if record.content != handle.content {
            debug!("step content changed for {}", handle.key);
            return Ok(None);
        }
        if !same_paths(&record.input, &handle.input) {
            return Ok(None);
        }
        if let Some(output) = handle.output.files() {
            if !same_paths(&record.output, output) {
                return Ok(None);
            }
        }
        match handle.depends.files() {
            Some(depends) if same_paths(&record.depends, depends) => {}
            _ => return Ok(None),
        }

        for file in record.files() {
            let current = FileTarget::new(&file.path)
                .signature()
                .map_err(|source| SignatureError::Io {
                    path: file.path.clone(),
                    source,
                })?;
            if current.as_ref() != Some(&file.signature) {
                debug!("{} is missing or changed", file.path);
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    /// Persist the record for `handle`.
    ///
    /// Returns whether a usable record now exists: `false` when the output
    /// or depends is still undetermined or a referenced file is missing,
    /// `true` otherwise (including when nothing changed).
    pub fn write(&self, handle: &SignatureHandle) -> Result<bool, SignatureError> {
        let (Some(output), Some(depends)) = (handle.output.files(), handle.depends.files()) else {
            debug!("not writing signature {} with undetermined files", handle.key);
            return Ok(false);
        };

        let (Some(input), Some(output), Some(depends)) = (
            record_files(&handle.input)?,
            record_files(output)?,
            record_files(depends)?,
        ) else {
            debug!("not writing signature {}: some files do not exist", handle.key);
            return Ok(false);
        };

        let record = SignatureRecord {
            content: handle.content.clone(),
            input,
            output,
            depends,
            written_at: Utc::now(),
        };

        if let Some(existing) = self.load(handle)? {
            if existing.same_as(&record) {
                debug!("signature {} unchanged", handle.key);
                return Ok(true);
            }
        }

        let path = self.record_path(handle);
        let body = serde_json::to_vec_pretty(&record)?;
        atomic_write_file(&path, &body).map_err(|source| SignatureError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!("signature {} written", handle.key);
        Ok(true)
    }
}

fn same_paths(recorded: &[RecordedFile], files: &[String]) -> bool {
    recorded.len() == files.len() && recorded.iter().zip(files).all(|(r, f)| &r.path == f)
}

/// Signatures for every file, or `None` if one of them does not exist.
fn record_files(files: &[String]) -> Result<Option<Vec<RecordedFile>>, SignatureError> {
    let mut recorded = Vec::with_capacity(files.len());
    for path in files {
        let signature = FileTarget::new(path)
            .signature()
            .map_err(|source| SignatureError::Io {
                path: path.clone(),
                source,
            })?;
        match signature {
            Some(signature) => recorded.push(RecordedFile {
                path: path.clone(),
                signature,
            }),
            None => return Ok(None),
        }
    }
    Ok(Some(recorded))
}
