//! Turning evaluated directive arguments into file lists.

use std::path::Path;

use eval::target::expand_user;
use eval::Arg;
use serde_json::Value;
use tracing::debug;

use crate::EngineError;

/// What to do with a path that neither exists nor matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Error,
    Keep,
}

fn push_value(value: &Value, out: &mut Vec<String>) -> Result<(), EngineError> {
    match value {
        Value::Null => Ok(()),
        Value::String(path) => {
            out.push(path.clone());
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| match item {
            Value::String(path) => {
                out.push(path.clone());
                Ok(())
            }
            other => Err(EngineError::InvalidFile(other.to_string())),
        }),
        other => Err(EngineError::InvalidFile(other.to_string())),
    }
}

/// Sorted matches of a glob pattern. A malformed pattern matches nothing.
pub fn glob_sorted(pattern: &str) -> Vec<String> {
    let Ok(paths) = glob::glob(pattern) else {
        debug!("invalid glob pattern {pattern}");
        return Vec::new();
    };
    let mut matched: Vec<String> = paths
        .filter_map(Result::ok)
        .map(|p| p.display().to_string())
        .collect();
    matched.sort();
    matched
}

/// Expand positional arguments into a flat file list.
///
/// Existing paths are kept as given (after `~` expansion). Anything else is
/// treated as a glob pattern; a pattern with no match is an error or kept
/// verbatim depending on `missing`. Dynamic arguments are globbed the same
/// way.
pub fn expand_file_list(args: &[Arg], missing: Missing) -> Result<Vec<String>, EngineError> {
    let mut raw = Vec::new();
    for arg in args {
        match arg {
            Arg::Value(value) => push_value(value, &mut raw)?,
            Arg::Dynamic(pattern) => raw.push(pattern.clone()),
        }
    }

    let mut files = Vec::with_capacity(raw.len());
    for file in raw {
        let expanded = expand_user(&file).display().to_string();
        if Path::new(&expanded).exists() {
            files.push(expanded);
            continue;
        }
        let matched = glob_sorted(&expanded);
        if !matched.is_empty() {
            files.extend(matched);
        } else if missing == Missing::Keep {
            files.push(expanded);
        } else {
            return Err(EngineError::MissingFile(file));
        }
    }
    Ok(files)
}

/// Parent directories of `files` that have to exist before the step runs.
pub fn create_parent_dirs(files: &[String]) -> Result<(), EngineError> {
    for file in files {
        let Some(parent) = Path::new(file).parent() else {
            continue;
        };
        if parent.as_os_str().is_empty() || parent.is_dir() {
            continue;
        }
        std::fs::create_dir_all(parent).map_err(|source| EngineError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
