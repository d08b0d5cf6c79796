//! The shared namespace a step's statements run against.
//!
//! Two kinds of entries live here:
//! - user and engine-injected variables, stored as JSON values;
//! - the reserved step slots (`input`, `_input`, `output`, `_output`,
//!   `depends`, `_depends`, `_index`), which only the engine may write.
//!
//! Every read that goes through [`Namespace::read`] is recorded so the
//! engine can tell which variables a step body actually used.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EvalError;

/// Names that statements may read but never assign.
pub const RESERVED_NAMES: [&str; 7] = [
    "input", "_input", "output", "_output", "depends", "_depends", "_index",
];

/// Whether `name` is one of the engine-owned step slots.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

// ---------------------------------------------------------------------------
// FileSet
// ---------------------------------------------------------------------------

/// A resolved list of files, or a placeholder for files that cannot be
/// known until the step has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FileSet {
    Files(Vec<String>),
    /// Carries the directive text that will be re-evaluated later.
    Undetermined(String),
}

impl FileSet {
    pub fn empty() -> Self {
        FileSet::Files(Vec::new())
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, FileSet::Undetermined(_))
    }

    /// The file list, or `None` when undetermined.
    pub fn files(&self) -> Option<&[String]> {
        match self {
            FileSet::Files(files) => Some(files),
            FileSet::Undetermined(_) => None,
        }
    }

    /// JSON view handed to evaluators. Undetermined sets read as `null`.
    pub fn to_value(&self) -> Value {
        match self {
            FileSet::Files(files) => Value::from(files.clone()),
            FileSet::Undetermined(_) => Value::Null,
        }
    }
}

impl From<Vec<String>> for FileSet {
    fn from(files: Vec<String>) -> Self {
        FileSet::Files(files)
    }
}

fn slot_value(slot: &Option<FileSet>) -> Value {
    slot.as_ref().map(FileSet::to_value).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// ReservedSlots
// ---------------------------------------------------------------------------

/// Engine-owned step variables. `None` means the variable is unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservedSlots {
    pub input: Option<FileSet>,
    pub step_input: Option<FileSet>,
    pub output: Option<FileSet>,
    pub step_output: Option<FileSet>,
    pub depends: Option<FileSet>,
    pub step_depends: Option<FileSet>,
    pub index: usize,
}

impl ReservedSlots {
    fn value_of(&self, name: &str) -> Option<Value> {
        let value = match name {
            "input" => slot_value(&self.input),
            "_input" => slot_value(&self.step_input),
            "output" => slot_value(&self.output),
            "_output" => slot_value(&self.step_output),
            "depends" => slot_value(&self.depends),
            "_depends" => slot_value(&self.step_depends),
            "_index" => Value::from(self.index),
            _ => return None,
        };
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// Mutable variable scope of one step invocation.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    vars: BTreeMap<String, Value>,
    slots: ReservedSlots,
    accessed: BTreeSet<String>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a variable on behalf of a statement; the access is recorded.
    pub fn read(&mut self, name: &str) -> Option<Value> {
        self.accessed.insert(name.to_owned());
        self.get(name)
    }

    /// Read a dotted path (`sample.files`) on behalf of a statement.
    pub fn read_path(&mut self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut value = self.read(root)?;
        for field in parts {
            value = value.get(field)?.clone();
        }
        Some(value)
    }

    /// Untracked read used by the engine itself.
    pub fn get(&self, name: &str) -> Option<Value> {
        if is_reserved(name) {
            return self.slots.value_of(name);
        }
        self.vars.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        is_reserved(name) || self.vars.contains_key(name)
    }

    /// Assignment performed by a step statement.
    ///
    /// # Errors
    /// [`EvalError::Reserved`] for engine-owned names.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        if is_reserved(name) {
            return Err(EvalError::Reserved(name.to_owned()));
        }
        self.vars.insert(name.to_owned(), value);
        Ok(())
    }

    /// Binding injected by the engine (group variables, `step_name`, ...).
    /// Reserved names go through [`Namespace::slots_mut`] instead.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug_assert!(!is_reserved(&name), "reserved slot '{name}' bound as variable");
        self.vars.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn slots(&self) -> &ReservedSlots {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut ReservedSlots {
        &mut self.slots
    }

    /// Names of all variables (reserved slots excluded).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn accessed(&self) -> &BTreeSet<String> {
        &self.accessed
    }

    /// Drain the set of recorded reads.
    pub fn take_accessed(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.accessed)
    }

    /// Immutable copy of the selected variables plus every reserved slot.
    /// Unknown names are skipped.
    pub fn snapshot<'a, I>(&self, names: I) -> NamespaceSnapshot
    where
        I: IntoIterator<Item = &'a str>,
    {
        let vars = names
            .into_iter()
            .filter_map(|name| self.vars.get(name).map(|v| (name.to_owned(), v.clone())))
            .collect();
        NamespaceSnapshot {
            vars,
            slots: self.slots.clone(),
        }
    }

    /// Copy of everything.
    pub fn snapshot_all(&self) -> NamespaceSnapshot {
        NamespaceSnapshot {
            vars: self.vars.clone(),
            slots: self.slots.clone(),
        }
    }

    pub fn from_snapshot(snapshot: NamespaceSnapshot) -> Self {
        Self {
            vars: snapshot.vars,
            slots: snapshot.slots,
            accessed: BTreeSet::new(),
        }
    }
}

/// Serializable namespace subset shipped with a dispatched task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub vars: BTreeMap<String, Value>,
    pub slots: ReservedSlots,
}
