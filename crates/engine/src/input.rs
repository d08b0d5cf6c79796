//! The input directive: filtering, grouping and per-group variables.
//!
//! Options are applied in a fixed order (`filetype`, `group_by`,
//! `paired_with`, `pattern`, `for_each`). `for_each` replication is built by
//! index: the final group count is known up front and each group's bindings
//! are computed from its index rather than by copying and appending.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use eval::{is_reserved, FileSet, Namespace};
use serde_json::Value;
use tracing::debug;

use crate::models::DirectiveKind;
use crate::pattern::extract_pattern;
use crate::EngineError;

/// Per-group variables, bound into the namespace while the group runs.
pub type Bindings = BTreeMap<String, Value>;

/// One unit of work of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkGroup {
    pub files: FileSet,
    pub bindings: Bindings,
}

impl WorkGroup {
    pub fn new(files: FileSet) -> Self {
        Self {
            files,
            bindings: Bindings::new(),
        }
    }

    pub fn is_undetermined(&self) -> bool {
        self.files.is_undetermined()
    }
}

/// Result of processing an input directive.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedInput {
    /// The step-level input after filtering.
    pub input: FileSet,
    pub groups: Vec<WorkGroup>,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Single,
    All,
    Pairs,
    Pairwise,
    Combinations,
    Chunk(usize),
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::Single => f.write_str("single"),
            GroupBy::All => f.write_str("all"),
            GroupBy::Pairs => f.write_str("pairs"),
            GroupBy::Pairwise => f.write_str("pairwise"),
            GroupBy::Combinations => f.write_str("combinations"),
            GroupBy::Chunk(n) => write!(f, "{n}"),
        }
    }
}

impl GroupBy {
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidOption {
            option: "group_by".into(),
            message: format!("unsupported value {value}"),
        };
        let chunk = |n: u64| match usize::try_from(n) {
            Ok(n) if n > 0 => Ok(GroupBy::Chunk(n)),
            _ => Err(invalid()),
        };
        match value {
            Value::Number(n) => n.as_u64().ok_or_else(invalid).and_then(chunk),
            Value::String(s) => match s.as_str() {
                "single" => Ok(GroupBy::Single),
                "all" => Ok(GroupBy::All),
                "pairs" => Ok(GroupBy::Pairs),
                "pairwise" => Ok(GroupBy::Pairwise),
                "combinations" => Ok(GroupBy::Combinations),
                digits => digits.parse::<u64>().map_err(|_| invalid()).and_then(chunk),
            },
            _ => Err(invalid()),
        }
    }

    pub fn apply(&self, files: &[String]) -> Result<Vec<Vec<String>>, EngineError> {
        let uneven = || EngineError::UnevenGroups {
            count: files.len(),
            group_by: self.to_string(),
        };
        let groups = match self {
            GroupBy::Single => files.iter().map(|f| vec![f.clone()]).collect(),
            GroupBy::All => vec![files.to_vec()],
            GroupBy::Pairs => {
                if files.len() % 2 != 0 {
                    return Err(uneven());
                }
                let (first, second) = files.split_at(files.len() / 2);
                first
                    .iter()
                    .zip(second)
                    .map(|(a, b)| vec![a.clone(), b.clone()])
                    .collect()
            }
            GroupBy::Pairwise => files.windows(2).map(<[String]>::to_vec).collect(),
            GroupBy::Combinations => {
                let mut groups = Vec::new();
                for (i, a) in files.iter().enumerate() {
                    for b in &files[i + 1..] {
                        groups.push(vec![a.clone(), b.clone()]);
                    }
                }
                groups
            }
            GroupBy::Chunk(n) => {
                if files.len() % n != 0 {
                    return Err(uneven());
                }
                files.chunks(*n).map(<[String]>::to_vec).collect()
            }
        };
        Ok(groups)
    }
}

pub type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The `filetype` filter.
#[derive(Clone)]
pub enum FileType {
    Patterns(Vec<glob::Pattern>),
    Predicate(Predicate),
}

impl fmt::Debug for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Patterns(patterns) => {
                let shown: Vec<_> = patterns.iter().map(glob::Pattern::as_str).collect();
                f.debug_tuple("Patterns").field(&shown).finish()
            }
            FileType::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl FileType {
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        let compile = |p: &str| {
            glob::Pattern::new(p).map_err(|e| EngineError::InvalidOption {
                option: "filetype".into(),
                message: format!("bad pattern '{p}': {e}"),
            })
        };
        match value {
            Value::String(p) => Ok(FileType::Patterns(vec![compile(p)?])),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(p) => compile(p),
                    other => Err(EngineError::InvalidOption {
                        option: "filetype".into(),
                        message: format!("expected a pattern, got {other}"),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FileType::Patterns),
            other => Err(EngineError::InvalidOption {
                option: "filetype".into(),
                message: format!("expected a pattern or a list of patterns, got {other}"),
            }),
        }
    }

    pub fn matches(&self, file: &str) -> bool {
        match self {
            FileType::Patterns(patterns) => patterns.iter().any(|p| p.matches(file)),
            FileType::Predicate(predicate) => predicate(file),
        }
    }
}

fn names_option(option: &str, value: &Value) -> Result<Vec<String>, EngineError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(name) => Ok(vec![name.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EngineError::InvalidOption {
                option: option.into(),
                message: format!("expected names, got {value}"),
            }),
        other => Err(EngineError::InvalidOption {
            option: option.into(),
            message: format!("unacceptable value {other}"),
        }),
    }
}

/// Validated options of an input directive.
#[derive(Debug, Clone, Default)]
pub struct InputOptions {
    pub filetype: Option<FileType>,
    pub group_by: Option<GroupBy>,
    pub paired_with: Vec<String>,
    pub pattern: Vec<String>,
    pub for_each: Vec<String>,
}

impl InputOptions {
    pub fn from_options(options: &BTreeMap<String, Value>) -> Result<Self, EngineError> {
        let mut parsed = InputOptions::default();
        for (key, value) in options {
            match key.as_str() {
                "filetype" => parsed.filetype = Some(FileType::from_value(value)?),
                "group_by" => parsed.group_by = Some(GroupBy::from_value(value)?),
                "paired_with" => parsed.paired_with = names_option(key, value)?,
                "pattern" => parsed.pattern = names_option(key, value)?,
                "for_each" => parsed.for_each = names_option(key, value)?,
                other => {
                    return Err(EngineError::UnknownOption {
                        directive: DirectiveKind::Input,
                        option: other.to_owned(),
                    })
                }
            }
        }
        Ok(parsed)
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filetype = Some(FileType::Predicate(Arc::new(predicate)));
        self
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// `_name` for `name` or `name.attr`.
fn binding_name(var: &str) -> Result<String, EngineError> {
    let root = var.split('.').next().unwrap_or(var);
    let name = format!("_{root}");
    if is_reserved(&name) {
        return Err(EngineError::InvalidOption {
            option: var.to_owned(),
            message: format!("would bind reserved variable {name}"),
        });
    }
    Ok(name)
}

fn sequence(var: &str, ns: &mut Namespace) -> Result<Vec<Value>, EngineError> {
    match ns.read_path(var) {
        Some(Value::Array(values)) => Ok(values),
        Some(other) => Err(EngineError::InvalidOption {
            option: var.into(),
            message: format!("variable is not a sequence ({other})"),
        }),
        None => Err(EngineError::UndefinedVariable(var.to_owned())),
    }
}

/// Attach, per group, the values paired with each of its files.
fn pair_values(
    var: &str,
    values: &[Value],
    files: &[String],
    groups: &[Vec<String>],
    bindings: &mut [Bindings],
) -> Result<(), EngineError> {
    if values.len() != files.len() {
        return Err(EngineError::LengthMismatch {
            variable: var.to_owned(),
            expected: files.len(),
            found: values.len(),
        });
    }
    let by_file: HashMap<&str, &Value> = files.iter().map(String::as_str).zip(values).collect();
    let name = binding_name(var)?;
    for (group, vars) in groups.iter().zip(bindings.iter_mut()) {
        let paired: Vec<Value> = group
            .iter()
            .map(|f| by_file.get(f.as_str()).map(|v| (*v).clone()).unwrap_or(Value::Null))
            .collect();
        vars.insert(name.clone(), Value::Array(paired));
    }
    Ok(())
}

/// One `for_each` entry: co-varying variables (by binding name) and their
/// values.
struct Loop {
    vars: Vec<(String, Vec<Value>)>,
    len: usize,
}

fn resolve_loop(entry: &str, ns: &mut Namespace) -> Result<Loop, EngineError> {
    let mut vars: Vec<(String, Vec<Value>)> = Vec::new();
    for var in entry.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let values = sequence(var, ns)?;
        if let Some((_, first_values)) = vars.first() {
            if first_values.len() != values.len() {
                return Err(EngineError::LengthMismatch {
                    variable: var.to_owned(),
                    expected: first_values.len(),
                    found: values.len(),
                });
            }
        }
        vars.push((binding_name(var)?, values));
    }
    let len = vars.first().map_or(0, |(_, values)| values.len());
    Ok(Loop { vars, len })
}

/// Split the step input into work groups according to `options`.
///
/// Pattern captures are also assigned into `ns` as whole-step variables.
pub fn process_input(
    files: &FileSet,
    options: &InputOptions,
    ns: &mut Namespace,
) -> Result<ProcessedInput, EngineError> {
    let Some(files) = files.files() else {
        return Ok(ProcessedInput {
            input: files.clone(),
            groups: vec![WorkGroup::new(files.clone())],
        });
    };

    let files: Vec<String> = match &options.filetype {
        Some(filter) => files.iter().filter(|f| filter.matches(f)).cloned().collect(),
        None => files.to_vec(),
    };

    let groups = match options.group_by {
        Some(group_by) => group_by.apply(&files)?,
        None => vec![files.clone()],
    };
    let mut bindings = vec![Bindings::new(); groups.len()];

    for var in &options.paired_with {
        let values = sequence(var, ns)?;
        pair_values(var, &values, &files, &groups, &mut bindings)?;
    }

    for pattern in &options.pattern {
        let captured = extract_pattern(pattern, &files)?;
        for (name, values) in captured {
            if is_reserved(&name) || name.starts_with('_') {
                return Err(EngineError::ReservedPatternVariable(name));
            }
            pair_values(&name, &values, &files, &groups, &mut bindings)?;
            ns.bind(name, Value::Array(values));
        }
    }

    let loops = options
        .for_each
        .iter()
        .map(|entry| resolve_loop(entry, ns))
        .collect::<Result<Vec<_>, _>>()?;
    let base = groups.len();
    let total = loops.iter().fold(base, |n, l| n * l.len);

    let mut work = Vec::with_capacity(total);
    for index in 0..total {
        let mut rest = index / base.max(1);
        let origin = index % base.max(1);
        let mut vars = bindings[origin].clone();
        for lp in &loops {
            let position = rest % lp.len;
            rest /= lp.len;
            for (name, values) in &lp.vars {
                vars.insert(name.clone(), values[position].clone());
            }
        }
        work.push(WorkGroup {
            files: FileSet::Files(groups[origin].clone()),
            bindings: vars,
        });
    }
    debug!("{} input file(s) in {} group(s)", files.len(), work.len());

    Ok(ProcessedInput {
        input: FileSet::Files(files),
        groups: work,
    })
}
