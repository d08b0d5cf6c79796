//! Core domain models for the step engine.
//!
//! A [`Step`] is what the workflow parser hands over: an ordered list of
//! typed statements, an optional trailing task and a few options. The
//! engine never sees the workflow language itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use eval::FileSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Input,
    Output,
    Depends,
    Task,
}

impl DirectiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectiveKind::Input => "input",
            DirectiveKind::Output => "output",
            DirectiveKind::Depends => "depends",
            DirectiveKind::Task => "task",
        }
    }

    /// Named options the directive accepts.
    pub fn options(self) -> &'static [&'static str] {
        match self {
            DirectiveKind::Input => &["group_by", "filetype", "paired_with", "pattern", "for_each"],
            DirectiveKind::Output | DirectiveKind::Depends => &[],
            DirectiveKind::Task => &["concurrent", "active", "workdir", "tags", "queue"],
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirectiveKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(DirectiveKind::Input),
            "output" => Ok(DirectiveKind::Output),
            "depends" => Ok(DirectiveKind::Depends),
            "task" => Ok(DirectiveKind::Task),
            other => Err(EngineError::UnknownDirective(other.to_owned())),
        }
    }
}

/// One parsed statement of a step body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    /// `name = expr`
    Assignment { name: String, expr: String },
    /// `kind: args`
    Directive { kind: DirectiveKind, args: String },
    /// Anything else: a script fragment run for its effects.
    Action { script: String },
}

impl Statement {
    pub fn assign(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Statement::Assignment {
            name: name.into(),
            expr: expr.into(),
        }
    }

    pub fn directive(kind: DirectiveKind, args: impl Into<String>) -> Self {
        Statement::Directive {
            kind,
            args: args.into(),
        }
    }

    pub fn action(script: impl Into<String>) -> Self {
        Statement::Action {
            script: script.into(),
        }
    }

    pub fn is_directive(&self) -> bool {
        matches!(self, Statement::Directive { .. })
    }

    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Statement::Directive {
                kind: DirectiveKind::Input,
                ..
            }
        )
    }

    /// Source-like rendering used in error messages.
    pub fn text(&self) -> String {
        match self {
            Statement::Assignment { name, expr } => format!("{name} = {expr}"),
            Statement::Directive { kind, args } => format!("{kind}: {args}"),
            Statement::Action { script } => script.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Variables copied into the step result.
    #[serde(default)]
    pub shared: Vec<String>,
    /// Name under which a [`StepInfo`] summary is exported.
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub index: Option<usize>,
    pub statements: Vec<Statement>,
    /// Trailing action dispatched once per active group.
    #[serde(default)]
    pub task: Option<String>,
    /// Global definitions re-run by out-of-process workers before the task.
    #[serde(default)]
    pub global_def: String,
    #[serde(default)]
    pub options: StepOptions,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
            statements: Vec::new(),
            task: None,
            global_def: String::new(),
            options: StepOptions::default(),
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_global_def(mut self, global_def: impl Into<String>) -> Self {
        self.global_def = global_def.into();
        self
    }

    pub fn shared(mut self, names: &[&str]) -> Self {
        self.options.shared = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.options.alias = Some(alias.into());
        self
    }

    /// `name_index`, or just `name` for an unnumbered step.
    pub fn step_name(&self) -> String {
        match self.index {
            Some(index) => format!("{}_{}", self.name, index),
            None => self.name.clone(),
        }
    }
}

/// What a step starts from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInput {
    /// Output of the previous step.
    pub input: Option<FileSet>,
    /// Output assumed until an output directive says otherwise.
    pub default_output: Option<FileSet>,
    /// Variables visible to the step before it runs.
    pub vars: BTreeMap<String, Value>,
}

impl StepInput {
    pub fn from_files(files: Vec<String>) -> Self {
        Self {
            input: Some(FileSet::Files(files)),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Task options
// ---------------------------------------------------------------------------

/// Which groups actually dispatch their task.
#[derive(Debug, Clone, PartialEq)]
pub enum Active {
    /// A single index; negative counts from the end.
    Index(i64),
    Indices(Vec<i64>),
    /// Slice over the group indices; negative bounds count from the end.
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

fn invalid_active(value: &Value, message: &str) -> EngineError {
    EngineError::InvalidOption {
        option: "active".into(),
        message: format!("{message} (got {value})"),
    }
}

impl Active {
    /// Accepts an integer, a list of integers or an object with any of
    /// `start`, `stop` and `step`.
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        let int = |v: &Value| v.as_i64().ok_or_else(|| invalid_active(value, "expected integers"));
        let bound = |key: &str| match value.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => int(v).map(Some),
        };

        match value {
            Value::Number(_) => int(value).map(Active::Index),
            Value::Array(items) => items
                .iter()
                .map(int)
                .collect::<Result<Vec<_>, _>>()
                .map(Active::Indices),
            Value::Object(map) => {
                if let Some(key) = map.keys().find(|k| !["start", "stop", "step"].contains(&k.as_str())) {
                    return Err(invalid_active(value, &format!("unknown slice field '{key}'")));
                }
                let step = bound("step")?;
                match step {
                    Some(0) => return Err(invalid_active(value, "slice step cannot be zero")),
                    Some(i64::MIN) => return Err(invalid_active(value, "slice step is out of range")),
                    _ => {}
                }
                Ok(Active::Slice {
                    start: bound("start")?,
                    stop: bound("stop")?,
                    step,
                })
            }
            _ => Err(invalid_active(
                value,
                "expected an integer, a list of integers or a slice",
            )),
        }
    }

    /// Whether group `index` of `groups` is active.
    pub fn allows(&self, index: usize, groups: usize) -> bool {
        let n = groups as i64;
        let i = index as i64;
        let absolute = |k: i64| if k < 0 { k + n } else { k };
        match self {
            Active::Index(k) => absolute(*k) == i,
            Active::Indices(ks) => ks.iter().any(|&k| absolute(k) == i),
            Active::Slice { start, stop, step } => {
                let step = step.unwrap_or(1);
                if step > 0 {
                    let clamp = |k: i64| absolute(k).clamp(0, n);
                    let start = start.map_or(0, clamp);
                    let stop = stop.map_or(n, clamp);
                    i >= start && i < stop && (i - start) % step == 0
                } else {
                    let clamp = |k: i64| absolute(k).clamp(-1, n - 1);
                    let start = start.map_or(n - 1, clamp);
                    let stop = stop.map_or(-1, clamp);
                    i <= start && i > stop && (start - i) % (-step) == 0
                }
            }
        }
    }
}

/// Options recorded by a `task` directive for the trailing task of a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    pub concurrent: bool,
    pub active: Option<Active>,
    pub workdir: Option<String>,
    pub tags: Vec<String>,
    pub queue: Option<String>,
}

impl TaskOptions {
    pub fn from_options(options: &BTreeMap<String, Value>) -> Result<Self, EngineError> {
        let mut parsed = TaskOptions::default();
        for (key, value) in options {
            let invalid = |message: &str| EngineError::InvalidOption {
                option: key.clone(),
                message: format!("{message} (got {value})"),
            };
            match key.as_str() {
                "concurrent" => {
                    parsed.concurrent = value.as_bool().ok_or_else(|| invalid("expected a boolean"))?
                }
                "active" => parsed.active = Some(Active::from_value(value)?),
                "workdir" => {
                    parsed.workdir = Some(
                        value
                            .as_str()
                            .ok_or_else(|| invalid("expected a path"))?
                            .to_owned(),
                    )
                }
                "tags" => {
                    parsed.tags = match value {
                        Value::String(tag) => vec![tag.clone()],
                        Value::Array(items) => items
                            .iter()
                            .map(|t| t.as_str().map(str::to_owned))
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| invalid("expected strings"))?,
                        _ => return Err(invalid("expected a tag or a list of tags")),
                    }
                }
                "queue" => {
                    parsed.queue = Some(
                        value
                            .as_str()
                            .ok_or_else(|| invalid("expected a queue name"))?
                            .to_owned(),
                    )
                }
                other => {
                    return Err(EngineError::UnknownOption {
                        directive: DirectiveKind::Task,
                        option: other.to_owned(),
                    })
                }
            }
        }
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Summary of a step exported under its alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    pub step_name: String,
    pub input: Option<FileSet>,
    pub output: Option<FileSet>,
    pub depends: Option<FileSet>,
    /// Every variable assigned by the step.
    pub vars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub step_name: String,
    pub input: Option<FileSet>,
    pub output: Option<FileSet>,
    pub depends: Option<FileSet>,
    pub shared: BTreeMap<String, Value>,
    pub alias: Option<(String, StepInfo)>,
    /// Non-fatal problems met along the way.
    pub errors: Vec<String>,
    /// Groups whose task was dispatched.
    pub dispatched: Vec<usize>,
    /// Groups skipped, by a valid signature or an abort.
    pub skipped: Vec<usize>,
    /// Variables whose values entered the signatures.
    pub signature_vars: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_names() {
        assert_eq!(Step::new("align").step_name(), "align");
        assert_eq!(Step::new("align").with_index(10).step_name(), "align_10");
    }

    #[test]
    fn active_index_and_list() {
        let last = Active::from_value(&json!(-1)).unwrap();
        assert!(last.allows(4, 5));
        assert!(!last.allows(0, 5));

        let some = Active::from_value(&json!([0, -2])).unwrap();
        let picked: Vec<_> = (0..5).filter(|&i| some.allows(i, 5)).collect();
        assert_eq!(picked, vec![0, 3]);
    }

    #[test]
    fn active_slices_count_from_the_end() {
        let pick = |v: Value, n: usize| {
            let active = Active::from_value(&v).unwrap();
            (0..n).filter(|&i| active.allows(i, n)).collect::<Vec<_>>()
        };
        assert_eq!(pick(json!({"start": 1}), 4), vec![1, 2, 3]);
        assert_eq!(pick(json!({"stop": -1}), 4), vec![0, 1, 2]);
        assert_eq!(pick(json!({"step": 2}), 5), vec![0, 2, 4]);
        assert_eq!(pick(json!({"start": -2, "step": -1}), 4), vec![0, 1, 2]);
        assert_eq!(pick(json!({"start": 10}), 4), Vec::<usize>::new());
        assert_eq!(pick(json!({"step": i64::MIN + 1}), 4), vec![3]);
        assert_eq!(pick(json!({"start": i64::MIN, "stop": i64::MAX}), 3), vec![0, 1, 2]);
    }

    #[test]
    fn bad_active_values_are_rejected() {
        for bad in [
            json!("all"),
            json!([1, "x"]),
            json!({"step": 0}),
            json!({"step": i64::MIN}),
            json!({"from": 1}),
        ] {
            assert!(matches!(
                Active::from_value(&bad),
                Err(EngineError::InvalidOption { .. })
            ));
        }
    }

    #[test]
    fn task_options_validate_keys() {
        let options: BTreeMap<String, Value> = [
            ("concurrent".to_string(), json!(true)),
            ("tags".to_string(), json!("align")),
        ]
        .into_iter()
        .collect();
        let parsed = TaskOptions::from_options(&options).unwrap();
        assert!(parsed.concurrent);
        assert_eq!(parsed.tags, vec!["align"]);

        let unknown: BTreeMap<String, Value> =
            [("walltime".to_string(), json!("1h"))].into_iter().collect();
        assert!(matches!(
            TaskOptions::from_options(&unknown),
            Err(EngineError::UnknownOption { option, .. }) if option == "walltime"
        ));
    }
}
