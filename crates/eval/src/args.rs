//! Evaluated directive arguments and the JSON argument convention shared by
//! the bundled evaluators.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{EvalError, Namespace};

/// Prefix marking a positional string as a dynamic (resolve-later) pattern.
pub const DYNAMIC_PREFIX: &str = "dynamic:";

/// One positional directive argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    /// A file pattern whose matches are only known once the step has run.
    Dynamic(String),
}

impl Arg {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Arg::Dynamic(_))
    }
}

/// Positional arguments and named options of one directive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectiveArgs {
    pub args: Vec<Arg>,
    pub options: BTreeMap<String, Value>,
}

impl DirectiveArgs {
    pub fn has_dynamic(&self) -> bool {
        self.args.iter().any(Arg::is_dynamic)
    }

    /// Interpret an evaluated value as an argument list:
    /// - `null`: no arguments;
    /// - array: one positional argument per element;
    /// - object: `args` holds the positional argument(s), every other key
    ///   is a named option;
    /// - anything else is a single positional argument.
    ///
    /// Positional strings starting with `dynamic:` become [`Arg::Dynamic`].
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::default(),
            Value::Array(items) => Self {
                args: items.into_iter().map(positional).collect(),
                options: BTreeMap::new(),
            },
            Value::Object(mut map) => {
                let args = match map.remove("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.into_iter().map(positional).collect(),
                    Some(other) => vec![positional(other)],
                };
                Self {
                    args,
                    options: map.into_iter().collect(),
                }
            }
            other => Self {
                args: vec![positional(other)],
                options: BTreeMap::new(),
            },
        }
    }
}

fn positional(value: Value) -> Arg {
    match value {
        Value::String(s) if s.starts_with(DYNAMIC_PREFIX) => {
            Arg::Dynamic(s[DYNAMIC_PREFIX.len()..].to_owned())
        }
        other => Arg::Value(other),
    }
}

fn is_variable_path(text: &str) -> bool {
    !text.is_empty()
        && text.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        })
}

/// Evaluate a JSON literal or a (dotted) variable reference.
///
/// # Errors
/// [`EvalError::Undefined`] for unknown variables and
/// [`EvalError::InvalidExpression`] for anything else.
pub fn eval_literal(expr: &str, ns: &mut Namespace) -> Result<Value, EvalError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(Value::Null);
    }
    if let Ok(value) = serde_json::from_str::<Value>(expr) {
        return Ok(value);
    }
    if is_variable_path(expr) {
        return ns
            .read_path(expr)
            .ok_or_else(|| EvalError::Undefined(expr.to_owned()));
    }
    Err(EvalError::InvalidExpression {
        expr: expr.to_owned(),
        message: "expected a JSON literal or a variable name".into(),
    })
}

/// Evaluate directive text with [`eval_literal`] and interpret the result
/// with [`DirectiveArgs::from_value`].
pub fn eval_json_args(text: &str, ns: &mut Namespace) -> Result<DirectiveArgs, EvalError> {
    eval_literal(text, ns).map(DirectiveArgs::from_value)
}
