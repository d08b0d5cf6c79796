//! `ShellEvaluator`: runs actions through `sh -c`.
//!
//! Namespace variables are exported to the child as environment variables:
//! scalars verbatim, lists of scalars space-separated, anything else as
//! JSON. Expressions and directive arguments follow the JSON convention of
//! [`crate::args`].

use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tracing::debug;

use crate::args::{eval_json_args, eval_literal};
use crate::namespace::RESERVED_NAMES;
use crate::{DirectiveArgs, EvalError, Evaluator, Namespace};

#[derive(Debug, Clone)]
pub struct ShellEvaluator {
    shell: String,
}

impl Default for ShellEvaluator {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

impl ShellEvaluator {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

fn env_repr(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) if items.iter().all(|v| !v.is_array() && !v.is_object()) => items
            .iter()
            .map(env_repr)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}

impl ShellEvaluator {
    fn run(
        &self,
        script: &str,
        ns: &mut Namespace,
        workdir: Option<&Path>,
    ) -> Result<Value, EvalError> {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(script);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        let names: Vec<String> = ns
            .names()
            .map(str::to_owned)
            .chain(RESERVED_NAMES.iter().map(|n| n.to_string()))
            .filter(|n| is_env_name(n))
            .collect();
        for name in names {
            if let Some(value) = ns.read(&name) {
                command.env(&name, env_repr(&value));
            }
        }

        debug!("running shell action with {}", self.shell);
        let status = command
            .status()
            .map_err(|e| EvalError::Failed(format!("cannot spawn {}: {e}", self.shell)))?;
        if status.success() {
            Ok(Value::Null)
        } else {
            Err(EvalError::Failed(format!("{} exited with {status}", self.shell)))
        }
    }
}

impl Evaluator for ShellEvaluator {
    fn eval(&self, expr: &str, ns: &mut Namespace) -> Result<Value, EvalError> {
        eval_literal(expr, ns)
    }

    fn exec(&self, script: &str, ns: &mut Namespace) -> Result<Value, EvalError> {
        self.run(script, ns, None)
    }

    fn exec_in(
        &self,
        script: &str,
        ns: &mut Namespace,
        workdir: Option<&Path>,
    ) -> Result<Value, EvalError> {
        self.run(script, ns, workdir)
    }

    fn eval_args(&self, text: &str, ns: &mut Namespace) -> Result<DirectiveArgs, EvalError> {
        eval_json_args(text, ns)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exports_variables_and_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut ns = Namespace::new();
        ns.assign("names", json!(["a", "b"])).unwrap();
        ns.assign("target", json!(out.to_str().unwrap())).unwrap();

        let shell = ShellEvaluator::default();
        shell
            .exec("printf '%s' \"$names\" > \"$target\"", &mut ns)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a b");

        assert!(matches!(
            shell.exec("exit 3", &mut ns),
            Err(EvalError::Failed(_))
        ));

        shell
            .exec_in("pwd > here.txt", &mut ns, Some(dir.path()))
            .unwrap();
        assert!(dir.path().join("here.txt").exists());
    }
}
