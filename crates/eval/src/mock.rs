//! `MockEvaluator`: a test double for `Evaluator`.
//!
//! Expressions and directive arguments follow the JSON convention of
//! [`crate::args`]. Action scripts are matched verbatim (after trimming)
//! against closures registered with [`MockEvaluator::on`]; unregistered
//! scripts succeed with `null`. Every executed script is recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::args::{eval_json_args, eval_literal};
use crate::{DirectiveArgs, EvalError, Evaluator, Namespace};

/// Behaviour attached to a script or expression.
pub type Action = Arc<dyn Fn(&mut Namespace) -> Result<Value, EvalError> + Send + Sync>;

/// A scripted evaluator that records every action it runs.
#[derive(Clone, Default)]
pub struct MockEvaluator {
    actions: HashMap<String, Action>,
    /// All scripts executed by this evaluator (in call order).
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register behaviour for a script, expression or directive argument
    /// text.
    pub fn on<F>(mut self, script: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut Namespace) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.actions.insert(script.into().trim().to_owned(), Arc::new(action));
        self
    }

    /// Register a script that aborts, with or without a message.
    pub fn aborting(self, script: impl Into<String>, message: Option<&str>) -> Self {
        let message = message.map(str::to_owned);
        self.on(script, move |_| Err(EvalError::Abort(message.clone())))
    }

    /// Number of times `script` has been executed.
    pub fn call_count(&self, script: &str) -> usize {
        let script = script.trim();
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == script)
            .count()
    }

    fn lookup(&self, text: &str) -> Option<Action> {
        self.actions.get(text.trim()).cloned()
    }
}

impl std::fmt::Debug for MockEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEvaluator")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Evaluator for MockEvaluator {
    fn eval(&self, expr: &str, ns: &mut Namespace) -> Result<Value, EvalError> {
        match self.lookup(expr) {
            Some(action) => action(ns),
            None => eval_literal(expr, ns),
        }
    }

    fn exec(&self, script: &str, ns: &mut Namespace) -> Result<Value, EvalError> {
        self.calls.lock().unwrap().push(script.trim().to_owned());
        match self.lookup(script) {
            Some(action) => action(ns),
            None => Ok(Value::Null),
        }
    }

    fn eval_args(&self, text: &str, ns: &mut Namespace) -> Result<DirectiveArgs, EvalError> {
        match self.lookup(text) {
            Some(action) => action(ns).map(DirectiveArgs::from_value),
            None => eval_json_args(text, ns),
        }
    }
}
