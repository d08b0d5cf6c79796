//! The `Evaluator` trait: the contract every script evaluator must fulfil.

use std::path::Path;

use serde_json::Value;

use crate::{DirectiveArgs, EvalError, Namespace};

/// Runs user script fragments against a shared [`Namespace`].
///
/// Implementations record every variable they read through
/// [`Namespace::read`], which is how the engine learns which variables a
/// step depends on for its signature.
pub trait Evaluator: Send + Sync {
    /// Evaluate a single expression and return its value.
    fn eval(&self, expr: &str, ns: &mut Namespace) -> Result<Value, EvalError>;

    /// Execute a statement block (an action) and return the value of its
    /// last expression, if any.
    fn exec(&self, script: &str, ns: &mut Namespace) -> Result<Value, EvalError>;

    /// Execute an action inside `workdir`. Evaluators without a notion of
    /// working directory ignore it.
    fn exec_in(
        &self,
        script: &str,
        ns: &mut Namespace,
        workdir: Option<&Path>,
    ) -> Result<Value, EvalError> {
        let _ = workdir;
        self.exec(script, ns)
    }

    /// Evaluate the argument list of a directive into positional arguments
    /// and named options.
    fn eval_args(&self, text: &str, ns: &mut Namespace) -> Result<DirectiveArgs, EvalError>;
}
