//! Evaluator-level error type.

use thiserror::Error;

/// Errors returned by an [`Evaluator`](crate::Evaluator).
///
/// The engine treats `Abort` specially:
/// - `Abort(Some(msg))`: soft stop, logged as a warning and the group is skipped.
/// - `Abort(None)`: silent stop.
///
/// Every other variant is a hard failure of the statement being evaluated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    /// Explicit in-script abort.
    #[error("{}", .0.as_deref().unwrap_or("execution aborted"))]
    Abort(Option<String>),

    /// The expression referenced a variable that is not in the namespace.
    #[error("variable '{0}' is not defined")]
    Undefined(String),

    /// A statement tried to write one of the engine-owned variables.
    #[error("variable '{0}' is reserved and can only be set through directives")]
    Reserved(String),

    /// The text could not be understood by the evaluator.
    #[error("invalid expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },

    /// The script ran and reported a failure.
    #[error("script failed: {0}")]
    Failed(String),
}

impl EvalError {
    /// `true` for both flavours of in-script abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, EvalError::Abort(_))
    }
}
