//! Engine-level error types.

use dispatch::DispatchError;
use eval::EvalError;
use signatures::SignatureError;
use thiserror::Error;

use crate::models::{DirectiveKind, StepResult};

/// Longest statement excerpt carried in an error.
const STATEMENT_EXCERPT: usize = 80;

/// Shorten statement text for error messages.
pub fn short_repr(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= STATEMENT_EXCERPT {
        flat
    } else {
        let cut: String = flat.chars().take(STATEMENT_EXCERPT - 3).collect();
        format!("{cut}...")
    }
}

/// One dispatched task that reported a non-zero completion status.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub index: usize,
    pub task_id: String,
    pub ret_code: i32,
    pub message: String,
}

/// Errors produced while running a step.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Configuration errors ------

    #[error("step {step} has more than one input directive")]
    MultipleInputs { step: String },

    /// A directive appeared before the input directive.
    #[error("step input should be specified before other directives (found {directive})")]
    DirectiveBeforeInput { directive: DirectiveKind },

    #[error("unrecognized directive '{0}'")]
    UnknownDirective(String),

    #[error("unrecognized {directive} option '{option}'")]
    UnknownOption {
        directive: DirectiveKind,
        option: String,
    },

    #[error("{directive} directive does not accept positional arguments")]
    UnexpectedArguments { directive: DirectiveKind },

    #[error("invalid value for option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("remote dispatch was selected but no broker is configured")]
    MissingBroker,

    // ------ Data errors ------

    #[error("variable '{0}' is not defined")]
    UndefinedVariable(String),

    #[error("length of variable '{variable}' ({found}) does not match {expected}")]
    LengthMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },

    #[error("cannot group {count} files by {group_by}")]
    UnevenGroups { count: usize, group_by: String },

    #[error("unrecognized file {0}")]
    InvalidFile(String),

    #[error("{0} does not exist")]
    MissingFile(String),

    #[error("pattern variable '{0}' clashes with a reserved name")]
    ReservedPatternVariable(String),

    #[error("overlapping input and output files in group {index}: {}", .files.join(", "))]
    OverlappingFiles { index: usize, files: Vec<String> },

    #[error("signature of group {index} does not match the recorded one")]
    SignatureMismatch { index: usize },

    #[error("output target {target} does not exist after completion of step {step}")]
    MissingOutput { step: String, target: String },

    #[error("output of step {0} is still undetermined after completion")]
    UndeterminedOutput(String),

    // ------ Statement errors ------

    /// A statement failed in the evaluator.
    #[error("failed to process statement '{statement}': {source}")]
    Statement {
        statement: String,
        #[source]
        source: EvalError,
    },

    /// Directive arguments could not be evaluated.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A directive failed; `source` says why.
    #[error("failed to process {directive} directive '{statement}': {source}")]
    Directive {
        directive: DirectiveKind,
        statement: String,
        #[source]
        source: Box<EngineError>,
    },

    // ------ Execution errors ------

    /// Every failing task of the step, plus whatever the step produced.
    #[error("{} task(s) of step {step} failed: {}", .failures.len(), summarize(.failures))]
    Execution {
        step: String,
        failures: Vec<TaskFailure>,
        partial: Box<StepResult>,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn summarize(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{} ({}) exited with {}: {}", f.index, f.task_id, f.ret_code, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub(crate) fn statement(text: &str, source: EvalError) -> Self {
        EngineError::Statement {
            statement: short_repr(text),
            source,
        }
    }

    pub(crate) fn directive(kind: DirectiveKind, text: &str, source: EngineError) -> Self {
        EngineError::Directive {
            directive: kind,
            statement: short_repr(text),
            source: Box::new(source),
        }
    }

    /// The innermost error under any directive wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Directive { source, .. } => source.root(),
            other => other,
        }
    }
}
