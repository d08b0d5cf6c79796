//! `engine` crate: step model, input grouping and the step execution engine.

pub mod context;
pub mod error;
pub mod executor;
pub mod files;
pub mod input;
pub mod models;
pub mod pattern;

pub use context::{ExecutionContext, ExecutorConfig};
pub use error::{EngineError, TaskFailure};
pub use executor::StepExecutor;
pub use input::{process_input, GroupBy, InputOptions, ProcessedInput, WorkGroup};
pub use models::{
    Active, DirectiveKind, Statement, Step, StepInfo, StepInput, StepOptions, StepResult,
    TaskOptions,
};

#[cfg(test)]
mod executor_tests;
