//! `eval` crate: the contracts the engine consumes from its collaborators.
//!
//! The engine never interprets user script text itself. It hands
//! expressions, directive arguments and action bodies to an [`Evaluator`]
//! that runs them against a [`Namespace`], and it checks files through the
//! [`Target`] abstraction. Both sides of a dispatch (the executor and a
//! worker) import these types from here.

pub mod args;
pub mod error;
pub mod fsutil;
pub mod mock;
pub mod namespace;
pub mod shell;
pub mod target;
pub mod traits;

pub use args::{Arg, DirectiveArgs};
pub use error::EvalError;
pub use namespace::{is_reserved, FileSet, Namespace, NamespaceSnapshot, ReservedSlots};
pub use target::{FileSignature, FileTarget, Target};
pub use traits::Evaluator;
