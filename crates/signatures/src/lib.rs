//! `signatures` crate: persistence of step memoization records.
//!
//! A record remembers, for one step invocation at one group index, the
//! step content token and the signatures of every input, output and
//! dependency file. The executor consults the store before running a group
//! and writes to it once the step has completed. No execution logic lives
//! here.

pub mod error;
pub mod models;
pub mod store;

pub use error::SignatureError;
pub use models::{RecordedFile, SignatureMode, SignatureRecord};
pub use store::{SignatureHandle, SignatureStore};
