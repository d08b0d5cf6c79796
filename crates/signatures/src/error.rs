//! Typed error type for the signatures crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize signature record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unknown signature mode '{0}' (expected default, assert, construct or ignore)")]
    UnknownMode(String),
}
