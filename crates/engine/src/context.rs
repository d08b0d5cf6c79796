//! Run-wide configuration, constructed once and passed by reference.

use std::path::PathBuf;

use dispatch::{BackendKind, RemoteConfig};
use signatures::SignatureMode;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the step executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How signatures are consulted before a group runs.
    pub signature_mode: SignatureMode,
    /// Where tasks go when a group dispatches.
    pub backend: BackendKind,
    /// Upper bound on concurrently running tasks of one step.
    pub max_jobs: usize,
    /// Directory holding signature records.
    pub signature_dir: PathBuf,
    /// Polling and retry policy of the remote queue.
    pub remote: RemoteConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            signature_mode: SignatureMode::Default,
            backend: BackendKind::Sync,
            max_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            signature_dir: PathBuf::from(".stepflow").join("signatures"),
            remote: RemoteConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything a run needs besides the step itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub config: ExecutorConfig,
    pub verbosity: u8,
}

impl ExecutionContext {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config,
            verbosity: 1,
        }
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}
