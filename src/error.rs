use thiserror::Error;

use crate::database::StoreError;

/// Engine-level error taxonomy. Expected SKIP/NEAR_MISS outcomes are values
/// in `DecisionReason`, never errors; what lands here is either retried,
/// degraded around, or (rarely) fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store trouble after retries; transient at the call site, surfaced as
    /// `data_unavailable` by the scanner and as a deferred check by the
    /// exit loop.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration document. Fatal at startup, a warning on
    /// hot reload.
    #[error("config error: {0}")]
    Config(String),

    /// Impossible input data (handled as SKIP upstream; this variant is for
    /// paths with no decision row to attach it to).
    #[error("data quality: {0}")]
    DataQuality(String),

    /// Impossible internal state. Logged loudly, mutation skipped, never
    /// fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Process exit code for errors that abort startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Store(_) => 2,
            _ => 1,
        }
    }
}
