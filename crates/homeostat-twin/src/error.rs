//! Error types for digital twin validation

use homeostat_core::Retryable;

/// Replica lifecycle and replay errors
#[derive(Debug, thiserror::Error)]
pub enum TwinError {
    /// Replica could not be created
    #[error("replica provisioning failed: {0}")]
    Provision(String),

    /// Workload replay failed
    #[error("workload replay failed: {0}")]
    Replay(String),

    /// The replica refused the patch
    #[error("patch could not be applied to replica: {0}")]
    PatchRejected(String),

    /// Replica teardown failed
    #[error("replica teardown failed: {0}")]
    Teardown(String),

    /// Replay output was not a metrics document
    #[error("malformed replay metrics: {0}")]
    Metrics(#[from] serde_json::Error),

    /// File system or process failure
    #[error("replica I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for TwinError {
    fn is_retryable(&self) -> bool {
        matches!(self, TwinError::Provision(_) | TwinError::Io(_))
    }
}
