//! Unified error type for the pipeline
//!
//! Component errors convert into [`HomeostatError`] with `?`. Most domain
//! failures never surface here: a circuit-open gate becomes a WAIT verdict,
//! a validation timeout becomes a failed verdict, and an approval timeout
//! becomes a rejection. What remains is infrastructure trouble, which the
//! retry policy classifies through [`Retryable`].

use homeostat_core::{ConfigError, Retryable, RunId};
use homeostat_ledger::LedgerError;
use homeostat_safety::{ApprovalError, BreakerError};
use homeostat_twin::TwinError;

/// Error reported by a patch generator
#[derive(Debug, Clone, thiserror::Error)]
#[error("patch source failed: {0}")]
pub struct PatchSourceError(pub String);

/// Error reported by the production patch applier
#[derive(Debug, Clone, thiserror::Error)]
#[error("patch application failed: {0}")]
pub struct PatchApplicationError(pub String);

/// Main Homeostat error type
#[derive(Debug, thiserror::Error)]
pub enum HomeostatError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Audit log or precedent store failure
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Circuit table failure
    #[error("circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// Approval request could not be resolved (includes duplicates)
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Replica infrastructure failure
    #[error("twin error: {0}")]
    Twin(#[from] TwinError),

    /// Applying or querying a production patch failed
    #[error(transparent)]
    PatchApplication(#[from] PatchApplicationError),

    /// Infrastructure that is expected to recover
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// The anomaly cannot enter the pipeline
    #[error("invalid anomaly: {0}")]
    InvalidAnomaly(String),

    /// No run with this id
    #[error("run {0} not found")]
    RunNotFound(RunId),
}

impl HomeostatError {
    /// Whether the retry policy should try again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            HomeostatError::Ledger(e) => e.is_retryable(),
            HomeostatError::Breaker(e) => e.is_retryable(),
            HomeostatError::Twin(e) => e.is_retryable(),
            HomeostatError::TransientInfra(_) => true,
            HomeostatError::Config(_)
            | HomeostatError::Approval(_)
            | HomeostatError::PatchApplication(_)
            | HomeostatError::InvalidAnomaly(_)
            | HomeostatError::RunNotFound(_) => false,
        }
    }
}

impl Retryable for HomeostatError {
    fn is_retryable(&self) -> bool {
        HomeostatError::is_retryable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_core::ApprovalId;

    #[test]
    fn infrastructure_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk busy");
        assert!(HomeostatError::from(LedgerError::Io(io)).is_retryable());
        assert!(HomeostatError::TransientInfra("timeout".into()).is_retryable());
    }

    #[test]
    fn domain_errors_are_not() {
        let dup = ApprovalError::NotFound(ApprovalId::new());
        assert!(!HomeostatError::from(dup).is_retryable());
        assert!(!HomeostatError::PatchApplication(PatchApplicationError("x".into())).is_retryable());
    }
}
