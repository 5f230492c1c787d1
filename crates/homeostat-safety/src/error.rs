//! Error types for the safety components

use homeostat_core::{ApprovalId, ApprovalStatus, Retryable};
use std::path::PathBuf;

/// Circuit table persistence errors
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// File system failure
    #[error("circuit table I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be encoded
    #[error("circuit state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// A persisted state file is unreadable
    #[error("corrupt circuit state {path}: {reason}")]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// Parse failure
        reason: String,
    },
}

impl Retryable for BreakerError {
    fn is_retryable(&self) -> bool {
        matches!(self, BreakerError::Io(_))
    }
}

/// Approval gate errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    /// No request with this id
    #[error("approval request {0} not found")]
    NotFound(ApprovalId),

    /// The request already left PENDING
    #[error("approval request {id} already resolved as {status}")]
    AlreadyResolved {
        /// Request ID
        id: ApprovalId,
        /// Terminal status it holds
        status: ApprovalStatus,
    },
}

impl Retryable for ApprovalError {
    fn is_retryable(&self) -> bool {
        false
    }
}
