//! Ledger errors

use homeostat_core::Retryable;
use std::path::PathBuf;

/// Errors from the audit log and precedent store
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Storage I/O failed
    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded
    #[error("cannot encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A durable record could not be decoded
    #[error("corrupt record at {}:{line}: {reason}", path.display())]
    Corrupt {
        /// Log file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Decode failure
        reason: String,
    },

    /// The audit hash chain or sequence is broken
    #[error("audit chain broken at seq {seq}: {reason}")]
    IntegrityViolation {
        /// First offending sequence number
        seq: u64,
        /// What is wrong
        reason: String,
    },

    /// Fingerprint dimensionality does not match the index
    #[error("fingerprint has {got} dimensions, index expects {expected}")]
    DimensionMismatch {
        /// Index dimensionality
        expected: usize,
        /// Offending dimensionality
        got: usize,
    },

    /// A failed append could not be undone; the log needs a reopen
    #[error("log {} refuses writes after a failed append could not be undone", path.display())]
    Poisoned {
        /// Log file
        path: PathBuf,
    },

    /// Backing store temporarily unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_unavailable_are_retryable() {
        let io = LedgerError::Io(std::io::Error::other("disk busy"));
        assert!(io.is_retryable());
        assert!(LedgerError::Unavailable("down".into()).is_retryable());
        assert!(!LedgerError::IntegrityViolation {
            seq: 3,
            reason: "hash".into()
        }
        .is_retryable());
    }
}
