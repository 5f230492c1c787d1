//! Shared error plumbing
//!
//! Component errors live next to their components; this module holds the
//! configuration error and the retry classification every component
//! implements.

use std::path::PathBuf;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted field path
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

impl ConfigError {
    /// Create out-of-range error
    #[inline]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Classifies errors for the bounded retry policy
pub trait Retryable {
    /// Whether a retry with backoff may succeed
    fn is_retryable(&self) -> bool;
}
