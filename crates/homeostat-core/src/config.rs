//! Homeostat configuration
//!
//! Policy parameters (similarity threshold, risk weights, breaker limits,
//! timeouts) are configuration, never constants. Every section has working
//! defaults; a TOML file only needs to override what differs.
//!
//! ```toml
//! [decision]
//! similarity_threshold = 0.9
//!
//! [topology]
//! payment-api = ["checkout", "billing"]
//! ```

use crate::error::ConfigError;
use crate::types::RiskClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeostatConfig {
    /// Decision engine policy
    pub decision: DecisionConfig,
    /// Risk weighting
    pub risk: RiskConfig,
    /// Service → dependent services, used for blast radius
    pub topology: BTreeMap<String, Vec<String>>,
    /// Circuit breaker limits
    pub breaker: BreakerConfig,
    /// Digital twin validation
    pub twin: TwinConfig,
    /// Human approval gate
    pub approval: ApprovalConfig,
    /// Retry policy for infrastructure errors
    pub retry: RetryConfig,
    /// Pipeline scheduling
    pub orchestrator: OrchestratorConfig,
    /// Persistence
    pub storage: StorageConfig,
}

impl HomeostatConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// With a data directory (enables durable stores)
    #[inline]
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = Some(dir.into());
        self
    }

    /// With dependents for a service
    #[must_use]
    pub fn with_dependents(mut self, service: impl Into<String>, dependents: &[&str]) -> Self {
        self.topology.insert(
            service.into(),
            dependents.iter().map(|s| (*s).to_string()).collect(),
        );
        self
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.decision;
        if !(0.0..=1.0).contains(&d.similarity_threshold) {
            return Err(ConfigError::invalid(
                "decision.similarity_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&d.high_risk_threshold) {
            return Err(ConfigError::invalid(
                "decision.high_risk_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&d.precedent_damping) {
            return Err(ConfigError::invalid(
                "decision.precedent_damping",
                "must be within [0, 1]",
            ));
        }
        if d.top_k == 0 {
            return Err(ConfigError::invalid("decision.top_k", "must be positive"));
        }
        if d.embedding_dims < 8 {
            return Err(ConfigError::invalid(
                "decision.embedding_dims",
                "must be at least 8",
            ));
        }

        let r = &self.risk;
        for (field, w) in [
            ("risk.severity_weight", r.severity_weight),
            ("risk.blast_radius_weight", r.blast_radius_weight),
            ("risk.patch_weight", r.patch_weight),
        ] {
            if w < 0.0 || !w.is_finite() {
                return Err(ConfigError::invalid(field, "must be a non-negative number"));
            }
        }
        if r.total_weight() <= 0.0 {
            return Err(ConfigError::invalid("risk", "weights must not all be zero"));
        }
        if r.blast_radius_cap == 0 {
            return Err(ConfigError::invalid("risk.blast_radius_cap", "must be positive"));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker.failure_threshold",
                "must be positive",
            ));
        }
        if b.max_cooldown_secs < b.cooldown_secs {
            return Err(ConfigError::invalid(
                "breaker.max_cooldown_secs",
                "must be >= breaker.cooldown_secs",
            ));
        }

        if self.twin.timeout_secs == 0 {
            return Err(ConfigError::invalid("twin.timeout_secs", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.twin.max_error_rate) {
            return Err(ConfigError::invalid(
                "twin.max_error_rate",
                "must be within [0, 1]",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be positive"));
        }
        if self.orchestrator.max_concurrent_runs == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.max_concurrent_runs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Distance metric for precedent similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// Cosine similarity
    #[default]
    Cosine,
    /// `1 / (1 + euclidean distance)`
    Euclidean,
}

/// Decision engine policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum similarity for a precedent to count
    pub similarity_threshold: f32,
    /// Number of nearest precedents retrieved
    pub top_k: usize,
    /// Risk above this always escalates
    pub high_risk_threshold: f64,
    /// How strongly a successful precedent dampens risk, in `[0, 1]`
    pub precedent_damping: f64,
    /// First-sighting signals younger than this wait (0 disables)
    pub transient_window_secs: u64,
    /// Similarity metric
    pub similarity_metric: SimilarityMetric,
    /// Fingerprint dimensionality
    pub embedding_dims: usize,
}

impl DecisionConfig {
    /// Self-resolving window
    #[inline]
    #[must_use]
    pub fn transient_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.transient_window_secs).unwrap_or(i64::MAX))
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            top_k: 5,
            high_risk_threshold: 0.7,
            precedent_damping: 0.5,
            transient_window_secs: 120,
            similarity_metric: SimilarityMetric::Cosine,
            embedding_dims: 64,
        }
    }
}

/// Risk weighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Weight of anomaly severity
    pub severity_weight: f64,
    /// Weight of blast radius
    pub blast_radius_weight: f64,
    /// Weight of patch risk class
    pub patch_weight: f64,
    /// Dependents count at which blast radius saturates
    pub blast_radius_cap: usize,
    /// Risk class assumed when no patch is known
    pub unknown_patch_class: RiskClass,
}

impl RiskConfig {
    /// Sum of term weights
    #[inline]
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.severity_weight + self.blast_radius_weight + self.patch_weight
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            severity_weight: 0.4,
            blast_radius_weight: 0.3,
            patch_weight: 0.3,
            blast_radius_cap: 10,
            unknown_patch_class: RiskClass::Medium,
        }
    }
}

/// Circuit breaker limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Failure counting window
    pub window_secs: u64,
    /// Initial open cooldown
    pub cooldown_secs: u64,
    /// Cooldown cap for exponential backoff
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_secs: 300,
            cooldown_secs: 60,
            max_cooldown_secs: 3600,
        }
    }
}

/// Digital twin validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    /// Whole-validation timeout
    pub timeout_secs: u64,
    /// Maximum post-patch error rate
    pub max_error_rate: f64,
    /// Maximum allowed p99 regression over baseline (0.1 = 10%)
    pub max_latency_regression: f64,
    /// Requests per replay
    pub workload_requests: u64,
    /// Replay command for the command-driven replica provisioner
    pub replay_command: Vec<String>,
}

impl TwinConfig {
    /// Validation timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_error_rate: 0.01,
            max_latency_regression: 0.10,
            workload_requests: 1000,
            replay_command: Vec::new(),
        }
    }
}

/// Human approval gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Default-deny deadline
    pub timeout_secs: u64,
}

impl ApprovalConfig {
    /// Approval deadline
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: 900 }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    /// First backoff
    pub base_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Backoff before attempt `attempt` (1-based retry count)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

/// Pipeline scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pipelines allowed to run at once
    pub max_concurrent_runs: usize,
    /// Budget for the external patch generator
    pub patch_timeout_ms: u64,
}

impl OrchestratorConfig {
    /// Patch generator timeout
    #[inline]
    #[must_use]
    pub fn patch_timeout(&self) -> Duration {
        Duration::from_millis(self.patch_timeout_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 32,
            patch_timeout_ms: 10_000,
        }
    }
}

/// Persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for audit log, precedents, and circuit table; `None` keeps
    /// everything in memory
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Audit log path
    #[must_use]
    pub fn audit_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("audit.log"))
    }

    /// Precedent log path
    #[must_use]
    pub fn precedents_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("precedents.log"))
    }

    /// Circuit table directory
    #[must_use]
    pub fn circuits_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("circuits"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_validate() {
        let config = HomeostatConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decision.similarity_threshold, 0.85);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = HomeostatConfig::from_toml_str(
            r#"
            [decision]
            high_risk_threshold = 0.6

            [topology]
            payment-api = ["checkout", "billing"]
            "#,
        )
        .unwrap();

        assert_eq!(config.decision.high_risk_threshold, 0.6);
        assert_eq!(config.decision.top_k, 5);
        assert_eq!(config.topology["payment-api"].len(), 2);
        assert_eq!(config.breaker, BreakerConfig::default());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err = HomeostatConfig::from_toml_str(
            r#"
            [decision]
            similarity_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("decision.similarity_threshold"));
    }

    #[test]
    fn retry_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(10), Duration::from_millis(2000));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homeostat.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 5\n").unwrap();

        let config = HomeostatConfig::load(&path).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn storage_paths_follow_data_dir() {
        let config = HomeostatConfig::new().with_data_dir("/var/lib/homeostat");
        assert_eq!(
            config.storage.audit_path().unwrap(),
            PathBuf::from("/var/lib/homeostat/audit.log")
        );
        assert!(HomeostatConfig::new().storage.circuits_dir().is_none());
    }
}
