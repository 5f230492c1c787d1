//! Homeostat Core
//!
//! Shared vocabulary for the self-healing decision and safety core:
//! - The data model (anomalies, precedents, decisions, patches, verdicts,
//!   circuit and approval state, audit entries)
//! - Configuration loaded from TOML
//! - The [`Clock`] abstraction
//! - Retry classification for infrastructure errors

#![warn(unreachable_pub)]

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ApprovalConfig, BreakerConfig, DecisionConfig, HomeostatConfig, OrchestratorConfig,
    RetryConfig, RiskConfig, SimilarityMetric, StorageConfig, TwinConfig,
};
pub use error::{ConfigError, Retryable};
pub use types::{
    Anomaly, AnomalyId, ApprovalId, ApprovalRequest, ApprovalStatus, AuditDraft, AuditEntry,
    BreakerState, CircuitState, Decision, DecisionId, EntityType, Outcome, Patch, PatchId,
    Precedent, PrecedentId, RiskClass, RunId, Severity, TwinMetrics, ValidationVerdict, Verdict,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
