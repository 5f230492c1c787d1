//! Core data model
//!
//! Defines the entities shared by every Homeostat component:
//! - Anomalies reported by the monitored fleet
//! - Precedents, decisions, patches, and validation verdicts
//! - Circuit and approval state
//! - Audit entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Unique anomaly identifier
    AnomalyId
);
ulid_id!(
    /// Unique precedent identifier
    PrecedentId
);
ulid_id!(
    /// Unique decision identifier
    DecisionId
);
ulid_id!(
    /// Unique patch identifier
    PatchId
);
ulid_id!(
    /// Unique approval request identifier
    ApprovalId
);
ulid_id!(
    /// Unique pipeline run identifier
    RunId
);

/// Anomaly severity. `P0` is the most critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Outage
    P0,
    /// Major degradation
    P1,
    /// Partial degradation
    P2,
    /// Minor
    P3,
}

impl Severity {
    /// Criticality rank, higher is worse (P0 = 3, P3 = 0)
    #[inline]
    #[must_use]
    pub fn criticality(self) -> u8 {
        match self {
            Severity::P0 => 3,
            Severity::P1 => 2,
            Severity::P2 => 1,
            Severity::P3 => 0,
        }
    }

    /// Normalized weight used by risk scoring
    #[inline]
    #[must_use]
    pub fn weight(self) -> f64 {
        f64::from(self.criticality() + 1) / 4.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An observed deviation from expected service behavior.
///
/// Produced by the external observability pipeline; never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Anomaly ID
    pub id: AnomalyId,
    /// Affected service
    pub service: String,
    /// Metric family that deviated (e.g. `latency`, `error_rate`)
    pub metric_type: String,
    /// Severity
    pub severity: Severity,
    /// When the signal was first observed
    pub observed_at: DateTime<Utc>,
    /// Observed metric values
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// How many times the signal has been reported (1 = first sighting)
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
}

fn default_occurrences() -> u32 {
    1
}

impl Anomaly {
    /// Create new anomaly
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        metric_type: impl Into<String>,
        severity: Severity,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AnomalyId::new(),
            service: service.into(),
            metric_type: metric_type.into(),
            severity,
            observed_at,
            metrics: BTreeMap::new(),
            occurrences: 1,
        }
    }

    /// With an observed metric value
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// With a repeat count
    #[must_use]
    pub fn with_occurrences(mut self, occurrences: u32) -> Self {
        self.occurrences = occurrences.max(1);
        self
    }

    /// Whether the signal has been seen more than once
    #[inline]
    #[must_use]
    pub fn is_repeat(&self) -> bool {
        self.occurrences > 1
    }
}

/// Risk class attached to a patch by the remediation generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    /// Config tweak, restart, scale-out
    Low,
    /// Bounded code or config change
    Medium,
    /// Schema, dependency, or broad change
    High,
    /// Irreversible or fleet-wide
    Critical,
}

impl RiskClass {
    /// Normalized weight used by risk scoring
    #[inline]
    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            RiskClass::Low => 0.25,
            RiskClass::Medium => 0.5,
            RiskClass::High => 0.75,
            RiskClass::Critical => 1.0,
        }
    }
}

/// Candidate remediation. `content` is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Patch ID
    pub id: PatchId,
    /// Anomaly this patch remediates
    pub anomaly_id: AnomalyId,
    /// Opaque remediation payload
    pub content: String,
    /// Generator-assigned risk class
    pub risk_class: RiskClass,
}

impl Patch {
    /// Create new patch
    #[must_use]
    pub fn new(anomaly_id: AnomalyId, content: impl Into<String>, risk_class: RiskClass) -> Self {
        Self {
            id: PatchId::new(),
            anomaly_id,
            content: content.into(),
            risk_class,
        }
    }

    /// Re-target a known remediation at a new anomaly
    #[must_use]
    pub fn reissue_for(&self, anomaly_id: AnomalyId) -> Self {
        Self::new(anomaly_id, self.content.clone(), self.risk_class)
    }
}

/// Decision verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Apply a remediation autonomously (after validation)
    Intervene,
    /// Take no action now
    Wait,
    /// Route to a human approver
    Escalate,
    /// No safe remediation known
    Reject,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Intervene => "INTERVENE",
            Verdict::Wait => "WAIT",
            Verdict::Escalate => "ESCALATE",
            Verdict::Reject => "REJECT",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Remediation applied and held
    Success,
    /// Remediation failed validation or application
    Failure,
    /// No intervention happened
    Unknown,
}

/// Historical anomaly → decision → outcome record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precedent {
    /// Precedent ID
    pub id: PrecedentId,
    /// Anomaly the precedent was recorded for
    pub anomaly_id: AnomalyId,
    /// Service of that anomaly
    pub service: String,
    /// Severity of that anomaly
    pub severity: Severity,
    /// Embedding of that anomaly
    pub anomaly_fingerprint: Vec<f32>,
    /// Verdict that was taken
    pub decision_taken: Verdict,
    /// How it turned out
    pub outcome: Outcome,
    /// Patch that was applied, if any
    #[serde(default)]
    pub remediation: Option<Patch>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Output of the decision engine. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Decision ID
    pub id: DecisionId,
    /// Anomaly decided upon
    pub anomaly_id: AnomalyId,
    /// Verdict
    pub verdict: Verdict,
    /// Risk score in `[0, 1]`
    pub risk_score: f64,
    /// Human-readable reasoning
    pub rationale: String,
    /// Precedents that matched above the similarity threshold
    pub precedents_considered: Vec<PrecedentId>,
    /// Remediation this decision acts on
    #[serde(default)]
    pub patch: Option<Patch>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Automation permitted
    Closed,
    /// Automation blocked until cooldown elapses
    Open,
    /// One trial permitted
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Per-service circuit state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Service key
    pub service: String,
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures within the current window
    pub failure_count: u32,
    /// Start of the current failure window
    pub window_start: Option<DateTime<Utc>>,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Cooldown applied to the current open period, in seconds
    pub cooldown_secs: u64,
    /// Times the circuit reopened from half-open since last closing
    pub reopen_count: u32,
    /// Whether the half-open trial has been handed out
    pub trial_in_flight: bool,
    /// Anomaly holding the half-open trial, when granted to one
    #[serde(default)]
    pub trial_holder: Option<AnomalyId>,
}

impl CircuitState {
    /// Fresh closed circuit
    #[must_use]
    pub fn closed(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            window_start: None,
            opened_at: None,
            cooldown_secs: 0,
            reopen_count: 0,
            trial_in_flight: false,
            trial_holder: None,
        }
    }
}

/// Workload metrics measured on a replica
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwinMetrics {
    /// Requests replayed
    pub requests: u64,
    /// Fraction of failed requests
    pub error_rate: f64,
    /// p99 latency
    pub p99_latency_ms: f64,
}

/// Result of validating a patch in a digital twin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Patch validated
    pub patch_id: PatchId,
    /// Whether the patch met the pass criteria
    pub passed: bool,
    /// Explanation
    pub details: String,
    /// Validation time
    pub validated_at: DateTime<Utc>,
    /// Pre-patch replica metrics
    #[serde(default)]
    pub baseline: Option<TwinMetrics>,
    /// Post-patch replica metrics
    #[serde(default)]
    pub observed: Option<TwinMetrics>,
}

impl ValidationVerdict {
    /// Fail-closed verdict for timeouts and provisioning failures
    #[must_use]
    pub fn inconclusive(patch_id: PatchId, reason: &str, validated_at: DateTime<Utc>) -> Self {
        Self {
            patch_id,
            passed: false,
            details: format!("validation inconclusive: {reason}"),
            validated_at,
            baseline: None,
            observed: None,
        }
    }
}

/// Approval request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Awaiting an operator
    Pending,
    /// Operator approved
    Approved,
    /// Operator rejected
    Rejected,
    /// Deadline passed without resolution
    TimedOut,
}

impl ApprovalStatus {
    /// Whether no further transition is allowed
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Human approval request for an escalated decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request ID
    pub id: ApprovalId,
    /// Escalated decision
    pub decision_id: DecisionId,
    /// Anomaly behind the decision
    pub anomaly_id: AnomalyId,
    /// When the request was raised
    pub requested_at: DateTime<Utc>,
    /// Default-deny deadline
    pub deadline: DateTime<Utc>,
    /// Current status
    pub status: ApprovalStatus,
    /// When the request left `Pending`
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it (`None` for timeouts)
    pub resolver: Option<String>,
}

/// Kind of entity an audit entry snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Incoming anomaly
    Anomaly,
    /// Decision engine output
    Decision,
    /// Digital twin verdict
    Validation,
    /// Approval request
    Approval,
    /// Production action (apply / rollback / final outcome)
    Action,
    /// Pipeline bookkeeping transition
    Run,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Anomaly => "anomaly",
            EntityType::Decision => "decision",
            EntityType::Validation => "validation",
            EntityType::Approval => "approval",
            EntityType::Action => "action",
            EntityType::Run => "run",
        };
        f.write_str(s)
    }
}

/// An entry to be appended; the logger assigns `seq`, timestamp, and hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity identifier
    pub entity_id: String,
    /// Owning run, if any
    pub run_id: Option<RunId>,
    /// Owning anomaly, if any
    pub anomaly_id: Option<AnomalyId>,
    /// Snapshot of the entity at this point
    pub payload: serde_json::Value,
}

impl AuditDraft {
    /// Create new draft
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            run_id: None,
            anomaly_id: None,
            payload,
        }
    }

    /// Attach to a run
    #[must_use]
    pub fn for_run(mut self, run_id: RunId, anomaly_id: AnomalyId) -> Self {
        self.run_id = Some(run_id);
        self.anomaly_id = Some(anomaly_id);
        self
    }
}

/// A durable, immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Global sequence number, strictly increasing from 1
    pub seq: u64,
    /// Append time
    pub timestamp: DateTime<Utc>,
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity identifier
    pub entity_id: String,
    /// Owning run, if any
    pub run_id: Option<RunId>,
    /// Owning anomaly, if any
    pub anomaly_id: Option<AnomalyId>,
    /// Snapshot of the entity
    pub payload_snapshot: serde_json::Value,
    /// Hash of the previous entry (zeros for the first)
    #[serde(with = "hex_hash")]
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

mod hex_hash {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn severity_criticality_orders_p0_highest() {
        assert!(Severity::P0.criticality() > Severity::P1.criticality());
        assert!(Severity::P2.criticality() > Severity::P3.criticality());
        assert_eq!(Severity::P0.weight(), 1.0);
        assert_eq!(Severity::P3.weight(), 0.25);
    }

    #[test]
    fn anomaly_defaults_to_first_sighting() {
        let json = r#"{
            "id": "01HZX3J8Q4Y2M5W6E7R8T9V0AB",
            "service": "payment-api",
            "metric_type": "latency",
            "severity": "P2",
            "observed_at": "2026-01-01T00:00:00Z"
        }"#;
        let anomaly: Anomaly = serde_json::from_str(json).unwrap();
        assert_eq!(anomaly.occurrences, 1);
        assert!(!anomaly.is_repeat());
        assert!(anomaly.metrics.is_empty());
    }

    #[test]
    fn verdict_serializes_screaming_case() {
        let json = serde_json::to_string(&Verdict::Intervene).unwrap();
        assert_eq!(json, "\"INTERVENE\"");
        let state = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(state, "\"HALF_OPEN\"");
    }

    #[test]
    fn audit_entry_hashes_encode_as_hex() {
        let entry = AuditEntry {
            seq: 1,
            timestamp: Utc::now(),
            entity_type: EntityType::Run,
            entity_id: "run".to_string(),
            run_id: None,
            anomaly_id: None,
            payload_snapshot: serde_json::json!({}),
            prev_hash: [0u8; 32],
            hash: [0xab; 32],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["hash"].as_str().unwrap(), "ab".repeat(32));

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn inconclusive_verdict_is_fail_closed() {
        let verdict = ValidationVerdict::inconclusive(PatchId::new(), "timeout", Utc::now());
        assert!(!verdict.passed);
        assert!(verdict.details.starts_with("validation inconclusive"));
    }

    #[test]
    fn approval_terminal_states() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::TimedOut.is_terminal());
    }
}
