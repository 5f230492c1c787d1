//! Pipeline state
//!
//! ```text
//! RECEIVED ─▶ DECIDING ─┬─ WAIT / REJECT ──────────────────────────────▶ DONE
//!                       ├─ ESCALATE ─▶ AWAITING_APPROVAL ─┬─ reject/timeout ─▶ DONE
//!                       │                                 └─ approve ─┐
//!                       └─ INTERVENE ─────────────────────────────────┴▶ VALIDATING
//! VALIDATING ─┬─ fail ─▶ DONE
//!             └─ pass ─▶ APPLYING ─▶ DONE
//! ```
//!
//! Each state carries what is needed to resume from it, and each transition
//! is written to the audit log as a [`RunEvent`] before the pipeline moves
//! on. Two more records share the log: an operator's approval answer, written
//! before `resolve` returns, and an [`OutcomeReport`] once a finished run's
//! outcome has reached the breaker and the precedent store. Recovery replays
//! all three per run.

use chrono::{DateTime, Utc};
use homeostat_core::{
    Anomaly, AnomalyId, ApprovalRequest, AuditDraft, Decision, EntityType, Outcome, Patch, RunId,
    ValidationVerdict, Verdict,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pipeline state and its resume data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Anomaly accepted
    Received {
        /// The anomaly
        anomaly: Anomaly,
    },
    /// Decision in progress
    Deciding,
    /// Escalated, waiting on a human
    AwaitingApproval {
        /// The escalated decision
        decision: Decision,
        /// The open request
        request: ApprovalRequest,
    },
    /// Patch under replica validation
    Validating {
        /// Decision being acted on
        decision: Decision,
        /// Patch under test
        patch: Patch,
        /// Approval that released it, if it was escalated
        #[serde(default)]
        approval: Option<ApprovalRequest>,
    },
    /// Validated patch being applied to production
    Applying {
        /// Decision being acted on
        decision: Decision,
        /// Patch being applied
        patch: Patch,
        /// Passing validation verdict
        validation: ValidationVerdict,
    },
    /// Terminal
    Done {
        /// Final outcome
        outcome: RunOutcome,
    },
}

impl PipelineState {
    /// Stage label
    #[must_use]
    pub fn stage(&self) -> RunStage {
        match self {
            PipelineState::Received { .. } => RunStage::Received,
            PipelineState::Deciding => RunStage::Deciding,
            PipelineState::AwaitingApproval { .. } => RunStage::AwaitingApproval,
            PipelineState::Validating { .. } => RunStage::Validating,
            PipelineState::Applying { .. } => RunStage::Applying,
            PipelineState::Done { .. } => RunStage::Done,
        }
    }

    /// Verdict of the decision carried by this state, if any
    #[must_use]
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            PipelineState::Received { .. } | PipelineState::Deciding => None,
            PipelineState::AwaitingApproval { decision, .. }
            | PipelineState::Validating { decision, .. }
            | PipelineState::Applying { decision, .. } => Some(decision.verdict),
            PipelineState::Done { outcome } => outcome.decision.as_ref().map(|d| d.verdict),
        }
    }

    /// Whether the run has finished
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, PipelineState::Done { .. })
    }
}

/// Stage label of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    /// Anomaly accepted
    Received,
    /// Decision in progress
    Deciding,
    /// Waiting on a human
    AwaitingApproval,
    /// Replica validation
    Validating,
    /// Production apply
    Applying,
    /// Terminal
    Done,
}

impl RunStage {
    /// Upper snake case label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Received => "RECEIVED",
            RunStage::Deciding => "DECIDING",
            RunStage::AwaitingApproval => "AWAITING_APPROVAL",
            RunStage::Validating => "VALIDATING",
            RunStage::Applying => "APPLYING",
            RunStage::Done => "DONE",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Patch validated and applied
    Applied,
    /// Decision was WAIT
    Waited,
    /// Decision was REJECT
    Rejected,
    /// Operator rejected the escalation
    ApprovalDenied,
    /// Nobody answered before the deadline
    ApprovalTimedOut,
    /// Escalation approved but there was nothing to apply
    NoPatch,
    /// Patch failed replica validation
    ValidationFailed,
    /// Patch failed in production and was rolled back
    ApplicationFailed,
    /// Infrastructure failure after retries
    Aborted,
}

impl RunResult {
    /// Outcome recorded in the precedent store
    #[must_use]
    pub fn precedent_outcome(self) -> Outcome {
        match self {
            RunResult::Applied => Outcome::Success,
            RunResult::ValidationFailed | RunResult::ApplicationFailed => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }

    /// Outcome reported to the circuit breaker, `None` when nothing was
    /// attempted
    #[must_use]
    pub fn breaker_outcome(self) -> Option<bool> {
        match self.precedent_outcome() {
            Outcome::Success => Some(true),
            Outcome::Failure => Some(false),
            Outcome::Unknown => None,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunResult::Applied => "applied",
            RunResult::Waited => "waited",
            RunResult::Rejected => "rejected",
            RunResult::ApprovalDenied => "approval_denied",
            RunResult::ApprovalTimedOut => "approval_timed_out",
            RunResult::NoPatch => "no_patch",
            RunResult::ValidationFailed => "validation_failed",
            RunResult::ApplicationFailed => "application_failed",
            RunResult::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Final record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// How it ended
    pub result: RunResult,
    /// Human-readable reason
    pub reason: String,
    /// Decision taken, if one was reached
    pub decision: Option<Decision>,
    /// Approval request, if escalated
    #[serde(default)]
    pub approval: Option<ApprovalRequest>,
    /// Validation verdict, if validated
    #[serde(default)]
    pub validation: Option<ValidationVerdict>,
}

impl RunOutcome {
    /// Outcome carrying only a decision
    #[must_use]
    pub fn decided(result: RunResult, decision: Decision) -> Self {
        Self {
            result,
            reason: decision.rationale.clone(),
            decision: Some(decision),
            approval: None,
            validation: None,
        }
    }

    /// Override the reason
    #[must_use]
    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach an approval request
    #[must_use]
    pub fn with_approval(mut self, approval: Option<ApprovalRequest>) -> Self {
        self.approval = approval;
        self
    }

    /// Attach a validation verdict
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationVerdict) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Audit payload of one transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Run
    pub run_id: RunId,
    /// Anomaly the run handles
    pub anomaly_id: AnomalyId,
    /// Service of that anomaly
    pub service: String,
    /// State entered
    pub state: PipelineState,
}

impl RunEvent {
    /// Audit draft for this event.
    ///
    /// The entity is whatever the transition records: the anomaly on
    /// receipt, the decision on escalation or intervention, the approval
    /// when an escalation is released, the validation verdict before
    /// applying, and the final action on completion.
    pub fn to_draft(&self) -> Result<AuditDraft, serde_json::Error> {
        let (entity_type, entity_id) = match &self.state {
            PipelineState::Received { anomaly } => (EntityType::Anomaly, anomaly.id.to_string()),
            PipelineState::Deciding => (EntityType::Run, self.run_id.to_string()),
            PipelineState::AwaitingApproval { decision, .. }
            | PipelineState::Validating {
                decision,
                approval: None,
                ..
            } => (EntityType::Decision, decision.id.to_string()),
            PipelineState::Validating {
                approval: Some(approval),
                ..
            } => (EntityType::Approval, approval.id.to_string()),
            PipelineState::Applying { validation, .. } => {
                (EntityType::Validation, validation.patch_id.to_string())
            }
            PipelineState::Done { .. } => (EntityType::Action, self.run_id.to_string()),
        };
        let payload = serde_json::to_value(self)?;
        Ok(AuditDraft::new(entity_type, entity_id, payload).for_run(self.run_id, self.anomaly_id))
    }
}

/// Marks a finished run whose outcome reached the breaker and the
/// precedent store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    /// Run
    pub run_id: RunId,
    /// Result that was reported
    pub result: RunResult,
}

impl OutcomeReport {
    /// Audit draft for this marker
    pub fn to_draft(&self, anomaly_id: AnomalyId) -> Result<AuditDraft, serde_json::Error> {
        let payload = serde_json::to_value(self)?;
        Ok(
            AuditDraft::new(EntityType::Run, self.run_id.to_string(), payload)
                .for_run(self.run_id, anomaly_id),
        )
    }
}

/// Audit draft recording an operator's answer to `request`
pub fn resolution_draft(
    run_id: RunId,
    request: &ApprovalRequest,
) -> Result<AuditDraft, serde_json::Error> {
    let payload = serde_json::to_value(request)?;
    Ok(
        AuditDraft::new(EntityType::Approval, request.id.to_string(), payload)
            .for_run(run_id, request.anomaly_id),
    )
}

/// Any run-scoped audit payload
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum JournalRecord {
    Transition(RunEvent),
    Reported(OutcomeReport),
    Resolution(ApprovalRequest),
}

/// Status-query view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Run
    pub run_id: RunId,
    /// Anomaly
    pub anomaly_id: AnomalyId,
    /// Service
    pub service: String,
    /// Current stage
    pub stage: RunStage,
    /// Final outcome once DONE
    pub outcome: Option<RunOutcome>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_core::Severity;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_serializes_with_stage_tag() {
        let value = serde_json::to_value(PipelineState::Deciding).unwrap();
        assert_eq!(value, serde_json::json!({ "stage": "DECIDING" }));
    }

    #[test]
    fn event_draft_roundtrips_through_payload() {
        let anomaly = Anomaly::new("payment-api", "latency", Severity::P2, Utc::now());
        let event = RunEvent {
            run_id: RunId::new(),
            anomaly_id: anomaly.id,
            service: anomaly.service.clone(),
            state: PipelineState::Received {
                anomaly: anomaly.clone(),
            },
        };
        let draft = event.to_draft().unwrap();
        assert_eq!(draft.entity_type, EntityType::Anomaly);
        assert_eq!(draft.run_id, Some(event.run_id));

        let back: RunEvent = serde_json::from_value(draft.payload).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn journal_tells_its_records_apart() {
        let anomaly = Anomaly::new("payment-api", "latency", Severity::P2, Utc::now());
        let run_id = RunId::new();
        let event = RunEvent {
            run_id,
            anomaly_id: anomaly.id,
            service: anomaly.service.clone(),
            state: PipelineState::Deciding,
        };
        let report = OutcomeReport {
            run_id,
            result: RunResult::Applied,
        };

        let decode = |draft: AuditDraft| serde_json::from_value::<JournalRecord>(draft.payload);
        assert!(matches!(
            decode(event.to_draft().unwrap()),
            Ok(JournalRecord::Transition(e)) if e == event
        ));
        assert!(matches!(
            decode(report.to_draft(anomaly.id).unwrap()),
            Ok(JournalRecord::Reported(r)) if r == report
        ));
    }

    #[test]
    fn only_attempts_report_to_the_breaker() {
        assert_eq!(RunResult::Applied.breaker_outcome(), Some(true));
        assert_eq!(RunResult::ValidationFailed.breaker_outcome(), Some(false));
        assert_eq!(RunResult::ApplicationFailed.breaker_outcome(), Some(false));
        assert_eq!(RunResult::Waited.breaker_outcome(), None);
        assert_eq!(RunResult::ApprovalTimedOut.breaker_outcome(), None);
    }
}
