//! Decision engine
//!
//! Turns an anomaly (and optionally a candidate patch) into one of four
//! verdicts. Rules are applied in order; the first that fires wins:
//!
//! 1. Circuit open for the service: WAIT.
//! 2. Young, unrepeated, non-P0 signal: WAIT (likely self-resolving).
//! 3. Look up the nearest precedents above the similarity threshold.
//! 4. Score the risk of acting with the candidate patch, or with the
//!    remediation of the best matching successful precedent.
//! 5. Risk above the high-risk threshold: ESCALATE.
//! 6. A matching successful precedent at least as critical: INTERVENE, with
//!    the risk damped by precedent confidence.
//! 7. Nothing to apply: REJECT.
//! 8. Otherwise: INTERVENE.
//!
//! Given the same anomaly, candidate, store contents, breaker state, and
//! clock reading, the verdict, score, rationale, and considered precedents
//! are identical.

use crate::error::{HomeostatError, PatchSourceError};
use chrono::{DateTime, Utc};
use homeostat_core::{
    Anomaly, BreakerState, Clock, Decision, DecisionConfig, DecisionId, HomeostatConfig, Outcome,
    Patch, Severity, Verdict,
};
use homeostat_ledger::{Embedder, FeatureHashEmbedder, PrecedentMatch, PrecedentStore};
use homeostat_safety::{CircuitBreaker, RiskAssessor};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rationale for rule 1
pub const CIRCUIT_OPEN: &str = "circuit open";

/// External remediation generator
#[async_trait::async_trait]
pub trait PatchSource: Send + Sync {
    /// Propose a patch for `anomaly`, or `None` if there is nothing to offer
    async fn candidate_patch(&self, anomaly: &Anomaly) -> Result<Option<Patch>, PatchSourceError>;
}

/// Combines precedents, risk, and the circuit breaker into decisions
pub struct DecisionEngine {
    config: DecisionConfig,
    precedents: Arc<dyn PrecedentStore>,
    embedder: Arc<dyn Embedder>,
    risk: RiskAssessor,
    breaker: Arc<CircuitBreaker>,
    patch_source: Arc<dyn PatchSource>,
    patch_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("embedder", &self.embedder)
            .field("precedents", &self.precedents.len())
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// Create engine
    ///
    /// # Arguments
    /// * `config` - Full configuration; decision, risk, topology, and
    ///   orchestrator sections are read
    /// * `precedents` - Shared precedent store
    /// * `breaker` - Shared circuit breaker
    /// * `patch_source` - Remediation generator used by [`evaluate`](Self::evaluate)
    /// * `clock` - Time source
    #[must_use]
    pub fn new(
        config: &HomeostatConfig,
        precedents: Arc<dyn PrecedentStore>,
        breaker: Arc<CircuitBreaker>,
        patch_source: Arc<dyn PatchSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: config.decision.clone(),
            precedents,
            embedder: Arc::new(FeatureHashEmbedder::new(config.decision.embedding_dims)),
            risk: RiskAssessor::new(config.risk.clone(), config.topology.clone()),
            breaker,
            patch_source,
            patch_timeout: config.orchestrator.patch_timeout(),
            clock,
        }
    }

    /// Replace the default embedder
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Fingerprint of an anomaly under the configured embedder
    #[must_use]
    pub fn fingerprint(&self, anomaly: &Anomaly) -> Vec<f32> {
        self.embedder.embed(anomaly)
    }

    /// Pipeline entry: cheap gates first, then the patch generator, then
    /// [`decide`](Self::decide).
    ///
    /// An open circuit or a self-resolving signal never reaches the
    /// generator. Generator errors and timeouts count as "no patch".
    #[tracing::instrument(skip_all, fields(anomaly_id = %anomaly.id, service = %anomaly.service))]
    pub async fn evaluate(&self, anomaly: &Anomaly) -> Result<Decision, HomeostatError> {
        let now = self.clock.now();
        if self.breaker.peek(&anomaly.service) == BreakerState::Open {
            return Ok(self.wait(anomaly, CIRCUIT_OPEN.to_string(), now));
        }
        if let Some(rationale) = self.transient_rationale(anomaly, now) {
            return Ok(self.wait(anomaly, rationale, now));
        }

        let candidate =
            match tokio::time::timeout(self.patch_timeout, self.patch_source.candidate_patch(anomaly))
                .await
            {
                Ok(Ok(patch)) => patch,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "patch source failed, deciding without a candidate");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.patch_timeout.as_millis(),
                        "patch source timed out, deciding without a candidate"
                    );
                    None
                }
            };

        self.decide(anomaly, candidate)
    }

    /// Decide what to do about `anomaly`
    pub fn decide(
        &self,
        anomaly: &Anomaly,
        candidate: Option<Patch>,
    ) -> Result<Decision, HomeostatError> {
        let now = self.clock.now();

        if !self.breaker.allow_for(&anomaly.service, anomaly.id)? {
            return Ok(self.wait(anomaly, CIRCUIT_OPEN.to_string(), now));
        }
        if let Some(rationale) = self.transient_rationale(anomaly, now) {
            return Ok(self.wait(anomaly, rationale, now));
        }

        let fingerprint = self.fingerprint(anomaly);
        let matches = self.precedents.nearest(
            &fingerprint,
            self.config.top_k,
            self.config.similarity_threshold,
        )?;
        let considered = matches.iter().map(|m| m.precedent.id).collect();

        let successful: Vec<&PrecedentMatch> = matches
            .iter()
            .filter(|m| m.precedent.outcome == Outcome::Success)
            .collect();
        let from_candidate = candidate.is_some();
        let patch = candidate.or_else(|| {
            successful
                .iter()
                .find_map(|m| m.precedent.remediation.as_ref())
                .map(|p| p.reissue_for(anomaly.id))
        });

        let raw = self.risk.score(anomaly, patch.as_ref());
        let decision = |verdict: Verdict, risk_score: f64, rationale: String, patch: Option<Patch>| {
            Decision {
                id: DecisionId::new(),
                anomaly_id: anomaly.id,
                verdict,
                risk_score,
                rationale,
                precedents_considered: considered,
                patch,
                created_at: now,
            }
        };

        if raw > self.config.high_risk_threshold {
            return Ok(decision(
                Verdict::Escalate,
                raw,
                format!(
                    "risk {raw:.3} exceeds threshold {:.3}",
                    self.config.high_risk_threshold
                ),
                patch,
            ));
        }

        let Some(patch) = patch else {
            return Ok(decision(
                Verdict::Reject,
                raw,
                "no candidate patch and no matching successful precedent".to_string(),
                None,
            ));
        };

        let covering = successful
            .iter()
            .find(|m| anomaly.severity.criticality() <= m.precedent.severity.criticality());
        if let Some(best) = covering {
            let confidence = f64::from(best.similarity) * success_ratio(&matches);
            let damped = raw * (1.0 - self.config.precedent_damping * confidence);
            return Ok(decision(
                Verdict::Intervene,
                damped.clamp(0.0, 1.0),
                format!(
                    "matches successful precedent {} (similarity {:.3}, confidence {confidence:.3}); risk {raw:.3} damped to {damped:.3}",
                    best.precedent.id, best.similarity
                ),
                Some(patch),
            ));
        }

        let source = if from_candidate {
            "candidate patch"
        } else {
            "precedent remediation"
        };
        Ok(decision(
            Verdict::Intervene,
            raw,
            format!(
                "{source} risk {raw:.3} within threshold {:.3}",
                self.config.high_risk_threshold
            ),
            Some(patch),
        ))
    }

    fn transient_rationale(&self, anomaly: &Anomaly, now: DateTime<Utc>) -> Option<String> {
        let window = self.config.transient_window();
        let age = now - anomaly.observed_at;
        let transient = anomaly.severity != Severity::P0
            && window > chrono::Duration::zero()
            && !anomaly.is_repeat()
            && age < window;
        transient.then(|| {
            format!(
                "signal {}s old and not repeated; waiting {}s for self-resolution",
                age.num_seconds().max(0),
                window.num_seconds()
            )
        })
    }

    fn wait(&self, anomaly: &Anomaly, rationale: String, now: DateTime<Utc>) -> Decision {
        tracing::debug!(anomaly_id = %anomaly.id, %rationale, "waiting");
        Decision {
            id: DecisionId::new(),
            anomaly_id: anomaly.id,
            verdict: Verdict::Wait,
            risk_score: 0.0,
            rationale,
            precedents_considered: Vec::new(),
            patch: None,
            created_at: now,
        }
    }
}

/// Successes over decided outcomes among the matches (unknowns ignored)
fn success_ratio(matches: &[PrecedentMatch]) -> f64 {
    let (success, decided) = matches.iter().fold((0u32, 0u32), |(s, d), m| match m.precedent.outcome {
        Outcome::Success => (s + 1, d + 1),
        Outcome::Failure => (s, d + 1),
        Outcome::Unknown => (s, d),
    });
    if decided == 0 {
        0.0
    } else {
        f64::from(success) / f64::from(decided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_core::{AnomalyId, Precedent, PrecedentId};

    fn matched(outcome: Outcome, similarity: f32) -> PrecedentMatch {
        PrecedentMatch {
            precedent: Precedent {
                id: PrecedentId::new(),
                anomaly_id: AnomalyId::new(),
                service: "svc".to_string(),
                severity: Severity::P2,
                anomaly_fingerprint: vec![1.0],
                decision_taken: Verdict::Intervene,
                outcome,
                remediation: None,
                created_at: Utc::now(),
            },
            similarity,
        }
    }

    #[test]
    fn success_ratio_ignores_unknown_outcomes() {
        let matches = vec![
            matched(Outcome::Success, 0.95),
            matched(Outcome::Failure, 0.9),
            matched(Outcome::Unknown, 0.9),
            matched(Outcome::Success, 0.88),
        ];
        assert!((success_ratio(&matches) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(success_ratio(&[matched(Outcome::Unknown, 0.9)]), 0.0);
    }
}
