//! Digital twin validator
//!
//! ```text
//! provision ─▶ baseline replay ─▶ apply patch ─▶ replay ─▶ compare
//!     │                                                       │
//!     └──────────────── release replica ◀─────────────────────┘
//! ```
//!
//! The whole sequence runs under one timeout. Anything short of a clean
//! comparison (timeout, provisioning failure, replay error) yields a failed,
//! inconclusive verdict.

use crate::error::TwinError;
use crate::replica::{ReplicaLease, TwinProvisioner};
use homeostat_core::{Anomaly, Clock, Patch, TwinConfig, TwinMetrics, ValidationVerdict};
use std::sync::Arc;

/// Validates patches on isolated replicas
#[derive(Debug, Clone)]
pub struct TwinValidator {
    provisioner: Arc<dyn TwinProvisioner>,
    config: TwinConfig,
    clock: Arc<dyn Clock>,
}

impl TwinValidator {
    /// Create validator
    #[must_use]
    pub fn new(
        provisioner: Arc<dyn TwinProvisioner>,
        config: TwinConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provisioner,
            config,
            clock,
        }
    }

    /// Validate `patch` for `anomaly`. Never fails: errors become a failed
    /// verdict.
    #[tracing::instrument(skip_all, fields(patch_id = %patch.id, service = %anomaly.service))]
    pub async fn validate(&self, patch: &Patch, anomaly: &Anomaly) -> ValidationVerdict {
        let budget = self.config.timeout();
        match tokio::time::timeout(budget, self.exercise(patch, anomaly)).await {
            Ok(Ok(verdict)) => {
                tracing::info!(passed = verdict.passed, details = %verdict.details, "validation finished");
                verdict
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "validation failed closed");
                ValidationVerdict::inconclusive(patch.id, &e.to_string(), self.clock.now())
            }
            Err(_) => {
                tracing::warn!(timeout_secs = budget.as_secs(), "validation timed out");
                ValidationVerdict::inconclusive(
                    patch.id,
                    &format!("timed out after {}s", budget.as_secs()),
                    self.clock.now(),
                )
            }
        }
    }

    async fn exercise(&self, patch: &Patch, anomaly: &Anomaly) -> Result<ValidationVerdict, TwinError> {
        let lease = ReplicaLease::new(self.provisioner.provision(anomaly).await?);
        let measured = self.measure(&lease, patch).await;
        let released = lease.release().await;

        let (baseline, observed) = measured?;
        if let Err(e) = released {
            tracing::warn!(error = %e, "replica teardown failed after validation");
        }

        let (passed, details) = self.judge(&baseline, &observed);
        Ok(ValidationVerdict {
            patch_id: patch.id,
            passed,
            details,
            validated_at: self.clock.now(),
            baseline: Some(baseline),
            observed: Some(observed),
        })
    }

    async fn measure(
        &self,
        lease: &ReplicaLease,
        patch: &Patch,
    ) -> Result<(TwinMetrics, TwinMetrics), TwinError> {
        let replica = lease.replica()?;
        let requests = self.config.workload_requests;
        let baseline = replica.replay(requests).await?;
        replica.apply_patch(patch).await?;
        let observed = replica.replay(requests).await?;
        Ok((baseline, observed))
    }

    /// Compare post-patch metrics against the pass criteria
    fn judge(&self, baseline: &TwinMetrics, observed: &TwinMetrics) -> (bool, String) {
        if observed.requests == 0 {
            return (false, "replay served no requests".to_string());
        }
        if !observed.error_rate.is_finite() || observed.error_rate > self.config.max_error_rate {
            return (
                false,
                format!(
                    "error rate {:.4} exceeds {:.4}",
                    observed.error_rate, self.config.max_error_rate
                ),
            );
        }

        let regression = latency_regression(baseline.p99_latency_ms, observed.p99_latency_ms);
        if regression > self.config.max_latency_regression {
            return (
                false,
                format!(
                    "p99 latency regressed {:.1}% ({:.1}ms -> {:.1}ms), limit {:.1}%",
                    regression * 100.0,
                    baseline.p99_latency_ms,
                    observed.p99_latency_ms,
                    self.config.max_latency_regression * 100.0
                ),
            );
        }

        (
            true,
            format!(
                "error rate {:.4}, p99 {:.1}ms -> {:.1}ms",
                observed.error_rate, baseline.p99_latency_ms, observed.p99_latency_ms
            ),
        )
    }
}

/// Relative p99 increase; a non-positive baseline counts any latency as none
fn latency_regression(baseline_ms: f64, observed_ms: f64) -> f64 {
    if !observed_ms.is_finite() {
        return f64::INFINITY;
    }
    if baseline_ms <= 0.0 {
        return 0.0;
    }
    (observed_ms - baseline_ms) / baseline_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regression_is_relative_to_baseline() {
        assert!((latency_regression(100.0, 110.0) - 0.1).abs() < 1e-12);
        assert!(latency_regression(100.0, 80.0) < 0.0);
        assert_eq!(latency_regression(0.0, 80.0), 0.0);
        assert!(latency_regression(100.0, f64::NAN).is_infinite());
    }
}
