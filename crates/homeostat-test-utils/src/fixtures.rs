//! Fixtures

use chrono::{DateTime, Duration, TimeZone, Utc};
use homeostat_core::{
    Anomaly, HomeostatConfig, Outcome, Patch, Precedent, PrecedentId, RiskClass, Severity, Verdict,
};
use homeostat_ledger::{Embedder, FeatureHashEmbedder};

/// Fixed start time for manual clocks
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Config tuned for fast tests
pub fn test_config() -> HomeostatConfig {
    let mut config = HomeostatConfig::default();
    config.twin.timeout_secs = 5;
    config.approval.timeout_secs = 60;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.orchestrator.patch_timeout_ms = 500;
    config
}

/// The p99 latency anomaly on payment-api, observed long enough ago to not
/// be considered self-resolving
pub fn payment_latency(now: DateTime<Utc>) -> Anomaly {
    Anomaly::new("payment-api", "latency", Severity::P2, now - Duration::minutes(10))
        .with_metric("p99_latency_ms", 2500.0)
}

/// Aged anomaly for any service and severity
pub fn aged_anomaly(service: &str, severity: Severity, now: DateTime<Utc>) -> Anomaly {
    Anomaly::new(service, "error_rate", severity, now - Duration::minutes(10))
        .with_metric("error_rate", 0.12)
}

/// Fingerprint as the default engine computes it
pub fn fingerprint(config: &HomeostatConfig, anomaly: &Anomaly) -> Vec<f32> {
    FeatureHashEmbedder::new(config.decision.embedding_dims).embed(anomaly)
}

/// Unit vector whose cosine similarity to `query` is exactly `similarity`
pub fn fingerprint_with_similarity(query: &[f32], similarity: f32) -> Vec<f32> {
    let norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
    let q: Vec<f32> = query.iter().map(|x| x / norm).collect();

    // Axis least aligned with q, made orthogonal to it.
    let axis = q
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map_or(0, |(i, _)| i);
    let mut u: Vec<f32> = q.iter().map(|x| -q[axis] * x).collect();
    u[axis] += 1.0;
    let u_norm = u.iter().map(|x| x * x).sum::<f32>().sqrt();

    let s = similarity.clamp(-1.0, 1.0);
    let t = (1.0 - s * s).sqrt();
    q.iter()
        .zip(&u)
        .map(|(qi, ui)| s * qi + t * ui / u_norm)
        .collect()
}

/// Precedent with the given fingerprint and outcome
pub fn precedent(
    anomaly: &Anomaly,
    fingerprint: Vec<f32>,
    outcome: Outcome,
    remediation: Option<Patch>,
) -> Precedent {
    Precedent {
        id: PrecedentId::new(),
        anomaly_id: anomaly.id,
        service: anomaly.service.clone(),
        severity: anomaly.severity,
        anomaly_fingerprint: fingerprint,
        decision_taken: Verdict::Intervene,
        outcome,
        remediation,
        created_at: epoch() - Duration::days(3),
    }
}

/// Low-risk connection pool patch
pub fn pool_patch(anomaly: &Anomaly) -> Patch {
    Patch::new(anomaly.id, "connection_pool.max_size = 64", RiskClass::Low)
}
