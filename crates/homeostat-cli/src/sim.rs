//! Simulated collaborators
//!
//! Deterministic stand-ins for the remediation generator, replica host, and
//! production applier so the pipeline can be exercised end to end from a
//! file of anomalies.

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use homeostat_core::{
    Anomaly, AnomalyId, HomeostatConfig, Patch, PatchId, RiskClass, Severity, TwinMetrics,
};
use homeostat_engine::{
    Collaborators, PatchApplicationError, PatchApplier, PatchSource, PatchSourceError, RunOutcome,
    RunResult,
};
use homeostat_twin::{CommandProvisioner, Replica, TwinError, TwinProvisioner};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One line of an anomalies file. Only `service`, `metric_type`, and
/// `severity` are required.
#[derive(Debug, Deserialize)]
struct AnomalyRecord {
    #[serde(default)]
    id: Option<AnomalyId>,
    service: String,
    metric_type: String,
    severity: Severity,
    #[serde(default)]
    observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    occurrences: Option<u32>,
}

/// Read newline-delimited anomaly records.
///
/// Records without `observed_at` count as sustained signals: they are dated
/// one transient window before `now`.
pub fn read_anomalies(
    path: &Path,
    config: &HomeostatConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Anomaly>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading anomalies from {}", path.display()))?;
    let sustained = now - config.decision.transient_window();

    let mut anomalies = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: AnomalyRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed anomaly", path.display(), n + 1))?;
        let mut anomaly = Anomaly::new(
            record.service,
            record.metric_type,
            record.severity,
            record.observed_at.unwrap_or(sustained),
        )
        .with_occurrences(record.occurrences.unwrap_or(1));
        if let Some(id) = record.id {
            anomaly.id = id;
        }
        anomaly.metrics = record.metrics;
        anomalies.push(anomaly);
    }
    Ok(anomalies)
}

/// Collaborators for a simulation run. A configured replay command takes
/// precedence over the simulated replica host.
pub fn collaborators(config: &HomeostatConfig) -> anyhow::Result<Collaborators> {
    let provisioner: Arc<dyn TwinProvisioner> = if config.twin.replay_command.is_empty() {
        Arc::new(SimulatedProvisioner::default())
    } else {
        Arc::new(
            CommandProvisioner::new(config.twin.replay_command.clone())
                .context("configuring replay command")?,
        )
    };
    Ok(Collaborators {
        patch_source: Arc::new(SimulatedPatchSource),
        provisioner,
        applier: Arc::new(SimulatedApplier::default()),
    })
}

/// Proposes a tuning patch whose risk class follows severity. Anomalies
/// with metric type `unknown` get nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedPatchSource;

#[async_trait::async_trait]
impl PatchSource for SimulatedPatchSource {
    async fn candidate_patch(&self, anomaly: &Anomaly) -> Result<Option<Patch>, PatchSourceError> {
        if anomaly.metric_type == "unknown" {
            return Ok(None);
        }
        let class = match anomaly.severity {
            Severity::P0 => RiskClass::High,
            Severity::P1 => RiskClass::Medium,
            Severity::P2 | Severity::P3 => RiskClass::Low,
        };
        let content = format!("tune {} on {}", anomaly.metric_type, anomaly.service);
        Ok(Some(Patch::new(anomaly.id, content, class)))
    }
}

/// Replicas whose metrics derive from the anomaly: the patch cuts the error
/// rate tenfold and p99 latency by 40%.
#[derive(Debug, Default)]
pub struct SimulatedProvisioner {
    provisioned: AtomicUsize,
}

#[async_trait::async_trait]
impl TwinProvisioner for SimulatedProvisioner {
    async fn provision(&self, anomaly: &Anomaly) -> Result<Arc<dyn Replica>, TwinError> {
        let n = self.provisioned.fetch_add(1, Ordering::Relaxed);
        let baseline = TwinMetrics {
            requests: 1000,
            error_rate: anomaly.metrics.get("error_rate").copied().unwrap_or(0.02),
            p99_latency_ms: anomaly.metrics.get("p99_latency_ms").copied().unwrap_or(300.0),
        };
        Ok(Arc::new(SimulatedReplica {
            id: format!("sim-{}-{n}", anomaly.service),
            baseline,
            patched: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct SimulatedReplica {
    id: String,
    baseline: TwinMetrics,
    patched: AtomicBool,
}

#[async_trait::async_trait]
impl Replica for SimulatedReplica {
    fn id(&self) -> &str {
        &self.id
    }

    async fn replay(&self, requests: u64) -> Result<TwinMetrics, TwinError> {
        let mut metrics = TwinMetrics {
            requests,
            ..self.baseline
        };
        if self.patched.load(Ordering::Relaxed) {
            metrics.error_rate /= 10.0;
            metrics.p99_latency_ms *= 0.6;
        }
        Ok(metrics)
    }

    async fn apply_patch(&self, _patch: &Patch) -> Result<(), TwinError> {
        self.patched.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), TwinError> {
        tracing::debug!(replica = %self.id, "replica torn down");
        Ok(())
    }
}

/// Logs what it would deploy
#[derive(Debug, Default)]
pub struct SimulatedApplier {
    live: DashSet<PatchId>,
}

#[async_trait::async_trait]
impl PatchApplier for SimulatedApplier {
    async fn apply(&self, service: &str, patch: &Patch) -> Result<(), PatchApplicationError> {
        tracing::info!(service, patch_id = %patch.id, content = %patch.content, "applying patch");
        self.live.insert(patch.id);
        Ok(())
    }

    async fn rollback(&self, service: &str, patch: &Patch) -> Result<(), PatchApplicationError> {
        tracing::info!(service, patch_id = %patch.id, "rolling back patch");
        self.live.remove(&patch.id);
        Ok(())
    }

    async fn is_applied(&self, _service: &str, patch: &Patch) -> Result<bool, PatchApplicationError> {
        Ok(self.live.contains(&patch.id))
    }
}

/// Plain-text summary of finished runs
pub fn report(outcomes: &[(Anomaly, RunOutcome)]) -> String {
    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    let mut out = String::new();

    let _ = writeln!(out, "Simulation Report");
    let _ = writeln!(out, "=================");
    for (anomaly, outcome) in outcomes {
        *tally.entry(outcome.result.to_string()).or_default() += 1;
        let verdict = outcome
            .decision
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| d.verdict.to_string());
        let risk = outcome
            .decision
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| format!("{:.3}", d.risk_score));
        let _ = writeln!(
            out,
            "{:<20} {:<3} {:<10} risk {:<6} {:<20} {}",
            anomaly.service, anomaly.severity, verdict, risk, outcome.result, outcome.reason
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Runs: {}", outcomes.len());
    for (result, count) in &tally {
        let _ = writeln!(out, "  {result}: {count}");
    }
    out
}

/// Whether every run reached a decision without infrastructure failure
pub fn all_completed(outcomes: &[(Anomaly, RunOutcome)]) -> bool {
    outcomes
        .iter()
        .all(|(_, outcome)| outcome.result != RunResult::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn records_default_to_sustained_signals() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# payments").unwrap();
        writeln!(
            file,
            r#"{{"service":"payment-api","metric_type":"latency","severity":"P2","metrics":{{"p99_latency_ms":2500}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();

        let config = HomeostatConfig::default();
        let anomalies = read_anomalies(file.path(), &config, now()).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].observed_at, now() - config.decision.transient_window());
        assert_eq!(anomalies[0].metrics.get("p99_latency_ms"), Some(&2500.0));
    }

    #[test]
    fn malformed_line_reports_its_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"service":"a","metric_type":"latency","severity":"P9"}}"#).unwrap();

        let err = read_anomalies(file.path(), &HomeostatConfig::default(), now()).unwrap_err();
        assert!(format!("{err}").contains(":1:"), "{err}");
    }

    #[tokio::test]
    async fn simulated_patch_cuts_errors_tenfold() {
        let anomaly = Anomaly::new("payment-api", "error_rate", Severity::P2, now())
            .with_metric("error_rate", 0.05);
        let replica = SimulatedProvisioner::default().provision(&anomaly).await.unwrap();
        let patch = SimulatedPatchSource
            .candidate_patch(&anomaly)
            .await
            .unwrap()
            .unwrap();

        replica.apply_patch(&patch).await.unwrap();
        let after = replica.replay(500).await.unwrap();

        assert_eq!(after.requests, 500);
        assert!((after.error_rate - 0.005).abs() < 1e-12);
        assert_eq!(patch.risk_class, RiskClass::Low);
    }
}
