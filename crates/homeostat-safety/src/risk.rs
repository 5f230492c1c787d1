//! Risk assessment
//!
//! A pure scoring function over three normalized factors:
//!
//! | factor | source | range |
//! |---|---|---|
//! | severity | `Severity::weight` | 0.25 ..= 1.0 |
//! | blast radius | transitive dependents in the topology, capped | 0.0 ..= 1.0 |
//! | patch | `RiskClass::weight` of the patch (or the configured default) | 0.25 ..= 1.0 |
//!
//! The score is the weighted mean of the factors, so it stays in `[0, 1]`
//! and never decreases when any factor increases.

use homeostat_core::{Anomaly, Patch, RiskConfig};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Scores how dangerous acting on an anomaly would be
#[derive(Debug, Clone)]
pub struct RiskAssessor {
    config: RiskConfig,
    /// service -> services that depend on it
    topology: BTreeMap<String, Vec<String>>,
}

impl RiskAssessor {
    /// Create assessor
    #[must_use]
    pub fn new(config: RiskConfig, topology: BTreeMap<String, Vec<String>>) -> Self {
        Self { config, topology }
    }

    /// Risk score in `[0, 1]`
    #[must_use]
    pub fn score(&self, anomaly: &Anomaly, patch: Option<&Patch>) -> f64 {
        let c = &self.config;
        let total = c.total_weight();
        if total <= 0.0 {
            return 0.0;
        }

        let patch_class = patch.map_or(c.unknown_patch_class, |p| p.risk_class);
        let weighted = c.severity_weight * anomaly.severity.weight()
            + c.blast_radius_weight * self.blast_radius_factor(&anomaly.service)
            + c.patch_weight * patch_class.weight();

        (weighted / total).clamp(0.0, 1.0)
    }

    /// Services transitively depending on `service`
    #[must_use]
    pub fn dependents(&self, service: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([service]);
        while let Some(current) = queue.pop_front() {
            for dep in self.topology.get(current).into_iter().flatten() {
                if dep != service && seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    fn blast_radius_factor(&self, service: &str) -> f64 {
        let cap = self.config.blast_radius_cap.max(1);
        let affected = self.dependents(service).len().min(cap);
        #[allow(clippy::cast_precision_loss)]
        let factor = affected as f64 / cap as f64;
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homeostat_core::{AnomalyId, RiskClass, Severity};
    use proptest::prelude::*;

    fn assessor(topology: &[(&str, &[&str])]) -> RiskAssessor {
        let topology = topology
            .iter()
            .map(|(s, deps)| {
                (
                    (*s).to_string(),
                    deps.iter().map(|d| (*d).to_string()).collect(),
                )
            })
            .collect();
        RiskAssessor::new(RiskConfig::default(), topology)
    }

    fn anomaly(service: &str, severity: Severity) -> Anomaly {
        Anomaly::new(service, "latency", severity, Utc::now())
    }

    #[test]
    fn isolated_low_risk_patch_scores_low() {
        let r = assessor(&[]);
        let a = anomaly("payment-api", Severity::P2);
        let patch = Patch::new(a.id, "raise pool size", RiskClass::Low);
        // 0.4 * 0.5 + 0.3 * 0.0 + 0.3 * 0.25
        assert!((r.score(&a, Some(&patch)) - 0.275).abs() < 1e-9);
    }

    #[test]
    fn critical_everything_scores_one() {
        let deps: Vec<String> = (0..12).map(|i| format!("svc-{i}")).collect();
        let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
        let r = assessor(&[("core-db", &dep_refs)]);
        let a = anomaly("core-db", Severity::P0);
        let patch = Patch::new(AnomalyId::new(), "failover", RiskClass::Critical);
        assert!((r.score(&a, Some(&patch)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dependents_are_transitive_and_cycle_safe() {
        let r = assessor(&[
            ("db", &["api"]),
            ("api", &["web", "db"]),
            ("web", &["api"]),
        ]);
        let deps: Vec<String> = r.dependents("db").into_iter().collect();
        assert_eq!(deps, vec!["api".to_string(), "web".to_string()]);
    }

    #[test]
    fn missing_patch_uses_configured_class() {
        let r = assessor(&[]);
        let a = anomaly("payment-api", Severity::P2);
        let medium = Patch::new(a.id, "x", RiskClass::Medium);
        assert!((r.score(&a, None) - r.score(&a, Some(&medium))).abs() < 1e-12);
    }

    fn severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::P0),
            Just(Severity::P1),
            Just(Severity::P2),
            Just(Severity::P3)
        ]
    }

    fn risk_class() -> impl Strategy<Value = RiskClass> {
        prop_oneof![
            Just(RiskClass::Low),
            Just(RiskClass::Medium),
            Just(RiskClass::High),
            Just(RiskClass::Critical)
        ]
    }

    proptest! {
        #[test]
        fn score_is_bounded(s in severity(), class in risk_class(), n in 0usize..20) {
            let deps: Vec<String> = (0..n).map(|i| format!("d{i}")).collect();
            let refs: Vec<&str> = deps.iter().map(String::as_str).collect();
            let r = assessor(&[("svc", &refs)]);
            let a = anomaly("svc", s);
            let score = r.score(&a, Some(&Patch::new(a.id, "p", class)));
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn more_severe_never_scores_lower(a in severity(), b in severity(), class in risk_class()) {
            let r = assessor(&[]);
            let (hi, lo) = if a.criticality() >= b.criticality() { (a, b) } else { (b, a) };
            let patch = Patch::new(AnomalyId::new(), "p", class);
            prop_assert!(
                r.score(&anomaly("svc", hi), Some(&patch)) >= r.score(&anomaly("svc", lo), Some(&patch))
            );
        }
    }
}
