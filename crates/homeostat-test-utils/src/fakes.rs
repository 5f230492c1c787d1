//! Fakes for the external collaborators

use homeostat_core::{Anomaly, Patch, PatchId, RiskClass, TwinMetrics};
use homeostat_engine::{PatchApplicationError, PatchApplier, PatchSource, PatchSourceError};
use homeostat_twin::{Replica, TwinError, TwinProvisioner};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replica host with scripted metrics and lifecycle counters
#[derive(Debug)]
pub struct FakeProvisioner {
    baseline: TwinMetrics,
    patched: TwinMetrics,
    replay_delay: Option<Duration>,
    unavailable: bool,
    provisioned: AtomicUsize,
    torn_down: Arc<AtomicUsize>,
}

impl FakeProvisioner {
    /// Patch fixes the latency and the error rate
    pub fn healthy() -> Self {
        Self::scripted(
            TwinMetrics {
                requests: 1000,
                error_rate: 0.05,
                p99_latency_ms: 2500.0,
            },
            TwinMetrics {
                requests: 1000,
                error_rate: 0.0,
                p99_latency_ms: 120.0,
            },
        )
    }

    /// Patch makes things worse
    pub fn regressing() -> Self {
        Self::scripted(
            TwinMetrics {
                requests: 1000,
                error_rate: 0.001,
                p99_latency_ms: 100.0,
            },
            TwinMetrics {
                requests: 1000,
                error_rate: 0.2,
                p99_latency_ms: 400.0,
            },
        )
    }

    /// Provisioning always fails
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::healthy()
        }
    }

    /// Replays return `baseline` until a patch is applied, then `patched`
    pub fn scripted(baseline: TwinMetrics, patched: TwinMetrics) -> Self {
        Self {
            baseline,
            patched,
            replay_delay: None,
            unavailable: false,
            provisioned: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every replay takes `delay`
    pub fn with_replay_delay(mut self, delay: Duration) -> Self {
        self.replay_delay = Some(delay);
        self
    }

    /// Replicas handed out so far
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Replicas torn down so far
    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TwinProvisioner for FakeProvisioner {
    async fn provision(&self, anomaly: &Anomaly) -> Result<Arc<dyn Replica>, TwinError> {
        if self.unavailable {
            return Err(TwinError::Provision("no capacity".to_string()));
        }
        let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeReplica {
            id: format!("{}-replica-{n}", anomaly.service),
            baseline: self.baseline,
            patched: self.patched,
            replay_delay: self.replay_delay,
            is_patched: AtomicBool::new(false),
            torn_down: Arc::clone(&self.torn_down),
        }))
    }
}

/// Replica handed out by [`FakeProvisioner`]
#[derive(Debug)]
pub struct FakeReplica {
    id: String,
    baseline: TwinMetrics,
    patched: TwinMetrics,
    replay_delay: Option<Duration>,
    is_patched: AtomicBool,
    torn_down: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Replica for FakeReplica {
    fn id(&self) -> &str {
        &self.id
    }

    async fn replay(&self, _requests: u64) -> Result<TwinMetrics, TwinError> {
        if let Some(delay) = self.replay_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(if self.is_patched.load(Ordering::SeqCst) {
            self.patched
        } else {
            self.baseline
        })
    }

    async fn apply_patch(&self, _patch: &Patch) -> Result<(), TwinError> {
        self.is_patched.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), TwinError> {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Patch generator that always proposes the same remediation
#[derive(Debug, Default)]
pub struct StaticPatchSource {
    patch: Option<(String, RiskClass)>,
    calls: AtomicUsize,
}

impl StaticPatchSource {
    /// Always proposes `content` at `risk_class`
    pub fn with_patch(content: &str, risk_class: RiskClass) -> Self {
        Self {
            patch: Some((content.to_string(), risk_class)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Never has a patch
    pub fn none() -> Self {
        Self::default()
    }

    /// Times a patch was requested
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PatchSource for StaticPatchSource {
    async fn candidate_patch(&self, anomaly: &Anomaly) -> Result<Option<Patch>, PatchSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .patch
            .as_ref()
            .map(|(content, class)| Patch::new(anomaly.id, content.clone(), *class)))
    }
}

/// Production applier that records what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingApplier {
    fail: bool,
    blind: bool,
    applied: Mutex<Vec<PatchId>>,
    rolled_back: Mutex<Vec<PatchId>>,
    live: Mutex<HashSet<PatchId>>,
}

impl RecordingApplier {
    /// Every apply succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Every apply fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Cannot tell whether a patch is live
    pub fn blind() -> Self {
        Self {
            blind: true,
            ..Self::default()
        }
    }

    /// Pretend `patch` went live before a crash
    pub fn mark_live(&self, patch: PatchId) {
        self.live.lock().insert(patch);
    }

    /// Patches it was asked to apply, in order
    pub fn applied(&self) -> Vec<PatchId> {
        self.applied.lock().clone()
    }

    /// Patches it was asked to roll back, in order
    pub fn rolled_back(&self) -> Vec<PatchId> {
        self.rolled_back.lock().clone()
    }
}

#[async_trait::async_trait]
impl PatchApplier for RecordingApplier {
    async fn apply(&self, _service: &str, patch: &Patch) -> Result<(), PatchApplicationError> {
        self.applied.lock().push(patch.id);
        if self.fail {
            return Err(PatchApplicationError("deploy rejected".to_string()));
        }
        self.live.lock().insert(patch.id);
        Ok(())
    }

    async fn rollback(&self, _service: &str, patch: &Patch) -> Result<(), PatchApplicationError> {
        self.rolled_back.lock().push(patch.id);
        self.live.lock().remove(&patch.id);
        Ok(())
    }

    async fn is_applied(&self, _service: &str, patch: &Patch) -> Result<bool, PatchApplicationError> {
        if self.blind {
            return Err(PatchApplicationError("deploy API unreachable".to_string()));
        }
        Ok(self.live.lock().contains(&patch.id))
    }
}
