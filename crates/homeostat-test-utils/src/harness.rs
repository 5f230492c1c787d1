//! Orchestrator wired to fakes

use crate::fakes::{FakeProvisioner, RecordingApplier, StaticPatchSource};
use crate::fixtures::{epoch, test_config};
use homeostat_core::{Clock, HomeostatConfig, ManualClock, RiskClass};
use homeostat_engine::{Collaborators, HomeostatError, Orchestrator, Stores};
use std::sync::Arc;

/// An orchestrator plus handles on everything it talks to
#[derive(Debug)]
pub struct Harness {
    /// Configuration the orchestrator was built with
    pub config: HomeostatConfig,
    /// Clock shared by the orchestrator and its stores
    pub clock: Arc<ManualClock>,
    /// Remediation generator
    pub patch_source: Arc<StaticPatchSource>,
    /// Replica host
    pub provisioner: Arc<FakeProvisioner>,
    /// Production applier
    pub applier: Arc<RecordingApplier>,
    /// The orchestrator under test
    pub orchestrator: Orchestrator,
}

impl Harness {
    /// Healthy replicas, a low-risk patch, and a working applier
    pub fn healthy() -> Self {
        Self::builder().build()
    }

    /// Start from the healthy defaults
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: test_config(),
            clock: Arc::new(ManualClock::new(epoch())),
            patch_source: StaticPatchSource::with_patch("connection_pool.max_size = 64", RiskClass::Low),
            provisioner: FakeProvisioner::healthy(),
            applier: RecordingApplier::new(),
            stores: None,
        }
    }

    /// A second orchestrator over the same stores and fakes, as after a
    /// process restart
    pub fn restart(&self, stores: Stores) -> Result<Orchestrator, HomeostatError> {
        Orchestrator::new(
            self.config.clone(),
            stores,
            self.collaborators(),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
        )
    }

    /// Stores of the primary orchestrator
    pub fn stores(&self) -> &Stores {
        self.orchestrator.stores()
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            patch_source: Arc::clone(&self.patch_source) as _,
            provisioner: Arc::clone(&self.provisioner) as _,
            applier: Arc::clone(&self.applier) as _,
        }
    }
}

/// Overrides for [`Harness`]
pub struct HarnessBuilder {
    config: HomeostatConfig,
    clock: Arc<ManualClock>,
    patch_source: StaticPatchSource,
    provisioner: FakeProvisioner,
    applier: RecordingApplier,
    stores: Option<Stores>,
}

impl HarnessBuilder {
    /// Adjust the test configuration
    pub fn config(mut self, f: impl FnOnce(&mut HomeostatConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Share an existing clock
    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the remediation generator
    pub fn patch_source(mut self, patch_source: StaticPatchSource) -> Self {
        self.patch_source = patch_source;
        self
    }

    /// Replace the replica host
    pub fn provisioner(mut self, provisioner: FakeProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Replace the production applier
    pub fn applier(mut self, applier: RecordingApplier) -> Self {
        self.applier = applier;
        self
    }

    /// Use pre-built stores instead of fresh in-memory ones
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Wire the orchestrator.
    ///
    /// # Panics
    /// If the configuration does not validate.
    pub fn build(self) -> Harness {
        let clock: Arc<dyn Clock> = Arc::clone(&self.clock) as _;
        let stores = self
            .stores
            .unwrap_or_else(|| Stores::in_memory(&self.config, Arc::clone(&clock)));
        let patch_source = Arc::new(self.patch_source);
        let provisioner = Arc::new(self.provisioner);
        let applier = Arc::new(self.applier);
        let orchestrator = Orchestrator::new(
            self.config.clone(),
            stores,
            Collaborators {
                patch_source: Arc::clone(&patch_source) as _,
                provisioner: Arc::clone(&provisioner) as _,
                applier: Arc::clone(&applier) as _,
            },
            clock,
        )
        .expect("test config is valid");

        Harness {
            config: self.config,
            clock: self.clock,
            patch_source,
            provisioner,
            applier,
            orchestrator,
        }
    }
}
