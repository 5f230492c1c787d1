//! Replica provisioning and leases

use crate::error::TwinError;
use homeostat_core::{Anomaly, Patch, TwinMetrics};
use std::fmt::Debug;
use std::sync::Arc;

/// Creates isolated replicas of a service
#[async_trait::async_trait]
pub trait TwinProvisioner: Send + Sync + Debug {
    /// Provision a fresh replica of the anomaly's service
    async fn provision(&self, anomaly: &Anomaly) -> Result<Arc<dyn Replica>, TwinError>;
}

/// An isolated copy of a service that can be patched and exercised
#[async_trait::async_trait]
pub trait Replica: Send + Sync + Debug {
    /// Replica identifier for logs
    fn id(&self) -> &str;

    /// Replay a recorded workload of `requests` requests
    async fn replay(&self, requests: u64) -> Result<TwinMetrics, TwinError>;

    /// Apply the candidate patch to this replica only
    async fn apply_patch(&self, patch: &Patch) -> Result<(), TwinError>;

    /// Destroy the replica
    async fn teardown(&self) -> Result<(), TwinError>;
}

/// Owns a replica until it is released.
///
/// Call [`release`](Self::release) on every normal path. If the lease is
/// dropped instead (the validation future was cancelled by its timeout, or
/// unwound), teardown is spawned on the current tokio runtime.
#[derive(Debug)]
pub struct ReplicaLease {
    replica: Option<Arc<dyn Replica>>,
}

impl ReplicaLease {
    /// Take ownership of a provisioned replica
    #[must_use]
    pub fn new(replica: Arc<dyn Replica>) -> Self {
        Self {
            replica: Some(replica),
        }
    }

    /// The leased replica
    pub fn replica(&self) -> Result<&Arc<dyn Replica>, TwinError> {
        self.replica
            .as_ref()
            .ok_or_else(|| TwinError::Teardown("replica already released".to_string()))
    }

    /// Tear the replica down now
    pub async fn release(mut self) -> Result<(), TwinError> {
        match self.replica.take() {
            Some(replica) => {
                tracing::debug!(replica = replica.id(), "releasing replica");
                replica.teardown().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for ReplicaLease {
    fn drop(&mut self) {
        let Some(replica) = self.replica.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(replica = replica.id(), "replica lease dropped, tearing down");
                handle.spawn(async move {
                    if let Err(e) = replica.teardown().await {
                        tracing::warn!(replica = replica.id(), error = %e, "replica teardown failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    replica = replica.id(),
                    "replica lease dropped outside a runtime, replica leaked"
                );
            }
        }
    }
}
