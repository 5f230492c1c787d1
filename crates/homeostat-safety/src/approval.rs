//! Human approval gate
//!
//! Escalated decisions wait here for an operator. Each request leaves
//! PENDING exactly once: to APPROVED or REJECTED through [`ApprovalGate::resolve`],
//! or to TIMED_OUT when its deadline passes. Both paths take the same
//! per-request lock, so a late `resolve` racing the timeout sees the
//! terminal status and changes nothing.
//!
//! Only the waiting pipeline suspends; other runs keep going.

use crate::error::ApprovalError;
use chrono::Duration;
use dashmap::DashMap;
use homeostat_core::{ApprovalId, ApprovalRequest, ApprovalStatus, Clock, Decision};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug)]
struct Slot {
    request: Mutex<ApprovalRequest>,
    status_tx: watch::Sender<ApprovalStatus>,
}

impl Slot {
    fn new(request: ApprovalRequest) -> Self {
        let (status_tx, _) = watch::channel(request.status);
        Self {
            request: Mutex::new(request),
            status_tx,
        }
    }
}

/// Registry of approval requests
#[derive(Debug)]
pub struct ApprovalGate {
    requests: DashMap<ApprovalId, Arc<Slot>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    /// Create gate with the given response deadline
    #[must_use]
    pub fn new(timeout: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: DashMap::new(),
            timeout: Duration::from_std(timeout).unwrap_or(Duration::MAX),
            clock,
        }
    }

    /// Open a PENDING request for an escalated decision
    pub fn request_approval(&self, decision: &Decision) -> ApprovalRequest {
        let now = self.clock.now();
        let request = ApprovalRequest {
            id: ApprovalId::new(),
            decision_id: decision.id,
            anomaly_id: decision.anomaly_id,
            requested_at: now,
            deadline: now.checked_add_signed(self.timeout).unwrap_or(now),
            status: ApprovalStatus::Pending,
            resolved_at: None,
            resolver: None,
        };
        self.requests
            .insert(request.id, Arc::new(Slot::new(request.clone())));

        tracing::info!(
            approval_id = %request.id,
            decision_id = %decision.id,
            deadline = %request.deadline,
            "approval requested"
        );
        request
    }

    /// Re-register a request recovered from the audit trail.
    ///
    /// The original deadline is kept; an id already known is left untouched.
    pub fn restore(&self, request: ApprovalRequest) {
        self.requests
            .entry(request.id)
            .or_insert_with(|| Arc::new(Slot::new(request)));
    }

    /// Record the operator's answer.
    ///
    /// # Errors
    /// `AlreadyResolved` if the request is no longer PENDING (including a
    /// deadline that passed before this call), `NotFound` for unknown ids.
    pub fn resolve(
        &self,
        id: ApprovalId,
        approved: bool,
        resolver: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve_with(id, approved, resolver, |_| Ok(()))
    }

    /// Record the operator's answer once `commit` accepts it.
    ///
    /// `commit` sees the resolved request while the request lock is held;
    /// if it fails the request stays PENDING and nobody is woken.
    pub fn resolve_with<E>(
        &self,
        id: ApprovalId,
        approved: bool,
        resolver: impl Into<String>,
        commit: impl FnOnce(&ApprovalRequest) -> Result<(), E>,
    ) -> Result<ApprovalRequest, E>
    where
        E: From<ApprovalError>,
    {
        let slot = self.slot(id)?;
        let mut request = slot.request.lock();
        let now = self.clock.now();

        if request.status == ApprovalStatus::Pending && now >= request.deadline {
            Self::time_out(&slot, &mut request, now);
        }
        if request.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                id,
                status: request.status,
            }
            .into());
        }

        let mut resolved = request.clone();
        resolved.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        resolved.resolved_at = Some(now);
        resolved.resolver = Some(resolver.into());
        commit(&resolved)?;

        *request = resolved;
        slot.status_tx.send_replace(request.status);
        tracing::info!(
            approval_id = %id,
            status = %request.status,
            resolver = request.resolver.as_deref().unwrap_or_default(),
            "approval resolved"
        );
        Ok(request.clone())
    }

    /// Suspend until the request is resolved or its deadline passes.
    ///
    /// Returns the terminal request.
    pub async fn wait(&self, id: ApprovalId) -> Result<ApprovalRequest, ApprovalError> {
        let slot = self.slot(id)?;
        let mut status_rx = slot.status_tx.subscribe();

        let remaining = {
            let request = slot.request.lock();
            if request.status.is_terminal() {
                return Ok(request.clone());
            }
            (request.deadline - self.clock.now())
                .to_std()
                .unwrap_or_default()
        };

        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() || status_rx.borrow_and_update().is_terminal() {
                        break;
                    }
                }
                () = &mut deadline => {
                    let mut request = slot.request.lock();
                    if request.status == ApprovalStatus::Pending {
                        Self::time_out(&slot, &mut request, self.clock.now());
                    }
                    break;
                }
            }
        }

        let request = slot.request.lock().clone();
        Ok(request)
    }

    /// Current state of a request
    pub fn status(&self, id: ApprovalId) -> Result<ApprovalRequest, ApprovalError> {
        Ok(self.slot(id)?.request.lock().clone())
    }

    /// Requests still awaiting an operator, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .iter()
            .map(|slot| slot.value().request.lock().clone())
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        pending
    }

    fn slot(&self, id: ApprovalId) -> Result<Arc<Slot>, ApprovalError> {
        self.requests
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(ApprovalError::NotFound(id))
    }

    fn time_out(slot: &Slot, request: &mut ApprovalRequest, now: chrono::DateTime<chrono::Utc>) {
        request.status = ApprovalStatus::TimedOut;
        request.resolved_at = Some(now);
        slot.status_tx.send_replace(request.status);
        tracing::warn!(approval_id = %request.id, "approval timed out, treated as rejection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homeostat_core::{AnomalyId, DecisionId, ManualClock, Verdict};
    use pretty_assertions::assert_eq;

    fn decision() -> Decision {
        Decision {
            id: DecisionId::new(),
            anomaly_id: AnomalyId::new(),
            verdict: Verdict::Escalate,
            risk_score: 0.9,
            rationale: "risk above threshold".to_string(),
            precedents_considered: Vec::new(),
            patch: None,
            created_at: Utc::now(),
        }
    }

    fn gate() -> (Arc<ApprovalGate>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = ApprovalGate::new(std::time::Duration::from_secs(900), clock.clone());
        (Arc::new(gate), clock)
    }

    #[test]
    fn second_resolve_fails_without_side_effect() {
        let (gate, _) = gate();
        let req = gate.request_approval(&decision());

        let first = gate.resolve(req.id, true, "alice").unwrap();
        assert_eq!(first.status, ApprovalStatus::Approved);

        let err = gate.resolve(req.id, false, "bob").unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyResolved {
                id: req.id,
                status: ApprovalStatus::Approved
            }
        );
        let after = gate.status(req.id).unwrap();
        assert_eq!(after.resolver.as_deref(), Some("alice"));
        assert_eq!(after.status, ApprovalStatus::Approved);
    }

    #[test]
    fn resolve_after_deadline_times_out() {
        let (gate, clock) = gate();
        let req = gate.request_approval(&decision());
        clock.advance(Duration::seconds(901));

        let err = gate.resolve(req.id, true, "alice").unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::AlreadyResolved {
                status: ApprovalStatus::TimedOut,
                ..
            }
        ));
    }

    #[test]
    fn refused_commit_leaves_request_pending() {
        let (gate, _) = gate();
        let req = gate.request_approval(&decision());

        let err = gate
            .resolve_with(req.id, true, "alice", |_| {
                Err(ApprovalError::NotFound(ApprovalId::new()))
            })
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
        assert_eq!(gate.status(req.id).unwrap().status, ApprovalStatus::Pending);

        let mut seen = None;
        let resolved = gate
            .resolve_with(req.id, false, "bob", |r| {
                seen = Some(r.clone());
                Ok::<_, ApprovalError>(())
            })
            .unwrap();
        assert_eq!(seen, Some(resolved.clone()));
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn restored_resolution_is_returned_without_waiting() {
        let (gate, clock) = gate();
        let mut req = gate.request_approval(&decision());
        req.id = ApprovalId::new();
        req.status = ApprovalStatus::Approved;
        req.resolved_at = Some(clock.now());
        req.resolver = Some("alice".to_string());
        gate.restore(req.clone());

        assert_eq!(gate.wait(req.id).await.unwrap(), req);
        assert!(gate.pending().iter().all(|r| r.id != req.id));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (gate, _) = gate();
        let id = ApprovalId::new();
        assert_eq!(gate.status(id).unwrap_err(), ApprovalError::NotFound(id));
    }

    #[test]
    fn pending_lists_only_open_requests() {
        let (gate, _) = gate();
        let a = gate.request_approval(&decision());
        let b = gate.request_approval(&decision());
        gate.resolve(a.id, false, "alice").unwrap();
        let pending: Vec<ApprovalId> = gate.pending().into_iter().map(|r| r.id).collect();
        assert_eq!(pending, vec![b.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_on_resolution() {
        let (gate, _) = gate();
        let req = gate.request_approval(&decision());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait(req.id).await })
        };
        tokio::task::yield_now().await;
        gate.resolve(req.id, true, "alice").unwrap();

        let done = waiter.await.unwrap().unwrap();
        assert_eq!(done.status, ApprovalStatus::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_at_deadline() {
        let (gate, _) = gate();
        let req = gate.request_approval(&decision());

        let done = gate.wait(req.id).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::TimedOut);
        tokio_test::assert_err!(gate.resolve(req.id, true, "late"));
    }

    #[tokio::test]
    async fn restored_request_keeps_original_deadline() {
        let (gate, clock) = gate();
        let mut req = gate.request_approval(&decision());
        req.id = ApprovalId::new();
        req.deadline = clock.now() - Duration::seconds(1);
        gate.restore(req.clone());

        let done = gate.wait(req.id).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::TimedOut);
    }
}
