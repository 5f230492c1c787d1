//! Remediation pipeline orchestrator
//!
//! One tokio task per anomaly drives it through the [`PipelineState`]
//! machine. Every transition is appended to the audit log before the next
//! step starts, so the log alone is enough to resume in-flight runs after a
//! crash ([`Orchestrator::recover`]).
//!
//! Work slots are bounded by a semaphore. A run waiting on a human gives its
//! slot back while it waits.
//!
//! A DONE run's outcome is reported to the breaker and the precedent store,
//! then marked reported in the log. Recovery repeats the report for DONE runs
//! without that mark; the precedent is keyed by run id so a repeat does not
//! duplicate it.

use crate::decision::{DecisionEngine, PatchSource};
use crate::error::{HomeostatError, PatchApplicationError};
use crate::pipeline::{
    resolution_draft, JournalRecord, OutcomeReport, PipelineState, RunEvent, RunOutcome,
    RunResult, RunStage, RunStatus,
};
use crate::retry::with_retry;
use dashmap::DashMap;
use homeostat_core::{
    Anomaly, ApprovalId, ApprovalRequest, ApprovalStatus, AuditEntry, Clock, Decision,
    HomeostatConfig, Patch, Precedent, PrecedentId, RunId, ValidationVerdict, Verdict,
};
use homeostat_ledger::{AuditLog, LedgerError, PrecedentLog, PrecedentStore};
use homeostat_safety::{ApprovalError, ApprovalGate, CircuitBreaker};
use homeostat_twin::{TwinProvisioner, TwinValidator};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// Applies validated patches to production
#[async_trait::async_trait]
pub trait PatchApplier: Send + Sync {
    /// Apply `patch` to `service`
    async fn apply(&self, service: &str, patch: &Patch) -> Result<(), PatchApplicationError>;

    /// Undo a failed or partial application
    async fn rollback(&self, service: &str, patch: &Patch) -> Result<(), PatchApplicationError>;

    /// Whether `patch` is already live on `service`
    async fn is_applied(&self, service: &str, patch: &Patch)
        -> Result<bool, PatchApplicationError>;
}

/// State shared beyond a single run
#[derive(Clone)]
pub struct Stores {
    /// Audit log
    pub audit: Arc<AuditLog>,
    /// Precedent store
    pub precedents: Arc<dyn PrecedentStore>,
    /// Circuit breaker
    pub breaker: Arc<CircuitBreaker>,
}

impl Stores {
    /// Volatile stores
    #[must_use]
    pub fn in_memory(config: &HomeostatConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            audit: Arc::new(AuditLog::in_memory(Arc::clone(&clock))),
            precedents: Arc::new(PrecedentLog::in_memory(config.decision.similarity_metric)),
            breaker: Arc::new(CircuitBreaker::in_memory(config.breaker.clone(), clock)),
        }
    }

    /// Durable stores under `storage.data_dir`, or volatile ones if unset
    pub fn open(config: &HomeostatConfig, clock: Arc<dyn Clock>) -> Result<Self, HomeostatError> {
        let storage = &config.storage;
        let (Some(audit), Some(precedents), Some(circuits)) = (
            storage.audit_path(),
            storage.precedents_path(),
            storage.circuits_dir(),
        ) else {
            return Ok(Self::in_memory(config, clock));
        };

        Ok(Self {
            audit: Arc::new(AuditLog::open(audit, Arc::clone(&clock))?),
            precedents: Arc::new(PrecedentLog::open(
                precedents,
                config.decision.similarity_metric,
                config.decision.embedding_dims,
            )?),
            breaker: Arc::new(CircuitBreaker::open(circuits, config.breaker.clone(), clock)?),
        })
    }
}

/// External systems the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Remediation generator
    pub patch_source: Arc<dyn PatchSource>,
    /// Replica host for validation
    pub provisioner: Arc<dyn TwinProvisioner>,
    /// Production patch applier
    pub applier: Arc<dyn PatchApplier>,
}

#[derive(Debug, Clone)]
struct RunContext {
    run_id: RunId,
    anomaly: Anomaly,
}

/// What the log says about one run
#[derive(Debug)]
struct Replay {
    anomaly: Option<Anomaly>,
    state: PipelineState,
    reported: bool,
}

#[derive(Debug)]
struct RunSlot {
    status: Mutex<RunStatus>,
    done: watch::Sender<Option<RunOutcome>>,
}

struct Inner {
    config: HomeostatConfig,
    engine: DecisionEngine,
    validator: TwinValidator,
    approvals: ApprovalGate,
    stores: Stores,
    applier: Arc<dyn PatchApplier>,
    clock: Arc<dyn Clock>,
    runs: DashMap<RunId, Arc<RunSlot>>,
    escalations: DashMap<ApprovalId, RunId>,
    permits: Arc<Semaphore>,
}

/// Sequences decision, approval, validation, and application per anomaly
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runs", &self.inner.runs.len())
            .field("audit_seq", &self.inner.stores.audit.last_seq())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire the pipeline
    pub fn new(
        config: HomeostatConfig,
        stores: Stores,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HomeostatError> {
        config.validate()?;

        let engine = DecisionEngine::new(
            &config,
            Arc::clone(&stores.precedents),
            Arc::clone(&stores.breaker),
            collaborators.patch_source,
            Arc::clone(&clock),
        );
        let validator = TwinValidator::new(
            collaborators.provisioner,
            config.twin.clone(),
            Arc::clone(&clock),
        );
        let approvals = ApprovalGate::new(config.approval.timeout(), Arc::clone(&clock));
        let permits = Arc::new(Semaphore::new(config.orchestrator.max_concurrent_runs));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                engine,
                validator,
                approvals,
                stores,
                applier: collaborators.applier,
                clock,
                runs: DashMap::new(),
                escalations: DashMap::new(),
                permits,
            }),
        })
    }

    /// Accept an anomaly and start its pipeline.
    ///
    /// Returns once the RECEIVED entry is durable; the rest runs in the
    /// background.
    #[tracing::instrument(skip_all, fields(anomaly_id = %anomaly.id, service = %anomaly.service))]
    pub async fn submit_anomaly(&self, anomaly: Anomaly) -> Result<RunId, HomeostatError> {
        if anomaly.service.trim().is_empty() {
            return Err(HomeostatError::InvalidAnomaly(
                "service must not be empty".to_string(),
            ));
        }

        let ctx = RunContext {
            run_id: RunId::new(),
            anomaly,
        };
        let state = PipelineState::Received {
            anomaly: ctx.anomaly.clone(),
        };
        self.inner.register(&ctx, RunStage::Received);
        if let Err(e) = self.inner.record(&ctx, &state).await {
            self.inner.runs.remove(&ctx.run_id);
            return Err(e);
        }

        let run_id = ctx.run_id;
        self.spawn(ctx, state);
        Ok(run_id)
    }

    /// Resume every run the audit log shows as unfinished.
    ///
    /// Finished runs are registered too so their status stays queryable;
    /// those whose outcome was never reported get the report now. Approval
    /// answers found in the log are applied to the restored requests.
    /// Returns the ids of resumed runs.
    pub fn recover(&self) -> Vec<RunId> {
        let mut runs: BTreeMap<RunId, Replay> = BTreeMap::new();
        let mut resolutions: HashMap<ApprovalId, ApprovalRequest> = HashMap::new();
        for entry in self.inner.stores.audit.stream_since(0) {
            if entry.run_id.is_none() {
                continue;
            }
            match serde_json::from_value::<JournalRecord>(entry.payload_snapshot) {
                Ok(JournalRecord::Transition(event)) => {
                    let replay = runs.entry(event.run_id).or_insert_with(|| Replay {
                        anomaly: None,
                        state: PipelineState::Deciding,
                        reported: false,
                    });
                    if let PipelineState::Received { anomaly } = &event.state {
                        replay.anomaly = Some(anomaly.clone());
                    }
                    replay.state = event.state;
                }
                Ok(JournalRecord::Reported(report)) => {
                    if let Some(replay) = runs.get_mut(&report.run_id) {
                        replay.reported = true;
                    }
                }
                Ok(JournalRecord::Resolution(request)) => {
                    resolutions.insert(request.id, request);
                }
                Err(e) => {
                    tracing::warn!(seq = entry.seq, error = %e, "skipping unreadable run entry");
                }
            }
        }

        let mut resumed = Vec::new();
        for (run_id, replay) in runs {
            if self.inner.runs.contains_key(&run_id) {
                continue;
            }
            let Some(anomaly) = replay.anomaly else {
                tracing::warn!(%run_id, "run has no RECEIVED entry, cannot resume");
                continue;
            };
            let ctx = RunContext { run_id, anomaly };
            self.inner.register(&ctx, replay.state.stage());

            match replay.state {
                PipelineState::Done { outcome } if replay.reported => {
                    self.inner.settle(&ctx, outcome);
                }
                PipelineState::Done { outcome } => {
                    tracing::info!(%run_id, result = %outcome.result, "reporting outcome of finished run");
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.finish(&ctx, outcome).await });
                    resumed.push(run_id);
                }
                PipelineState::AwaitingApproval { decision, request } => {
                    let request = resolutions.remove(&request.id).unwrap_or(request);
                    self.inner.approvals.restore(request.clone());
                    if !request.status.is_terminal() {
                        self.inner.escalations.insert(request.id, run_id);
                    }
                    tracing::info!(%run_id, status = %request.status, "resuming escalated run");
                    self.spawn(ctx, PipelineState::AwaitingApproval { decision, request });
                    resumed.push(run_id);
                }
                state => {
                    tracing::info!(%run_id, stage = %state.stage(), "resuming run");
                    self.spawn(ctx, state);
                    resumed.push(run_id);
                }
            }
        }
        resumed
    }

    /// Current status of a run
    pub fn status(&self, run_id: RunId) -> Result<RunStatus, HomeostatError> {
        self.inner
            .runs
            .get(&run_id)
            .map(|slot| slot.status.lock().clone())
            .ok_or(HomeostatError::RunNotFound(run_id))
    }

    /// Status of every known run, oldest first
    #[must_use]
    pub fn statuses(&self) -> Vec<RunStatus> {
        let mut all: Vec<RunStatus> = self
            .inner
            .runs
            .iter()
            .map(|slot| slot.status.lock().clone())
            .collect();
        all.sort_by_key(|s| s.run_id);
        all
    }

    /// Answer an approval request.
    ///
    /// Returns once the answer is durable in the audit log; if it cannot be
    /// written the request stays PENDING.
    pub fn resolve(
        &self,
        request_id: ApprovalId,
        approved: bool,
        resolver: impl Into<String>,
    ) -> Result<ApprovalRequest, HomeostatError> {
        let inner = &self.inner;
        let resolved = inner
            .approvals
            .resolve_with(request_id, approved, resolver, |request| {
                let run_id = inner
                    .escalations
                    .get(&request.id)
                    .map(|r| *r.value())
                    .ok_or(ApprovalError::NotFound(request.id))?;
                let draft = resolution_draft(run_id, request).map_err(LedgerError::from)?;
                inner.stores.audit.append(draft)?;
                Ok::<_, HomeostatError>(())
            })?;
        inner.escalations.remove(&request_id);
        Ok(resolved)
    }

    /// Approval requests awaiting an operator
    #[must_use]
    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.inner.approvals.pending()
    }

    /// Audit entries after `seq`
    #[must_use]
    pub fn stream_since(&self, seq: u64) -> Vec<AuditEntry> {
        self.inner.stores.audit.stream_since(seq)
    }

    /// Wait until a run reaches DONE
    pub async fn wait_for(&self, run_id: RunId) -> Result<RunOutcome, HomeostatError> {
        let slot = self
            .inner
            .runs
            .get(&run_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(HomeostatError::RunNotFound(run_id))?;
        let mut done = slot.done.subscribe();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| HomeostatError::RunNotFound(run_id))?
            .clone();
        outcome.ok_or(HomeostatError::RunNotFound(run_id))
    }

    /// Shared stores
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    fn spawn(&self, ctx: RunContext, state: PipelineState) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(ctx, state).await });
    }
}

impl Inner {
    fn register(&self, ctx: &RunContext, stage: RunStage) {
        let status = RunStatus {
            run_id: ctx.run_id,
            anomaly_id: ctx.anomaly.id,
            service: ctx.anomaly.service.clone(),
            stage,
            outcome: None,
            updated_at: self.clock.now(),
        };
        let (done, _) = watch::channel(None);
        self.runs.insert(
            ctx.run_id,
            Arc::new(RunSlot {
                status: Mutex::new(status),
                done,
            }),
        );
    }

    async fn drive(&self, ctx: RunContext, mut state: PipelineState) {
        loop {
            let next = match self.step(&ctx, state).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(run_id = %ctx.run_id, error = %e, "run aborted");
                    PipelineState::Done {
                        outcome: RunOutcome {
                            result: RunResult::Aborted,
                            reason: e.to_string(),
                            decision: None,
                            approval: None,
                            validation: None,
                        },
                    }
                }
            };

            if let Err(e) = self.record(&ctx, &next).await {
                tracing::error!(
                    run_id = %ctx.run_id,
                    error = %e,
                    "transition could not be audited, run suspended until recovery"
                );
                return;
            }

            match next {
                PipelineState::Done { outcome } => {
                    self.finish(&ctx, outcome).await;
                    return;
                }
                other => state = other,
            }
        }
    }

    async fn step(
        &self,
        ctx: &RunContext,
        state: PipelineState,
    ) -> Result<PipelineState, HomeostatError> {
        // Waiting on a human does not occupy a work slot.
        let _permit = match &state {
            PipelineState::AwaitingApproval { .. } => None,
            _ => Some(
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| HomeostatError::TransientInfra("orchestrator shut down".into()))?,
            ),
        };

        let next = match state {
            PipelineState::Received { .. } => PipelineState::Deciding,
            PipelineState::Deciding => self.decide(ctx).await?,
            PipelineState::AwaitingApproval { decision, request } => {
                self.await_approval(decision, request).await?
            }
            PipelineState::Validating {
                decision,
                patch,
                approval,
            } => {
                let validation = self.validator.validate(&patch, &ctx.anomaly).await;
                if validation.passed {
                    PipelineState::Applying {
                        decision,
                        patch,
                        validation,
                    }
                } else {
                    done(
                        RunOutcome::decided(RunResult::ValidationFailed, decision)
                            .because(validation.details.clone())
                            .with_approval(approval)
                            .with_validation(validation),
                    )
                }
            }
            PipelineState::Applying {
                decision,
                patch,
                validation,
            } => self.apply(ctx, decision, patch, validation).await?,
            PipelineState::Done { outcome } => PipelineState::Done { outcome },
        };
        Ok(next)
    }

    async fn decide(&self, ctx: &RunContext) -> Result<PipelineState, HomeostatError> {
        let engine = &self.engine;
        let anomaly = &ctx.anomaly;
        let decision =
            with_retry(&self.config.retry, "decide", move || engine.evaluate(anomaly)).await?;

        Ok(match decision.verdict {
            Verdict::Wait => done(RunOutcome::decided(RunResult::Waited, decision)),
            Verdict::Reject => done(RunOutcome::decided(RunResult::Rejected, decision)),
            Verdict::Escalate => {
                let request = self.approvals.request_approval(&decision);
                self.escalations.insert(request.id, ctx.run_id);
                PipelineState::AwaitingApproval { decision, request }
            }
            Verdict::Intervene => match decision.patch.clone() {
                Some(patch) => PipelineState::Validating {
                    decision,
                    patch,
                    approval: None,
                },
                None => done(RunOutcome::decided(RunResult::NoPatch, decision)),
            },
        })
    }

    async fn await_approval(
        &self,
        decision: Decision,
        request: ApprovalRequest,
    ) -> Result<PipelineState, HomeostatError> {
        let resolved = self.approvals.wait(request.id).await?;
        self.escalations.remove(&request.id);
        let resolver = resolved.resolver.clone().unwrap_or_default();

        Ok(match resolved.status {
            ApprovalStatus::Approved => match decision.patch.clone() {
                Some(patch) => PipelineState::Validating {
                    decision,
                    patch,
                    approval: Some(resolved),
                },
                None => done(
                    RunOutcome::decided(RunResult::NoPatch, decision)
                        .because(format!("approved by {resolver}, but no patch is available"))
                        .with_approval(Some(resolved)),
                ),
            },
            ApprovalStatus::Rejected => done(
                RunOutcome::decided(RunResult::ApprovalDenied, decision)
                    .because(format!("escalation rejected by {resolver}"))
                    .with_approval(Some(resolved)),
            ),
            ApprovalStatus::TimedOut | ApprovalStatus::Pending => done(
                RunOutcome::decided(RunResult::ApprovalTimedOut, decision)
                    .because("approval timed out")
                    .with_approval(Some(resolved)),
            ),
        })
    }

    async fn apply(
        &self,
        ctx: &RunContext,
        decision: Decision,
        patch: Patch,
        validation: ValidationVerdict,
    ) -> Result<PipelineState, HomeostatError> {
        let service = ctx.anomaly.service.as_str();

        let applied = match self.applier.is_applied(service, &patch).await {
            Ok(true) => {
                tracing::info!(run_id = %ctx.run_id, patch_id = %patch.id, "patch already live, not re-applying");
                return Ok(done(
                    RunOutcome::decided(RunResult::Applied, decision)
                        .because(format!("patch {} already applied", patch.id))
                        .with_validation(validation),
                ));
            }
            Ok(false) => self.applier.apply(service, &patch).await,
            Err(e) => Err(e),
        };

        Ok(match applied {
            Ok(()) => done(
                RunOutcome::decided(RunResult::Applied, decision)
                    .because(format!("patch {} applied", patch.id))
                    .with_validation(validation),
            ),
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "patch application failed, rolling back");
                if let Err(rollback) = self.applier.rollback(service, &patch).await {
                    tracing::error!(run_id = %ctx.run_id, error = %rollback, "rollback failed");
                }
                done(
                    RunOutcome::decided(RunResult::ApplicationFailed, decision)
                        .because(e.to_string())
                        .with_validation(validation),
                )
            }
        })
    }

    /// Append the transition, then publish it
    async fn record(&self, ctx: &RunContext, state: &PipelineState) -> Result<u64, HomeostatError> {
        let event = RunEvent {
            run_id: ctx.run_id,
            anomaly_id: ctx.anomaly.id,
            service: ctx.anomaly.service.clone(),
            state: state.clone(),
        };
        let draft = event.to_draft().map_err(LedgerError::from)?;
        let audit = &self.stores.audit;
        let seq = with_retry(&self.config.retry, "audit append", move || {
            let draft = draft.clone();
            async move { audit.append(draft) }
        })
        .await?;

        let now = self.clock.now();
        let stage = state.stage();
        if let Some(slot) = self.runs.get(&ctx.run_id) {
            let mut status = slot.status.lock();
            status.stage = stage;
            status.updated_at = now;
        }

        let verdict = state.verdict().map(|v| v.to_string()).unwrap_or_default();
        tracing::info!(
            target: "homeostat::transition",
            service = %ctx.anomaly.service,
            anomaly_id = %ctx.anomaly.id,
            run_id = %ctx.run_id,
            stage = stage.as_str(),
            verdict = %verdict,
            seq,
            timestamp = %now,
            "pipeline transition"
        );
        metrics::counter!("homeostat_transitions_total", "stage" => stage.as_str()).increment(1);
        Ok(seq)
    }

    /// Report the outcome to the precedent store and the breaker, mark it
    /// reported, then release waiters
    async fn finish(&self, ctx: &RunContext, outcome: RunOutcome) {
        let retry = &self.config.retry;
        let service = ctx.anomaly.service.as_str();
        let breaker = &self.stores.breaker;
        let mut complete = true;

        if let Some(decision) = &outcome.decision {
            let precedent = Precedent {
                // One per run, so a repeated report dedupes.
                id: PrecedentId(ctx.run_id.0),
                anomaly_id: ctx.anomaly.id,
                service: ctx.anomaly.service.clone(),
                severity: ctx.anomaly.severity,
                anomaly_fingerprint: self.engine.fingerprint(&ctx.anomaly),
                decision_taken: decision.verdict,
                outcome: outcome.result.precedent_outcome(),
                remediation: decision.patch.clone(),
                created_at: self.clock.now(),
            };
            let store = &self.stores.precedents;
            let appended = with_retry(retry, "precedent append", move || {
                let precedent = precedent.clone();
                async move { store.append(precedent) }
            })
            .await;
            if let Err(e) = appended {
                tracing::error!(run_id = %ctx.run_id, error = %e, "precedent could not be recorded");
                complete = false;
            }
        }

        let reported = match outcome.result.breaker_outcome() {
            Some(success) => {
                with_retry(retry, "breaker outcome", move || async move {
                    breaker.record_outcome(service, success)
                })
                .await
            }
            None => {
                let holder = ctx.anomaly.id;
                with_retry(retry, "breaker release", move || async move {
                    breaker.release_trial(service, holder)
                })
                .await
            }
        };
        if let Err(e) = reported {
            tracing::error!(run_id = %ctx.run_id, error = %e, "circuit breaker update failed");
            complete = false;
        }

        if complete {
            if let Err(e) = self.mark_reported(ctx, outcome.result).await {
                tracing::error!(run_id = %ctx.run_id, error = %e, "outcome report could not be audited");
            }
        }

        tracing::info!(
            run_id = %ctx.run_id,
            result = %outcome.result,
            reason = %outcome.reason,
            "run finished"
        );
        self.settle(ctx, outcome);
    }

    async fn mark_reported(
        &self,
        ctx: &RunContext,
        result: RunResult,
    ) -> Result<u64, HomeostatError> {
        let report = OutcomeReport {
            run_id: ctx.run_id,
            result,
        };
        let draft = report.to_draft(ctx.anomaly.id).map_err(LedgerError::from)?;
        let audit = &self.stores.audit;
        Ok(with_retry(&self.config.retry, "outcome report", move || {
            let draft = draft.clone();
            async move { audit.append(draft) }
        })
        .await?)
    }

    fn settle(&self, ctx: &RunContext, outcome: RunOutcome) {
        if let Some(slot) = self.runs.get(&ctx.run_id) {
            {
                let mut status = slot.status.lock();
                status.stage = RunStage::Done;
                status.outcome = Some(outcome.clone());
            }
            slot.done.send_replace(Some(outcome));
        }
    }
}

fn done(outcome: RunOutcome) -> PipelineState {
    PipelineState::Done { outcome }
}
