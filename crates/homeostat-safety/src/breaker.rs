//! Per-service circuit breaker
//!
//! ```text
//!            failures >= threshold within window
//!   CLOSED ─────────────────────────────────────▶ OPEN
//!     ▲                                            │ cooldown elapsed
//!     │ trial succeeded                            ▼
//!     └──────────────────────────────────────── HALF_OPEN ──▶ OPEN (cooldown x2, capped)
//!                                                      trial failed
//! ```
//!
//! Each service has its own mutex, sharded through a `DashMap`, so unrelated
//! services never contend. When backed by a directory every mutation is
//! written to that service's file before the lock is released.

use crate::error::BreakerError;
use chrono::Duration;
use dashmap::DashMap;
use homeostat_core::{AnomalyId, BreakerConfig, BreakerState, CircuitState, Clock};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Gate on automated intervention, one circuit per service
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: DashMap<String, Arc<Mutex<CircuitState>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    dir: Option<PathBuf>,
}

impl CircuitBreaker {
    /// Volatile breaker
    #[must_use]
    pub fn in_memory(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
            clock,
            dir: None,
        }
    }

    /// Breaker persisted under `dir`, reloading every saved circuit
    pub fn open(
        dir: impl AsRef<Path>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BreakerError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let circuits = DashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            let state: CircuitState =
                serde_json::from_str(&text).map_err(|e| BreakerError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            circuits.insert(state.service.clone(), Arc::new(Mutex::new(state)));
        }

        tracing::info!(
            dir = %dir.display(),
            circuits = circuits.len(),
            "circuit table loaded"
        );

        Ok(Self {
            circuits,
            config,
            clock,
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Whether automation may act on `service` now.
    ///
    /// In OPEN with the cooldown elapsed this moves the circuit to
    /// HALF_OPEN and hands out its single trial; the trial ends with the
    /// next [`record_outcome`](Self::record_outcome).
    pub fn allow(&self, service: &str) -> Result<bool, BreakerError> {
        self.admit(service, None)
    }

    /// Like [`allow`](Self::allow), but a granted trial is owned by
    /// `holder`: asking again with the same holder is granted again, and
    /// [`release_trial`](Self::release_trial) can return it.
    pub fn allow_for(&self, service: &str, holder: AnomalyId) -> Result<bool, BreakerError> {
        self.admit(service, Some(holder))
    }

    fn admit(&self, service: &str, holder: Option<AnomalyId>) -> Result<bool, BreakerError> {
        let circuit = self.circuit(service);
        let mut state = circuit.lock();

        match state.state {
            BreakerState::Closed => return Ok(true),
            BreakerState::Open if self.cooldown_elapsed(&state) => {
                state.state = BreakerState::HalfOpen;
                tracing::info!(service, "circuit half-open, trial granted");
            }
            BreakerState::HalfOpen if !state.trial_in_flight => {
                tracing::debug!(service, "circuit trial granted");
            }
            BreakerState::HalfOpen if holder.is_some() && state.trial_holder == holder => {
                return Ok(true);
            }
            BreakerState::Open | BreakerState::HalfOpen => return Ok(false),
        }

        state.trial_in_flight = true;
        state.trial_holder = holder;
        self.persist(&state)?;
        Ok(true)
    }

    /// Effective state without consuming a trial.
    ///
    /// An OPEN circuit whose cooldown has elapsed reports HALF_OPEN.
    #[must_use]
    pub fn peek(&self, service: &str) -> BreakerState {
        let Some(circuit) = self.circuits.get(service).map(|c| Arc::clone(c.value())) else {
            return BreakerState::Closed;
        };
        let state = circuit.lock();
        match state.state {
            BreakerState::Open if self.cooldown_elapsed(&state) => BreakerState::HalfOpen,
            other => other,
        }
    }

    /// Report the outcome of an intervention on `service`
    pub fn record_outcome(&self, service: &str, success: bool) -> Result<(), BreakerError> {
        let circuit = self.circuit(service);
        let mut state = circuit.lock();
        let now = self.clock.now();
        let before = state.state;

        match (state.state, success) {
            (BreakerState::Closed, true) => {
                if state.failure_count == 0 {
                    return Ok(());
                }
                state.failure_count = 0;
                state.window_start = None;
            }
            (BreakerState::Closed, false) => {
                let window = Duration::seconds(secs(self.config.window_secs));
                let in_window = state.window_start.is_some_and(|start| now - start <= window);
                if in_window {
                    state.failure_count += 1;
                } else {
                    state.window_start = Some(now);
                    state.failure_count = 1;
                }
                if state.failure_count >= self.config.failure_threshold {
                    state.state = BreakerState::Open;
                    state.opened_at = Some(now);
                    state.cooldown_secs = self.config.cooldown_secs;
                    state.reopen_count = 0;
                }
            }
            (BreakerState::HalfOpen, true) => {
                *state = CircuitState::closed(service);
            }
            (BreakerState::HalfOpen, false) => {
                state.state = BreakerState::Open;
                state.opened_at = Some(now);
                state.cooldown_secs = state
                    .cooldown_secs
                    .max(1)
                    .saturating_mul(2)
                    .min(self.config.max_cooldown_secs);
                state.reopen_count += 1;
                state.trial_in_flight = false;
                state.trial_holder = None;
            }
            (BreakerState::Open, _) => {
                // Late outcome from a run that started before the circuit opened.
                tracing::debug!(service, success, "outcome ignored while circuit open");
                return Ok(());
            }
        }

        if state.state != before {
            tracing::info!(
                service,
                from = %before,
                to = %state.state,
                failure_count = state.failure_count,
                cooldown_secs = state.cooldown_secs,
                "circuit transition"
            );
        }
        self.persist(&state)
    }

    /// Return an unused HALF_OPEN trial held by `holder`
    pub fn release_trial(&self, service: &str, holder: AnomalyId) -> Result<(), BreakerError> {
        let Some(circuit) = self.circuits.get(service).map(|c| Arc::clone(c.value())) else {
            return Ok(());
        };
        let mut state = circuit.lock();
        if state.state == BreakerState::HalfOpen
            && state.trial_in_flight
            && state.trial_holder == Some(holder)
        {
            state.trial_in_flight = false;
            state.trial_holder = None;
            tracing::debug!(service, "circuit trial released");
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Snapshot of one circuit
    #[must_use]
    pub fn state(&self, service: &str) -> CircuitState {
        self.circuits
            .get(service)
            .map_or_else(|| CircuitState::closed(service), |c| c.lock().clone())
    }

    /// Snapshot of every known circuit, sorted by service
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitState> {
        let mut all: Vec<CircuitState> =
            self.circuits.iter().map(|c| c.value().lock().clone()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    fn circuit(&self, service: &str) -> Arc<Mutex<CircuitState>> {
        // Clone the Arc so the shard guard is dropped before locking.
        self.circuits
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::closed(service))))
            .value()
            .clone()
    }

    fn cooldown_elapsed(&self, state: &CircuitState) -> bool {
        state.opened_at.map_or(true, |opened| {
            self.clock.now() >= opened + Duration::seconds(secs(state.cooldown_secs))
        })
    }

    fn persist(&self, state: &CircuitState) -> Result<(), BreakerError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", hex::encode(state.service.as_bytes())));
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(state)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX / 1_000_000)
}
