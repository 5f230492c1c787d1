//! Homeostat Engine
//!
//! Decides what to do about an anomaly and carries the decision through
//! validation, approval, and application, recording every step.
//!
//! # Architecture
//!
//! ```text
//! Anomaly ─▶ Orchestrator ─▶ DecisionEngine ─┬─▶ PrecedentStore
//!                 │                          ├─▶ RiskAssessor
//!                 │                          └─▶ CircuitBreaker
//!                 ├─▶ ApprovalGate        (ESCALATE)
//!                 ├─▶ TwinValidator       (before any production change)
//!                 ├─▶ PatchApplier        (validated patches only)
//!                 └─▶ AuditLog            (every transition, before proceeding)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use homeostat_engine::{Collaborators, Orchestrator, Stores};
//!
//! let stores = Stores::open(&config, clock.clone())?;
//! let orchestrator = Orchestrator::new(config, stores, collaborators, clock)?;
//! orchestrator.recover();
//! let run_id = orchestrator.submit_anomaly(anomaly).await?;
//! let outcome = orchestrator.wait_for(run_id).await?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod decision;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;

pub use decision::{DecisionEngine, PatchSource, CIRCUIT_OPEN};
pub use error::{HomeostatError, PatchApplicationError, PatchSourceError};
pub use orchestrator::{Collaborators, Orchestrator, PatchApplier, Stores};
pub use pipeline::{
    resolution_draft, OutcomeReport, PipelineState, RunEvent, RunOutcome, RunResult, RunStage,
    RunStatus,
};
pub use retry::with_retry;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
