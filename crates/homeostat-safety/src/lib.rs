//! Homeostat Safety
//!
//! The guards between a decision and an action:
//! - [`RiskAssessor`]: pure risk scoring from severity, blast radius, and
//!   patch class
//! - [`CircuitBreaker`]: per-service gate that stops automation after
//!   repeated failures
//! - [`ApprovalGate`]: human sign-off for escalated decisions, default-deny
//!   on timeout

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod approval;
pub mod breaker;
pub mod error;
pub mod risk;

pub use approval::ApprovalGate;
pub use breaker::CircuitBreaker;
pub use error::{ApprovalError, BreakerError};
pub use risk::RiskAssessor;
