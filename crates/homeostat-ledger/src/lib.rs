//! Homeostat Ledger
//!
//! The two shared, append-only stores of the self-healing core:
//!
//! - [`AuditLog`]: globally ordered, hash-chained, durable-before-acknowledge
//!   record of every decision, verdict, approval, and action. It is also the
//!   recovery source for in-flight pipeline runs.
//! - [`PrecedentStore`]: prior anomaly → decision → outcome records, searched
//!   by fingerprint similarity through a [`SimilarityIndex`].
//!
//! # Architecture
//!
//! ```text
//! Anomaly ─▶ Embedder ─▶ fingerprint ─▶ SimilarityIndex ─▶ PrecedentMatch
//!                                             ▲
//!                        precedents.log ──────┘ (rebuilt at open)
//!
//! AuditDraft ─▶ AuditLog::append ─▶ fsync ─▶ seq
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod audit;
pub mod embed;
pub mod error;
pub mod index;
pub mod precedent;

mod durable;

pub use audit::AuditLog;
pub use embed::{Embedder, FeatureHashEmbedder};
pub use error::LedgerError;
pub use index::{similarity, BruteForceIndex, SimilarityIndex};
pub use precedent::{PrecedentLog, PrecedentMatch, PrecedentStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
