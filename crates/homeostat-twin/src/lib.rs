//! Homeostat Twin
//!
//! Validates a candidate patch by replaying recorded workload against an
//! isolated replica before and after applying it.
//!
//! - [`TwinValidator`]: the fail-closed validation sequence
//! - [`TwinProvisioner`] / [`Replica`]: the seam to whatever hosts replicas
//! - [`ReplicaLease`]: guarantees teardown, even on timeout
//! - [`CommandProvisioner`]: directory-backed replicas driven by a command

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod command;
pub mod error;
pub mod replica;
pub mod validator;

pub use command::{CommandProvisioner, CommandReplica};
pub use error::TwinError;
pub use replica::{Replica, ReplicaLease, TwinProvisioner};
pub use validator::TwinValidator;
