//! Testing utilities for the Homeostat workspace
//!
//! Shared fixtures, fakes for the external collaborators, and a harness
//! that wires an orchestrator over in-memory stores.

pub mod fakes;
pub mod fixtures;
pub mod harness;

pub use fakes::{FakeProvisioner, FakeReplica, RecordingApplier, StaticPatchSource};
pub use fixtures::*;
pub use harness::{Harness, HarnessBuilder};
