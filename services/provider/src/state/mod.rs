//! Last observed remote state.
//!
//! This module keeps, per VM identifier:
//! - the spec the control plane last acknowledged, and its hash
//! - the observational fields the control plane reported (IP, PID, phase)
//!
//! Entries live for the provider session. The caller persists them through
//! [`SnapshotStore::export`] and seeds the next session with
//! [`SnapshotStore::restore`].

mod store;

pub use store::{SnapshotGuard, SnapshotStore, VmPhase, VmState};
