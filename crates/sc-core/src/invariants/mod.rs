//! Invariant checkers for the coordination primitives.
//!
//! Each module defines the properties an implementation must satisfy and
//! names the stateright model (in `sc-stateright`) that explores the same
//! property exhaustively.

pub mod lease;
pub mod mutex;
pub mod replication;

pub use lease::{LeaseGrant, LeaseHistory, LeasePropertyChecker};
pub use mutex::{
    CriticalSectionEvent, CriticalSectionKind, MutexHistory, MutexProperties,
    MutexPropertyChecker,
};
pub use replication::{ReplicaView, ReplicationProperties, ReplicationPropertyChecker};
