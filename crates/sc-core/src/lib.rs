//! # sc-core
//!
//! Core types and invariants for seat-booking coordination.
//!
//! The coordination crates (`sc-coord`), the simulation kernel (`sc-dst`)
//! and the model checker (`sc-stateright`) all speak in terms of the types
//! defined here. Invariant checkers report [`PropertyResult`]s that carry a
//! [`Counterexample`] when a property is violated, so a failing DST run can
//! be replayed from its seed.

pub mod counterexample;
pub mod invariants;
pub mod property;
pub mod types;

pub use counterexample::{Counterexample, StateSnapshot};
pub use property::{PropertyChecker, PropertyResult, PropertySummary};
pub use types::{
    EventKind, HolderId, LamportEvent, MutexRequest, NodeId, SeatId, SeatState,
    TransitionError,
};
