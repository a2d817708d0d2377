//! Shared domain types.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a simulated server node (`primary`, `replica-1`, ...).
pub type NodeId = String;

/// Identifier of a seat resource.
pub type SeatId = String;

/// Opaque session token of a browsing context.
pub type HolderId = String;

/// State of a seat on one node.
///
/// Legal transitions:
///
/// | From | To | Meaning |
/// |------|----|---------|
/// | Available | Locked | mutex granted, booking in progress |
/// | Locked | Booked | booking committed |
/// | Locked | Available | booking abandoned |
/// | Available | Booked | direct simulated write |
///
/// `Booked -> Available` only happens through an administrative overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatState {
    Available,
    Locked,
    Booked,
}

impl SeatState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: SeatState) -> bool {
        matches!(
            (self, next),
            (SeatState::Available, SeatState::Locked)
                | (SeatState::Available, SeatState::Booked)
                | (SeatState::Locked, SeatState::Booked)
                | (SeatState::Locked, SeatState::Available)
        )
    }

    /// Validate a transition.
    pub fn transition(self, next: SeatState) -> Result<SeatState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SeatState::Available => "available",
            SeatState::Locked => "locked",
            SeatState::Booked => "booked",
        }
    }
}

impl fmt::Display for SeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected seat state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal seat transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SeatState,
    pub to: SeatState,
}

/// Kind of a Lamport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Local,
    Send,
    Receive,
}

/// One entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportEvent {
    pub timestamp: u64,
    pub node_id: NodeId,
    pub kind: EventKind,
    pub seat_id: SeatId,
    pub description: String,
}

impl LamportEvent {
    /// Total order key: timestamp, then node id.
    #[must_use]
    pub fn order_key(&self) -> (u64, &str) {
        (self.timestamp, self.node_id.as_str())
    }
}

/// A queued request for a seat's critical section.
///
/// Ordered by `(timestamp, node_id)`, then seat id, which is the total
/// order the mutex queue uses to pick its head.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutexRequest {
    pub seat_id: SeatId,
    pub node_id: NodeId,
    pub timestamp: u64,
}

impl Ord for MutexRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.node_id.cmp(&other.node_id))
            .then_with(|| self.seat_id.cmp(&other.seat_id))
    }
}

impl PartialOrd for MutexRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
