//! Simulated cluster nodes.

use std::collections::BTreeMap;

use sc_core::{NodeId, SeatId, SeatState};
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

/// Replica health as seen by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Synced,
    /// A push is in flight
    Syncing,
    /// At least one push failed and awaits retry
    Failed,
}

/// A write pushed to a replica but not yet applied there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub state: SeatState,
    pub version: u64,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Physical clock reading in seconds, disciplined by Berkeley sync
    pub local_time_s: f64,
    pub seat_states: BTreeMap<SeatId, SeatState>,
    pub version: u64,
    pub last_sync_at_ms: u64,
    /// Latest unapplied write per seat (replicas only)
    pub outstanding: BTreeMap<SeatId, PendingWrite>,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<NodeId>, role: NodeRole, local_time_s: f64) -> Self {
        Self {
            id: id.into(),
            role,
            local_time_s,
            seat_states: BTreeMap::new(),
            version: 0,
            last_sync_at_ms: 0,
            outstanding: BTreeMap::new(),
        }
    }

    /// State of `seat_id`; seats never written read as Available.
    #[must_use]
    pub fn seat_state(&self, seat_id: &str) -> SeatState {
        self.seat_states
            .get(seat_id)
            .copied()
            .unwrap_or(SeatState::Available)
    }

    /// Move `seat_id` along a legal transition.
    pub fn set_seat_state(&mut self, seat_id: &str, next: SeatState) -> Result<()> {
        let next = self.seat_state(seat_id).transition(next)?;
        self.force_seat_state(seat_id, next);
        Ok(())
    }

    /// Overwrite without checking the transition.
    pub fn force_seat_state(&mut self, seat_id: &str, state: SeatState) {
        if state == SeatState::Available {
            self.seat_states.remove(seat_id);
        } else {
            self.seat_states.insert(seat_id.to_string(), state);
        }
    }

    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        if self.outstanding.values().any(|w| w.failed) {
            ReplicaStatus::Failed
        } else if !self.outstanding.is_empty() {
            ReplicaStatus::Syncing
        } else {
            ReplicaStatus::Synced
        }
    }

    /// Seats whose latest push failed.
    #[must_use]
    pub fn missed_writes(&self) -> Vec<SeatId> {
        self.outstanding
            .iter()
            .filter(|(_, w)| w.failed)
            .map(|(seat, _)| seat.clone())
            .collect()
    }
}
