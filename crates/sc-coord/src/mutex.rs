//! Per-seat mutual exclusion over a shared request queue.
//!
//! Requests are ordered by `(lamport_timestamp, node_id)`; the head of a
//! seat's queue holds the grant. A node keeps at most one entry per seat, so
//! asking again is a poll of its head status. Releasing removes the entry
//! and the next head is granted implicitly.

use std::collections::{BTreeMap, BTreeSet};

use sc_core::invariants::{MutexHistory, MutexProperties};
use sc_core::{MutexRequest, NodeId, SeatId, SeatState};
use tracing::debug;

/// Result of [`MutexCoordinator::try_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// At the head of the queue
    Granted,
    /// Queued behind an earlier request
    Queued,
    /// Already queued; the original timestamp is kept
    AlreadyQueued { granted: bool },
    /// The seat is booked and never enters the queue
    SeatBooked,
}

impl RequestOutcome {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted | Self::AlreadyQueued { granted: true })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MutexCoordinator {
    queues: BTreeMap<SeatId, BTreeSet<MutexRequest>>,
    history: MutexHistory,
}

impl MutexCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request and report whether it is the head.
    pub fn request(&mut self, seat_id: &str, node_id: &str, timestamp: u64) -> bool {
        self.try_request(seat_id, node_id, timestamp, SeatState::Available)
            .is_granted()
    }

    /// Queue a request unless `current_state` is Booked.
    pub fn try_request(
        &mut self,
        seat_id: &str,
        node_id: &str,
        timestamp: u64,
        current_state: SeatState,
    ) -> RequestOutcome {
        if current_state == SeatState::Booked {
            debug!(seat = seat_id, node = node_id, "seat booked, request rejected");
            return RequestOutcome::SeatBooked;
        }
        if self.is_queued(seat_id, node_id) {
            return RequestOutcome::AlreadyQueued {
                granted: self.is_granted(seat_id, node_id),
            };
        }

        self.queues
            .entry(seat_id.to_string())
            .or_default()
            .insert(MutexRequest {
                seat_id: seat_id.to_string(),
                node_id: node_id.to_string(),
                timestamp,
            });

        let granted = self.is_granted(seat_id, node_id);
        debug!(seat = seat_id, node = node_id, timestamp, granted, "mutex request queued");
        if granted {
            RequestOutcome::Granted
        } else {
            RequestOutcome::Queued
        }
    }

    #[must_use]
    pub fn holder(&self, seat_id: &str) -> Option<&MutexRequest> {
        self.queues.get(seat_id).and_then(|q| q.first())
    }

    #[must_use]
    pub fn is_granted(&self, seat_id: &str, node_id: &str) -> bool {
        self.holder(seat_id).is_some_and(|r| r.node_id == node_id)
    }

    #[must_use]
    pub fn is_queued(&self, seat_id: &str, node_id: &str) -> bool {
        self.queues
            .get(seat_id)
            .is_some_and(|q| q.iter().any(|r| r.node_id == node_id))
    }

    /// Whether `node_id` is queued for any seat.
    #[must_use]
    pub fn has_requests(&self, node_id: &str) -> bool {
        self.queues
            .values()
            .any(|q| q.iter().any(|r| r.node_id == node_id))
    }

    /// Remove `node_id`'s entry. Returns whether one was queued.
    pub fn release(&mut self, seat_id: &str, node_id: &str) -> bool {
        let Some(queue) = self.queues.get_mut(seat_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|r| r.node_id != node_id);
        let removed = queue.len() != before;
        let next = queue.first().map(|r| r.node_id.clone());
        if queue.is_empty() {
            self.queues.remove(seat_id);
        }
        if removed {
            debug!(seat = seat_id, node = node_id, next = ?next, "mutex released");
        }
        removed
    }

    /// Requests across all seats.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queues.values().map(BTreeSet::len).sum()
    }

    /// Queue of `seat_id`, head first.
    #[must_use]
    pub fn queue(&self, seat_id: &str) -> Vec<MutexRequest> {
        self.queues
            .get(seat_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_enter(&mut self, seat_id: &str, node_id: &str) {
        self.history.record_enter(seat_id, node_id);
    }

    pub fn record_exit(&mut self, seat_id: &str, node_id: &str) {
        self.history.record_exit(seat_id, node_id);
    }
}

impl MutexProperties for MutexCoordinator {
    fn queues(&self) -> Vec<(SeatId, Vec<MutexRequest>)> {
        self.queues
            .iter()
            .map(|(seat, q)| (seat.clone(), q.iter().cloned().collect()))
            .collect()
    }

    fn history(&self) -> &MutexHistory {
        &self.history
    }
}

/// Node ids in queue order, for diagnostics.
#[must_use]
pub fn queue_order(queue: &[MutexRequest]) -> Vec<NodeId> {
    queue.iter().map(|r| r.node_id.clone()).collect()
}
