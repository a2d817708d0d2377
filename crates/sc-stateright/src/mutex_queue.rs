//! Stateright model of the per-seat mutex queue.
//!
//! Nodes stamp a request with their Lamport clock, join the seat's queue and
//! enter the critical section only while their request is the queue head.
//! Inside, a node locks the seat, then either commits the booking or
//! abandons it. A waiting node that sees the seat booked withdraws. A node
//! may also give up waiting (poll timeout) and try again later with a fresh
//! timestamp.

use std::collections::BTreeSet;

use sc_core::{MutexRequest, SeatState};
use stateright::Model;

/// The seat every node competes for.
const SEAT: &str = "A1";

/// Where a node is in its booking attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeState {
    Idle,
    Waiting { request: MutexRequest },
    Inside { request: MutexRequest, locked: bool },
    Done,
}

/// State of the mutex queue model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutexState {
    pub nodes: Vec<NodeState>,
    /// Lamport clock per node
    pub clocks: Vec<u64>,
    /// Requests issued per node
    pub attempts: Vec<u8>,
    pub queue: BTreeSet<MutexRequest>,
    pub seat: SeatState,
    /// Committed bookings of the seat
    pub bookings: u8,
    /// Set once a seat transition outside the legal table was attempted
    pub illegal_transition: bool,
}

impl MutexState {
    pub fn new(nodes_count: usize) -> Self {
        debug_assert!(nodes_count > 0, "Must have at least one node");
        debug_assert!(nodes_count <= 4, "Model checking with many nodes is slow");

        Self {
            nodes: vec![NodeState::Idle; nodes_count],
            clocks: vec![0; nodes_count],
            attempts: vec![0; nodes_count],
            queue: BTreeSet::new(),
            seat: SeatState::Available,
            bookings: 0,
            illegal_transition: false,
        }
    }

    /// Nodes currently in the critical section.
    pub fn inside_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, NodeState::Inside { .. }))
            .count()
    }

    // ========== Invariants ==========

    /// At most one node is in the critical section.
    pub fn mutual_exclusion(&self) -> bool {
        self.inside_count() <= 1
    }

    /// A node inside holds the head of the queue.
    pub fn holder_is_head(&self) -> bool {
        self.nodes.iter().all(|node| match node {
            NodeState::Inside { request, .. } => self.queue.first() == Some(request),
            _ => true,
        })
    }

    /// The seat is booked at most once.
    pub fn single_booking(&self) -> bool {
        self.bookings <= 1
    }

    pub fn invariants_hold(&self) -> bool {
        self.mutual_exclusion()
            && self.holder_is_head()
            && self.single_booking()
            && !self.illegal_transition
    }

    fn move_seat(&mut self, next: SeatState) {
        match self.seat.transition(next) {
            Ok(state) => self.seat = state,
            Err(_) => self.illegal_transition = true,
        }
    }
}

/// Actions a node can take.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutexAction {
    /// Tick the clock and join the queue
    Request { node: usize },
    /// Enter the critical section as queue head
    Enter { node: usize },
    /// Stop waiting and leave the queue
    GiveUp { node: usize },
    /// Withdraw after observing the seat booked
    SeeBooked { node: usize },
    /// Move the seat to locked
    Lock { node: usize },
    /// Find the seat already booked on entry and leave
    FindBooked { node: usize },
    /// Book the locked seat and leave
    Commit { node: usize },
    /// Revert the lock and leave
    Abandon { node: usize },
}

/// Model for bounded model checking.
pub struct MutexModel {
    pub nodes_count: usize,
    pub attempts_max: u8,
}

impl MutexModel {
    pub fn new(nodes_count: usize) -> Self {
        debug_assert!(nodes_count > 0);

        Self {
            nodes_count,
            attempts_max: 2,
        }
    }

    #[must_use]
    pub fn with_attempts_max(mut self, attempts_max: u8) -> Self {
        debug_assert!(attempts_max > 0);
        self.attempts_max = attempts_max;
        self
    }
}

fn node_name(node: usize) -> String {
    format!("node-{}", node)
}

impl Model for MutexModel {
    type State = MutexState;
    type Action = MutexAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![MutexState::new(self.nodes_count)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (node, node_state) in state.nodes.iter().enumerate() {
            match node_state {
                NodeState::Idle => {
                    if state.attempts[node] < self.attempts_max {
                        actions.push(MutexAction::Request { node });
                    }
                }
                NodeState::Waiting { request } => {
                    if state.queue.first() == Some(request) {
                        actions.push(MutexAction::Enter { node });
                    }
                    if state.seat == SeatState::Booked {
                        actions.push(MutexAction::SeeBooked { node });
                    }
                    actions.push(MutexAction::GiveUp { node });
                }
                NodeState::Inside { locked: false, .. } => {
                    if state.seat == SeatState::Booked {
                        actions.push(MutexAction::FindBooked { node });
                    } else {
                        actions.push(MutexAction::Lock { node });
                    }
                }
                NodeState::Inside { locked: true, .. } => {
                    actions.push(MutexAction::Commit { node });
                    actions.push(MutexAction::Abandon { node });
                }
                NodeState::Done => {}
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            MutexAction::Request { node } => {
                next.clocks[node] += 1;
                next.attempts[node] += 1;
                let request = MutexRequest {
                    seat_id: SEAT.to_string(),
                    node_id: node_name(node),
                    timestamp: next.clocks[node],
                };
                next.queue.insert(request.clone());
                next.nodes[node] = NodeState::Waiting { request };
            }

            MutexAction::Enter { node } => {
                if let NodeState::Waiting { request } = next.nodes[node].clone() {
                    next.nodes[node] = NodeState::Inside {
                        request,
                        locked: false,
                    };
                }
            }

            MutexAction::GiveUp { node } => {
                if let NodeState::Waiting { request } = next.nodes[node].clone() {
                    next.queue.remove(&request);
                    next.nodes[node] = NodeState::Idle;
                }
            }

            MutexAction::SeeBooked { node } | MutexAction::FindBooked { node } => {
                match next.nodes[node].clone() {
                    NodeState::Waiting { request } | NodeState::Inside { request, .. } => {
                        next.queue.remove(&request);
                        next.nodes[node] = NodeState::Done;
                    }
                    _ => {}
                }
            }

            MutexAction::Lock { node } => {
                if let NodeState::Inside { request, .. } = next.nodes[node].clone() {
                    next.move_seat(SeatState::Locked);
                    next.nodes[node] = NodeState::Inside {
                        request,
                        locked: true,
                    };
                }
            }

            MutexAction::Commit { node } => {
                if let NodeState::Inside { request, .. } = next.nodes[node].clone() {
                    next.move_seat(SeatState::Booked);
                    next.bookings += 1;
                    next.queue.remove(&request);
                    next.nodes[node] = NodeState::Done;
                }
            }

            MutexAction::Abandon { node } => {
                if let NodeState::Inside { request, .. } = next.nodes[node].clone() {
                    next.move_seat(SeatState::Available);
                    next.queue.remove(&request);
                    next.nodes[node] = NodeState::Idle;
                }
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<stateright::Property<Self>> {
        vec![
            stateright::Property::always("MutualExclusion", |_model: &Self, state: &Self::State| {
                state.mutual_exclusion()
            }),
            stateright::Property::always("HolderIsHead", |_model: &Self, state: &Self::State| {
                state.holder_is_head()
            }),
            stateright::Property::always("SingleBooking", |_model: &Self, state: &Self::State| {
                state.single_booking()
            }),
            stateright::Property::always("LegalTransitions", |_model: &Self, state: &Self::State| {
                !state.illegal_transition
            }),
            stateright::Property::sometimes("SeatBooked", |_model: &Self, state: &Self::State| {
                state.seat == SeatState::Booked
            }),
        ]
    }
}
