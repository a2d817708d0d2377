//! The simulated cluster: one primary, N replicas and the coordinators that
//! act on them.
//!
//! All node state sits behind one lock. The lock is never held across a
//! suspension point; every await (clock sync, mutex poll, replica push) runs
//! with the lock released, so between awaits a mutation is atomic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sc_core::invariants::{ReplicaView, ReplicationProperties};
use sc_core::{EventKind, LamportEvent, NodeId, SeatId, SeatState};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::berkeley;
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::lamport::{EventLog, LamportClocks};
use crate::mutex::{MutexCoordinator, RequestOutcome};
use crate::node::{Node, NodeRole, ReplicaStatus};
use crate::replication::{ReplicationCoordinator, ReplicationReport};
use crate::runtime::Runtime;

/// Everything guarded by the cluster lock.
#[derive(Debug)]
pub struct ClusterState {
    /// Primary first, then replicas
    pub nodes: Vec<Node>,
    pub clocks: LamportClocks,
    pub events: EventLog,
    pub mutex: MutexCoordinator,
}

impl ClusterState {
    fn new(config: &CoordinatorConfig, now_s: f64) -> Self {
        let nodes = config
            .node_ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let role = if i == 0 {
                    NodeRole::Primary
                } else {
                    NodeRole::Replica
                };
                Node::new(id, role, now_s)
            })
            .collect();
        Self {
            nodes,
            clocks: LamportClocks::new(),
            events: EventLog::new(),
            mutex: MutexCoordinator::new(),
        }
    }

    #[must_use]
    pub fn primary(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn primary_mut(&mut self) -> &mut Node {
        &mut self.nodes[0]
    }

    #[must_use]
    pub fn replicas(&self) -> &[Node] {
        &self.nodes[1..]
    }

    pub fn replicas_mut(&mut self) -> &mut [Node] {
        &mut self.nodes[1..]
    }

    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.nodes.len() - 1
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

impl ReplicationProperties for ClusterState {
    fn primary_version(&self) -> u64 {
        self.primary().version
    }

    fn primary_seat_states(&self) -> BTreeMap<SeatId, SeatState> {
        self.primary().seat_states.clone()
    }

    fn replica_views(&self) -> Vec<ReplicaView> {
        self.replicas()
            .iter()
            .map(|r| ReplicaView {
                node_id: r.id.clone(),
                version: r.version,
                synced: r.status() == ReplicaStatus::Synced,
                seat_states: r.seat_states.clone(),
            })
            .collect()
    }
}

pub(crate) fn lock_state(state: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of one `BookSeat` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BookSeatOutcome {
    /// Committed on the primary; `replication` reports each replica push
    Booked {
        version: u64,
        replication: ReplicationReport,
    },
    /// The seat was already booked; rejected before queueing
    AlreadyBooked,
    /// Another node held the seat's mutex for the whole poll window
    Contended,
}

/// Per-replica entry of [`SystemStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaSummary {
    pub node_id: NodeId,
    pub status: ReplicaStatus,
    pub version: u64,
    pub lamport: u64,
    pub local_time_s: f64,
    pub missed_writes: Vec<SeatId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub node_count: usize,
    /// Nodes synchronized within the freshness window
    pub synced_node_count: usize,
    pub event_count: usize,
    pub queued_request_count: usize,
    pub last_sync_at_ms: u64,
    pub primary_version: u64,
    pub replicas: Vec<ReplicaSummary>,
}

pub struct Cluster {
    config: CoordinatorConfig,
    runtime: Arc<Runtime>,
    state: Mutex<ClusterState>,
    replication: ReplicationCoordinator,
}

impl Cluster {
    pub fn new(config: CoordinatorConfig, runtime: Arc<Runtime>) -> Result<Self> {
        config.validate()?;
        let now_s = runtime.now_ms() as f64 / 1_000.0;
        let state = ClusterState::new(&config, now_s);
        info!(
            primary = %config.primary_id,
            replicas = config.replica_count,
            "cluster started"
        );
        Ok(Self {
            replication: ReplicationCoordinator::new(Arc::clone(&runtime)),
            config,
            runtime,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    #[must_use]
    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.replication
    }

    pub(crate) fn state(&self) -> &Mutex<ClusterState> {
        &self.state
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        lock_state(&self.state)
    }

    /// Read the cluster state under the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the cluster state under the lock.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Berkeley round: drift every clock, average onto the primary's
    /// reading, then wait out the round's latency.
    pub async fn synchronize(&self) -> BTreeMap<NodeId, f64> {
        let (adjustments, latency) = {
            let mut state = self.lock();
            let mut faults = self.runtime.faults();
            let now_ms = self.runtime.now_ms();
            let wall_s = now_ms as f64 / 1_000.0;
            for node in &mut state.nodes {
                node.local_time_s = wall_s + faults.clock_drift_s();
            }
            let reference_s = state.primary().local_time_s;
            let adjustments = berkeley::synchronize(&mut state.nodes, reference_s, now_ms);
            (adjustments, faults.sync_latency())
        };
        self.runtime.sleep(latency).await;
        info!(nodes = adjustments.len(), "clocks synchronized");
        adjustments
    }

    /// Whether the primary holds `seat_id` as Available.
    #[must_use]
    pub fn check_availability(&self, seat_id: &str) -> bool {
        self.lock().primary().seat_state(seat_id) == SeatState::Available
    }

    #[must_use]
    pub fn seat_state(&self, seat_id: &str) -> SeatState {
        self.lock().primary().seat_state(seat_id)
    }

    /// Book `seat_id` on behalf of `origin`.
    ///
    /// The request joins the seat's mutex queue with a Lamport timestamp.
    /// If it is not the head it polls a bounded number of times, then
    /// withdraws. The head locks the seat, waits for the confirmation round
    /// trip, commits Booked and propagates before releasing the queue entry.
    pub async fn book_seat(&self, seat_id: &str, origin: &str) -> Result<BookSeatOutcome> {
        let primary_id = self.config.primary_id.as_str();

        let granted = {
            let mut state = self.lock();
            let sent = if state.clocks.is_tracked(origin) {
                state.clocks.tick(origin)
            } else {
                // A returning origin resumes past the last reply it saw.
                let seen = state.clocks.current(primary_id);
                state.clocks.observe(origin, seen)
            };
            state.events.append(sent, origin, EventKind::Send, seat_id, "book request");
            let received = state.clocks.observe(primary_id, sent);
            state.events.append(
                received,
                primary_id,
                EventKind::Receive,
                seat_id,
                format!("book request from {}", origin),
            );

            let current = state.primary().seat_state(seat_id);
            match state.mutex.try_request(seat_id, origin, received, current) {
                RequestOutcome::SeatBooked => {
                    forget_origin(&mut state, origin);
                    return Ok(BookSeatOutcome::AlreadyBooked);
                }
                RequestOutcome::AlreadyQueued { .. } => {
                    warn!(seat = seat_id, origin, "request already in flight");
                    return Ok(BookSeatOutcome::Contended);
                }
                RequestOutcome::Granted => true,
                RequestOutcome::Queued => false,
            }
        };
        let mut permit = SeatPermit::new(self, seat_id, origin);

        let mut granted = granted;
        let mut attempts = 0;
        while !granted {
            if attempts >= self.config.mutex_poll_attempts {
                let holder = self.lock().mutex.holder(seat_id).map(|r| r.node_id.clone());
                warn!(seat = seat_id, origin, holder = ?holder, attempts, "mutex contended, withdrawing");
                return Ok(BookSeatOutcome::Contended);
            }
            attempts += 1;
            self.runtime.sleep(self.config.mutex_poll_interval()).await;

            let state = self.lock();
            if state.primary().seat_state(seat_id) == SeatState::Booked {
                return Ok(BookSeatOutcome::AlreadyBooked);
            }
            granted = state.mutex.is_granted(seat_id, origin);
        }

        let confirm_latency = {
            let mut state = self.lock();
            state.mutex.record_enter(seat_id, origin);
            permit.entered = true;

            if state.primary().seat_state(seat_id) == SeatState::Booked {
                return Ok(BookSeatOutcome::AlreadyBooked);
            }
            state.primary_mut().set_seat_state(seat_id, SeatState::Locked)?;
            permit.locked = true;
            let ts = state.clocks.tick(primary_id);
            state.events.append(ts, primary_id, EventKind::Local, seat_id, format!("locked for {}", origin));
            debug!(seat = seat_id, origin, "seat locked");

            self.runtime.faults().rpc_latency()
        };
        // Confirmation round trip from the origin; the seat stays Locked.
        self.runtime.sleep(confirm_latency).await;

        let (version, plans) = {
            let mut state = self.lock();
            if state.primary().seat_state(seat_id) == SeatState::Booked {
                return Ok(BookSeatOutcome::AlreadyBooked);
            }
            let version = self.replication.commit(&mut state, seat_id, SeatState::Booked)?;
            permit.locked = false;
            let ts = state.clocks.tick(primary_id);
            state.events.append(ts, primary_id, EventKind::Local, seat_id, format!("booked v{}", version));

            let mut faults = self.runtime.faults();
            let plans = self.replication.plan_propagate(
                &mut state,
                &mut faults,
                seat_id,
                SeatState::Booked,
                version,
            );
            (version, plans)
        };

        let replication = self.replication.execute(&self.state, plans).await;
        drop(permit);

        let failed = replication.values().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!(seat = seat_id, version, failed, "booked with failed replica pushes");
        }
        info!(seat = seat_id, origin, version, "seat booked");
        Ok(BookSeatOutcome::Booked {
            version,
            replication,
        })
    }

    /// Administrative overwrite of a seat on the primary, propagated to
    /// every replica. Any state may be written, including Booked→Available.
    pub async fn update_state(&self, seat_id: &str, next: SeatState) -> Result<(u64, ReplicationReport)> {
        let (version, plans) = {
            let mut state = self.lock();
            let version = self.replication.commit_overwrite(&mut state, seat_id, next);
            let ts = state.clocks.tick(&self.config.primary_id);
            state.events.append(ts, &self.config.primary_id, EventKind::Local, seat_id, format!("overwritten to {}", next));
            let mut faults = self.runtime.faults();
            let plans = self.replication.plan_propagate(&mut state, &mut faults, seat_id, next, version);
            (version, plans)
        };
        info!(seat = seat_id, state = %next, version, "seat state overwritten");
        let report = self.replication.execute(&self.state, plans).await;
        Ok((version, report))
    }

    /// Re-push missed writes to Failed replicas.
    pub async fn retry_replication(&self) -> ReplicationReport {
        self.replication.retry(&self.state).await
    }

    #[must_use]
    pub fn status(&self) -> SystemStatus {
        let now_ms = self.runtime.now_ms();
        let state = self.lock();
        let fresh = |node: &Node| {
            node.last_sync_at_ms > 0
                && now_ms.saturating_sub(node.last_sync_at_ms) < self.config.sync_freshness_ms
        };

        SystemStatus {
            node_count: state.nodes.len(),
            synced_node_count: state.nodes.iter().filter(|n| fresh(n)).count(),
            event_count: state.events.len(),
            queued_request_count: state.mutex.queued_count(),
            last_sync_at_ms: state.nodes.iter().map(|n| n.last_sync_at_ms).max().unwrap_or(0),
            primary_version: state.primary().version,
            replicas: state
                .replicas()
                .iter()
                .map(|r| ReplicaSummary {
                    node_id: r.id.clone(),
                    status: r.status(),
                    version: r.version,
                    lamport: state.clocks.current(&r.id),
                    local_time_s: r.local_time_s,
                    missed_writes: r.missed_writes(),
                })
                .collect(),
        }
    }

    /// Events in Lamport order.
    #[must_use]
    pub fn events(&self) -> Vec<LamportEvent> {
        self.lock().events.ordered()
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("primary", &self.config.primary_id)
            .field("replicas", &self.config.replica_count)
            .finish_non_exhaustive()
    }
}

/// Holds a seat's mutex queue entry.
///
/// Dropping it, on any path including a cancelled future, leaves the
/// critical section, reverts a seat still Locked by this holder and
/// withdraws the queue entry.
struct SeatPermit<'a> {
    cluster: &'a Cluster,
    seat_id: &'a str,
    origin: &'a str,
    entered: bool,
    locked: bool,
}

impl<'a> SeatPermit<'a> {
    fn new(cluster: &'a Cluster, seat_id: &'a str, origin: &'a str) -> Self {
        Self {
            cluster,
            seat_id,
            origin,
            entered: false,
            locked: false,
        }
    }
}

impl Drop for SeatPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.cluster.lock();
        if self.locked && state.primary().seat_state(self.seat_id) == SeatState::Locked {
            state
                .primary_mut()
                .force_seat_state(self.seat_id, SeatState::Available);
            debug!(seat = self.seat_id, "reverted abandoned lock");
        }
        if self.entered {
            state.mutex.record_exit(self.seat_id, self.origin);
        }
        state.mutex.release(self.seat_id, self.origin);
        forget_origin(&mut state, self.origin);
    }
}

/// Drop the clock of an origin outside the cluster once it has nothing
/// queued, so one-off sessions do not accumulate.
fn forget_origin(state: &mut ClusterState, origin: &str) {
    if state.node(origin).is_none() && !state.mutex.has_requests(origin) {
        state.clocks.forget(origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::task::{Context, Poll};

    use futures_util::future::join_all;
    use futures_util::task::noop_waker_ref;
    use sc_core::invariants::{MutexPropertyChecker, ReplicationPropertyChecker};
    use sc_core::PropertyChecker;
    use sc_dst::{DstEnv, FaultConfig};

    fn cluster(env: &mut DstEnv, config: CoordinatorConfig) -> Cluster {
        let runtime = Arc::new(Runtime::simulated(env, config.faults.clone()));
        Cluster::new(config, runtime).unwrap()
    }

    #[test]
    fn test_uncontended_booking_bumps_version() {
        let mut env = DstEnv::new(12345);
        let cluster = cluster(&mut env, CoordinatorConfig::reliable());

        let outcome = env.block_on(cluster.book_seat("B4", "session-1")).unwrap().unwrap();
        let BookSeatOutcome::Booked { version, replication } = outcome else {
            panic!("expected booking, got {:?}", outcome);
        };
        assert_eq!(version, 1);
        assert_eq!(replication.len(), 2);
        assert!(replication.values().all(|ok| *ok));
        assert_eq!(cluster.seat_state("B4"), SeatState::Booked);
        assert!(!cluster.check_availability("B4"));

        cluster.with_state(|state| {
            assert!(ReplicationPropertyChecker::new(state).check_converged().holds);
            assert_eq!(state.mutex.queued_count(), 0);
        });
    }

    #[test]
    fn test_booked_seat_rejected_before_queueing() {
        let mut env = DstEnv::new(7);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        env.block_on(cluster.book_seat("A1", "s1")).unwrap().unwrap();

        let again = env.block_on(cluster.book_seat("A1", "s2")).unwrap().unwrap();
        assert_eq!(again, BookSeatOutcome::AlreadyBooked);
        assert_eq!(cluster.with_state(|s| s.primary().version), 1);
    }

    #[test]
    fn test_concurrent_bookings_one_winner() {
        for seed in 1..=20u64 {
            let mut env = DstEnv::new(seed);
            let config = CoordinatorConfig {
                mutex_poll_attempts: 1,
                mutex_poll_interval_ms: 5,
                ..CoordinatorConfig::default()
            };
            let cluster = cluster(&mut env, config);

            let origins = ["s1", "s2", "s3"];
            let outcomes = env
                .block_on(join_all(origins.iter().map(|o| cluster.book_seat("C3", o))))
                .unwrap();

            let booked = outcomes
                .iter()
                .filter(|o| matches!(o, Ok(BookSeatOutcome::Booked { .. })))
                .count();
            assert_eq!(booked, 1, "SC_DST_SEED={}: {:?}", seed, outcomes);
            assert_eq!(cluster.seat_state("C3"), SeatState::Booked);

            cluster.with_state(|state| {
                let checker = MutexPropertyChecker::new(&state.mutex).with_seed(seed);
                if let Err(failed) = checker.verify_all() {
                    panic!("{}", failed.format_status());
                }
                assert_eq!(state.mutex.queued_count(), 0);
                assert_eq!(state.primary().version, 1);
            });
        }
    }

    #[test]
    fn test_waiter_sees_booked_seat_after_poll() {
        let mut env = DstEnv::new(3);
        let config = CoordinatorConfig {
            faults: FaultConfig::reliable(),
            mutex_poll_attempts: 50,
            mutex_poll_interval_ms: 10,
            ..CoordinatorConfig::default()
        };
        let cluster = cluster(&mut env, config);

        let outcomes = env
            .block_on(join_all([cluster.book_seat("D2", "s1"), cluster.book_seat("D2", "s2")]))
            .unwrap();
        assert!(matches!(outcomes[0], Ok(BookSeatOutcome::Booked { .. })));
        assert!(matches!(outcomes[1], Ok(BookSeatOutcome::AlreadyBooked)));
    }

    #[test]
    fn test_cancelled_booking_releases_seat() {
        let mut env = DstEnv::new(21);
        let cluster = cluster(&mut env, CoordinatorConfig::reliable());

        {
            let mut fut = std::pin::pin!(cluster.book_seat("E5", "s1"));
            let mut cx = Context::from_waker(noop_waker_ref());
            // Suspends in the confirmation round trip holding a Locked seat.
            assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Pending));
            assert_eq!(cluster.seat_state("E5"), SeatState::Locked);
            assert_eq!(cluster.with_state(|s| s.mutex.queued_count()), 1);
        }

        assert_eq!(cluster.seat_state("E5"), SeatState::Available);
        cluster.with_state(|state| {
            assert_eq!(state.mutex.queued_count(), 0);
            assert_eq!(state.primary().version, 0);
            assert!(MutexPropertyChecker::new(&state.mutex).all_hold());
        });

        let outcome = env.block_on(cluster.book_seat("E5", "s2")).unwrap().unwrap();
        assert!(matches!(outcome, BookSeatOutcome::Booked { version: 1, .. }));
    }

    #[test]
    fn test_locked_seat_is_unavailable() {
        let mut env = DstEnv::new(22);
        let cluster = cluster(&mut env, CoordinatorConfig::reliable());

        let mut fut = std::pin::pin!(cluster.book_seat("E6", "s1"));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Pending));
        assert!(!cluster.check_availability("E6"));

        let outcome = env.block_on(fut).unwrap().unwrap();
        assert!(matches!(outcome, BookSeatOutcome::Booked { .. }));
    }

    #[test]
    fn test_update_state_overwrites_booked() {
        let mut env = DstEnv::new(8);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        env.block_on(cluster.book_seat("F1", "s1")).unwrap().unwrap();

        let (version, report) = env
            .block_on(cluster.update_state("F1", SeatState::Available))
            .unwrap()
            .unwrap();
        assert_eq!(version, 2);
        assert!(report.values().all(|ok| *ok));
        assert!(cluster.check_availability("F1"));
        cluster.with_state(|state| {
            for replica in state.replicas() {
                assert_eq!(replica.seat_state("F1"), SeatState::Available);
            }
        });
    }

    #[test]
    fn test_synchronize_aligns_clocks() {
        let mut env = DstEnv::with_start_time_ms(99, 60_000);
        let cluster = cluster(&mut env, CoordinatorConfig::reliable());

        let adjustments = env.block_on(cluster.synchronize()).unwrap();
        assert_eq!(adjustments.len(), 3);
        assert!(adjustments.values().all(|a| a.abs() <= 1.0));

        cluster.with_state(|state| {
            assert!(berkeley::spread_s(&state.nodes) < 1e-9);
        });
        let status = cluster.status();
        assert_eq!(status.node_count, 3);
        assert_eq!(status.synced_node_count, 3);
        assert_eq!(status.last_sync_at_ms, 60_000);
    }

    #[test]
    fn test_status_goes_stale() {
        let mut env = DstEnv::with_start_time_ms(4, 1_000);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        assert_eq!(cluster.status().synced_node_count, 0);

        env.block_on(cluster.synchronize()).unwrap();
        assert_eq!(cluster.status().synced_node_count, 3);

        env.scheduler().advance(std::time::Duration::from_secs(6));
        assert_eq!(cluster.status().synced_node_count, 0);
    }

    #[test]
    fn test_finished_origins_are_not_tracked() {
        let mut env = DstEnv::new(32);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        for i in 0..20 {
            let seat = format!("H{}", i % 12 + 1);
            env.block_on(cluster.book_seat(&seat, &format!("session-{}", i)))
                .unwrap()
                .unwrap();
        }

        cluster.with_state(|state| {
            // Only the primary and the replicas keep counters.
            assert_eq!(state.clocks.tracked_count(), 3);
            assert!(!state.clocks.is_tracked("session-0"));
        });
    }

    #[test]
    fn test_returning_origin_stays_monotonic() {
        let mut env = DstEnv::new(33);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        env.block_on(cluster.book_seat("H1", "s1")).unwrap().unwrap();
        env.block_on(cluster.book_seat("H2", "s1")).unwrap().unwrap();

        let sends: Vec<u64> = cluster
            .events()
            .iter()
            .filter(|e| e.node_id == "s1" && e.kind == EventKind::Send)
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(sends.len(), 2);
        assert!(sends[0] < sends[1]);
        assert!(cluster.with_state(|s| !s.clocks.is_tracked("s1")));
    }

    #[test]
    fn test_events_follow_lamport_order() {
        let mut env = DstEnv::new(31);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());
        env.block_on(cluster.book_seat("G7", "s1")).unwrap().unwrap();

        let events = cluster.events();
        assert!(!events.is_empty());
        assert!(events
            .windows(2)
            .all(|w| w[0].order_key() <= w[1].order_key()));
        assert_eq!(cluster.status().event_count, events.len());
    }
}
