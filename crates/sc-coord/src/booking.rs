//! The booking entry point used by outside collaborators.
//!
//! [`BookingCoordinator`] ties the shared ledger (booked seats and leases)
//! to the simulated cluster. Seats are processed one at a time and each
//! gets its own outcome; a request for several seats can partly succeed,
//! and the seats that were booked stay booked.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sc_core::{HolderId, SeatId};
use sc_dst::DeterministicRng;
use serde::Serialize;
use tracing::{info, warn};

use crate::booked::BookedSeats;
use crate::cluster::{BookSeatOutcome, Cluster, SystemStatus};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::lease::{resolve_display, SeatDisplay, SeatLeaseStore};
use crate::ledger::{LedgerKey, LedgerStore};
use crate::replication::ReplicationReport;
use crate::rpc::RpcGateway;
use crate::session::SelectionSession;

/// Who stood in the way of a seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Contention {
    /// Another session holds a live lease
    Lease { holder: HolderId },
    /// Another request held the seat's mutex for the whole poll window
    Mutex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SeatOutcome {
    Booked {
        version: u64,
        replication: ReplicationReport,
    },
    AlreadyBooked,
    Contended {
        by: Contention,
    },
    /// Not a seat of the theater layout
    UnknownSeat,
}

impl SeatOutcome {
    #[must_use]
    pub fn is_booked(&self) -> bool {
        matches!(self, SeatOutcome::Booked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatResult {
    pub seat_id: SeatId,
    #[serde(flatten)]
    pub outcome: SeatOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingResult {
    pub key: LedgerKey,
    pub holder: HolderId,
    /// One entry per distinct requested seat, in request order
    pub seats: Vec<SeatResult>,
}

impl BookingResult {
    /// Whether every requested seat was booked.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.seats.is_empty() && self.seats.iter().all(|s| s.outcome.is_booked())
    }

    #[must_use]
    pub fn booked_seats(&self) -> Vec<SeatId> {
        self.seats
            .iter()
            .filter(|s| s.outcome.is_booked())
            .map(|s| s.seat_id.clone())
            .collect()
    }

    #[must_use]
    pub fn failed_seats(&self) -> Vec<SeatId> {
        self.seats
            .iter()
            .filter(|s| !s.outcome.is_booked())
            .map(|s| s.seat_id.clone())
            .collect()
    }

    #[must_use]
    pub fn outcome(&self, seat_id: &str) -> Option<&SeatOutcome> {
        self.seats
            .iter()
            .find(|s| s.seat_id == seat_id)
            .map(|s| &s.outcome)
    }
}

pub struct BookingCoordinator {
    cluster: Arc<Cluster>,
    gateway: RpcGateway,
    leases: SeatLeaseStore,
    booked: BookedSeats,
}

impl BookingCoordinator {
    /// Coordinator over `cluster`, sharing `ledger` with other contexts.
    #[must_use]
    pub fn new(cluster: Arc<Cluster>, ledger: Arc<dyn LedgerStore>) -> Self {
        let leases = SeatLeaseStore::new(Arc::clone(&ledger), cluster.runtime().time_source());
        Self::from_parts(cluster, leases, BookedSeats::new(ledger))
    }

    #[must_use]
    pub fn from_parts(cluster: Arc<Cluster>, leases: SeatLeaseStore, booked: BookedSeats) -> Self {
        Self {
            gateway: RpcGateway::new(Arc::clone(&cluster)),
            cluster,
            leases,
            booked,
        }
    }

    /// Pre-book `initial_occupancy_rate` of each showtime's seats the first
    /// time it is seen, drawing from `rng`. A zero rate leaves it off.
    #[must_use]
    pub fn with_initial_occupancy(mut self, rng: DeterministicRng) -> Self {
        let rate = self.config().initial_occupancy_rate;
        if rate > 0.0 {
            let seats = self.config().layout.seat_ids();
            self.booked = self.booked.with_occupancy(seats, rate, rng);
        }
        self
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        self.cluster.config()
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    #[must_use]
    pub fn gateway(&self) -> &RpcGateway {
        &self.gateway
    }

    #[must_use]
    pub fn leases(&self) -> &SeatLeaseStore {
        &self.leases
    }

    #[must_use]
    pub fn booked(&self) -> &BookedSeats {
        &self.booked
    }

    /// Book `seats` for `holder`, one seat at a time.
    ///
    /// Per seat: reject seats outside the layout, seats already booked and
    /// seats under another holder's live lease; otherwise synchronize the
    /// clocks and book through the gateway. A booked seat has its lease
    /// released and is appended to the booked list.
    pub async fn book_seats<S: AsRef<str>>(
        &self,
        key: &LedgerKey,
        seats: &[S],
        holder: &str,
    ) -> Result<BookingResult> {
        let mut seen = BTreeSet::new();
        let mut results = Vec::with_capacity(seats.len());

        for seat_id in seats.iter().map(AsRef::<str>::as_ref) {
            if !seen.insert(seat_id) {
                continue;
            }
            let outcome = self.book_one(key, seat_id, holder).await?;
            if let SeatOutcome::Contended { by } = &outcome {
                warn!(%key, seat = seat_id, holder, contention = ?by, "seat contended");
            }
            results.push(SeatResult {
                seat_id: seat_id.to_string(),
                outcome,
            });
        }

        let result = BookingResult {
            key: key.clone(),
            holder: holder.to_string(),
            seats: results,
        };
        info!(
            %key,
            holder,
            booked = result.booked_seats().len(),
            failed = result.failed_seats().len(),
            "booking finished"
        );
        Ok(result)
    }

    async fn book_one(&self, key: &LedgerKey, seat_id: &str, holder: &str) -> Result<SeatOutcome> {
        if !self.config().layout.contains(seat_id) {
            return Ok(SeatOutcome::UnknownSeat);
        }
        if self.booked.contains(key, seat_id)? {
            return Ok(SeatOutcome::AlreadyBooked);
        }
        if let Some(lease) = self.leases.snapshot(key)?.remove(seat_id) {
            if lease.holder != holder {
                return Ok(SeatOutcome::Contended {
                    by: Contention::Lease {
                        holder: lease.holder,
                    },
                });
            }
        }

        self.cluster.synchronize().await;
        let resource = key.seat_resource(seat_id);
        match self.gateway.book_seat(&resource, holder).await? {
            BookSeatOutcome::Booked {
                version,
                replication,
            } => {
                self.leases.release(key, seat_id, holder)?;
                self.booked.merge(key, &[seat_id.to_string()])?;
                Ok(SeatOutcome::Booked {
                    version,
                    replication,
                })
            }
            BookSeatOutcome::AlreadyBooked => {
                // Booked in the cluster but missing from the ledger.
                self.booked.merge(key, &[seat_id.to_string()])?;
                Ok(SeatOutcome::AlreadyBooked)
            }
            BookSeatOutcome::Contended => Ok(SeatOutcome::Contended {
                by: Contention::Mutex,
            }),
        }
    }

    /// Whether each seat could be booked by `holder` right now.
    ///
    /// Each distinct seat of the layout is checked on the primary through
    /// the gateway, one RPC at a time, then merged with the booked list and
    /// the live leases.
    pub async fn check_availability<S: AsRef<str>>(
        &self,
        key: &LedgerKey,
        seats: &[S],
        holder: &str,
    ) -> Result<BTreeMap<SeatId, bool>> {
        let mut availability = BTreeMap::new();
        for seat_id in seats.iter().map(AsRef::<str>::as_ref) {
            if availability.contains_key(seat_id) {
                continue;
            }
            let available = self.config().layout.contains(seat_id)
                && self
                    .gateway
                    .check_availability(&key.seat_resource(seat_id))
                    .await?;
            availability.insert(seat_id.to_string(), available);
        }

        let booked = self.booked.set(key)?;
        let leases = self.leases.snapshot(key)?;
        let now_ms = self.leases.now_ms();
        for (seat_id, available) in &mut availability {
            *available = *available
                && matches!(
                    resolve_display(seat_id, &booked, &leases, holder, now_ms),
                    SeatDisplay::Available | SeatDisplay::Selected
                );
        }
        Ok(availability)
    }

    /// Display state of every seat of the layout as seen by `viewer`.
    pub fn display(&self, key: &LedgerKey, viewer: &str) -> Result<BTreeMap<SeatId, SeatDisplay>> {
        let booked = self.booked.set(key)?;
        let leases = self.leases.snapshot(key)?;
        let now_ms = self.leases.now_ms();

        Ok(self
            .config()
            .layout
            .seat_ids()
            .into_iter()
            .map(|seat_id| {
                let display = resolve_display(&seat_id, &booked, &leases, viewer, now_ms);
                (seat_id, display)
            })
            .collect())
    }

    #[must_use]
    pub fn system_status(&self) -> SystemStatus {
        self.cluster.status()
    }

    /// Start a browsing context for `key` with a fresh session id.
    #[must_use]
    pub fn open_session(self: &Arc<Self>, key: LedgerKey) -> SelectionSession {
        SelectionSession::new(Arc::clone(self), key)
    }
}

impl std::fmt::Debug for BookingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingCoordinator")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}
