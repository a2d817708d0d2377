//! Seat leases: short-lived, per-holder seat locks shared across contexts.
//!
//! A lease is created when a session selects a seat and expires after its
//! TTL. It is never refreshed. Expired leases read as absent everywhere,
//! and acquire/snapshot prune them in the same write.
//!
//! Stored under `lease:{movie}:{showtime}` as
//! `{"A1": {"holder": "...", "expiresAt": 1760000000000}}`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sc_core::invariants::LeaseHistory;
use sc_core::{HolderId, SeatId};
use sc_dst::TimeSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::ledger::{modify_json, read_json, ChangeCallback, LedgerKey, LedgerStore, SubscriptionId};

/// Stored form of one lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder: HolderId,
    /// Epoch milliseconds
    pub expires_at: u64,
}

type LeaseMap = BTreeMap<SeatId, LeaseRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatLease {
    pub seat_id: SeatId,
    pub holder: HolderId,
    pub expires_at_ms: u64,
}

impl SeatLease {
    #[must_use]
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// How a seat should be shown to one holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatDisplay {
    Booked,
    /// Live lease held by someone else
    Locked,
    /// Live lease held by the viewer
    Selected,
    Available,
}

/// Resolve display state: Booked, then a foreign live lease, then the
/// viewer's own live lease, then Available.
#[must_use]
pub fn resolve_display(
    seat_id: &str,
    booked: &BTreeSet<SeatId>,
    leases: &BTreeMap<SeatId, SeatLease>,
    viewer: &str,
    now_ms: u64,
) -> SeatDisplay {
    if booked.contains(seat_id) {
        return SeatDisplay::Booked;
    }
    match leases.get(seat_id).filter(|l| l.is_live(now_ms)) {
        Some(lease) if lease.holder != viewer => SeatDisplay::Locked,
        Some(_) => SeatDisplay::Selected,
        None => SeatDisplay::Available,
    }
}

#[derive(Debug, Default)]
enum AcquireOutcome {
    Granted,
    AlreadyHeld,
    #[default]
    Taken,
}

/// TTL lease ledger on top of a [`LedgerStore`].
pub struct SeatLeaseStore {
    store: Arc<dyn LedgerStore>,
    time: Arc<dyn TimeSource>,
    history: Option<Mutex<LeaseHistory>>,
}

impl SeatLeaseStore {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            store,
            time,
            history: None,
        }
    }

    /// Record grants and releases for [`LeasePropertyChecker`](sc_core::invariants::LeasePropertyChecker).
    #[must_use]
    pub fn with_history(mut self) -> Self {
        self.history = Some(Mutex::new(LeaseHistory::new()));
        self
    }

    #[must_use]
    pub fn history(&self) -> Option<LeaseHistory> {
        self.history
            .as_ref()
            .map(|h| h.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn record(&self, f: impl FnOnce(&mut LeaseHistory)) {
        if let Some(history) = &self.history {
            f(&mut history.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Take a lease on `seat_id` for `ttl`.
    ///
    /// Succeeds if the seat has no live lease, or already has one held by
    /// `holder` (left unchanged).
    pub fn acquire(&self, key: &LedgerKey, seat_id: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = self.now_ms();
        let expires_at = now_ms.saturating_add(ttl.as_millis() as u64);

        let outcome = modify_json(self.store.as_ref(), &key.lease_key(), |leases: &mut LeaseMap| {
            prune(leases, now_ms);
            match leases.get(seat_id) {
                Some(lease) if lease.holder == holder => AcquireOutcome::AlreadyHeld,
                Some(_) => AcquireOutcome::Taken,
                None => {
                    leases.insert(
                        seat_id.to_string(),
                        LeaseRecord {
                            holder: holder.to_string(),
                            expires_at,
                        },
                    );
                    AcquireOutcome::Granted
                }
            }
        })?;

        match outcome {
            AcquireOutcome::Granted => {
                self.record(|h| h.record_grant(seat_id, holder, now_ms, expires_at));
                debug!(%key, seat = seat_id, holder, expires_at, "lease granted");
                Ok(true)
            }
            AcquireOutcome::AlreadyHeld => Ok(true),
            AcquireOutcome::Taken => {
                debug!(%key, seat = seat_id, holder, "lease held by another holder");
                Ok(false)
            }
        }
    }

    /// Drop `holder`'s lease on `seat_id`. A lease owned by someone else is
    /// left alone.
    pub fn release(&self, key: &LedgerKey, seat_id: &str, holder: &str) -> Result<bool> {
        let now_ms = self.now_ms();
        let released = modify_json(self.store.as_ref(), &key.lease_key(), |leases: &mut LeaseMap| {
            if leases.get(seat_id).is_some_and(|l| l.holder == holder) {
                leases.remove(seat_id);
                true
            } else {
                false
            }
        })?;
        if released {
            self.record(|h| h.record_release(seat_id, holder, now_ms));
            debug!(%key, seat = seat_id, holder, "lease released");
        }
        Ok(released)
    }

    /// Drop every lease of `holder`. Returns the released seats.
    pub fn release_all(&self, key: &LedgerKey, holder: &str) -> Result<Vec<SeatId>> {
        let now_ms = self.now_ms();
        let released = modify_json(self.store.as_ref(), &key.lease_key(), |leases: &mut LeaseMap| {
            let mine: Vec<SeatId> = leases
                .iter()
                .filter(|(_, l)| l.holder == holder)
                .map(|(seat, _)| seat.clone())
                .collect();
            for seat in &mine {
                leases.remove(seat);
            }
            mine
        })?;
        for seat in &released {
            self.record(|h| h.record_release(seat, holder, now_ms));
        }
        if !released.is_empty() {
            info!(%key, holder, seats = released.len(), "leases released");
        }
        Ok(released)
    }

    /// Remove every expired lease. Returns the removed seats.
    pub fn sweep(&self, key: &LedgerKey) -> Result<Vec<SeatId>> {
        let now_ms = self.now_ms();
        let removed = modify_json(self.store.as_ref(), &key.lease_key(), |leases: &mut LeaseMap| {
            prune(leases, now_ms)
        })?;
        if !removed.is_empty() {
            debug!(%key, removed = removed.len(), "expired leases swept");
        }
        Ok(removed)
    }

    /// Live leases, pruning expired ones.
    pub fn snapshot(&self, key: &LedgerKey) -> Result<BTreeMap<SeatId, SeatLease>> {
        let now_ms = self.now_ms();
        modify_json(self.store.as_ref(), &key.lease_key(), |leases: &mut LeaseMap| {
            prune(leases, now_ms);
            to_leases(leases)
        })
    }

    /// The live lease on `seat_id`, without writing.
    pub fn lease_of(&self, key: &LedgerKey, seat_id: &str) -> Result<Option<SeatLease>> {
        let now_ms = self.now_ms();
        let leases: LeaseMap = read_json(self.store.as_ref(), &key.lease_key())?;
        Ok(leases
            .get(seat_id)
            .map(|l| SeatLease {
                seat_id: seat_id.to_string(),
                holder: l.holder.clone(),
                expires_at_ms: l.expires_at,
            })
            .filter(|l| l.is_live(now_ms)))
    }

    /// Be told about every write to this showtime's leases.
    pub fn subscribe(&self, key: &LedgerKey, callback: ChangeCallback) -> SubscriptionId {
        self.store.subscribe(&key.lease_key(), callback)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }
}

impl std::fmt::Debug for SeatLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeatLeaseStore")
            .field("history", &self.history.is_some())
            .finish_non_exhaustive()
    }
}

/// Remove leases expired at `now_ms`, returning their seats.
fn prune(leases: &mut LeaseMap, now_ms: u64) -> Vec<SeatId> {
    let expired: Vec<SeatId> = leases
        .iter()
        .filter(|(_, l)| l.expires_at <= now_ms)
        .map(|(seat, _)| seat.clone())
        .collect();
    for seat in &expired {
        leases.remove(seat);
    }
    expired
}

fn to_leases(leases: &LeaseMap) -> BTreeMap<SeatId, SeatLease> {
    leases
        .iter()
        .map(|(seat, l)| {
            (
                seat.clone(),
                SeatLease {
                    seat_id: seat.clone(),
                    holder: l.holder.clone(),
                    expires_at_ms: l.expires_at,
                },
            )
        })
        .collect()
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;

    use sc_dst::SimClock;

    use crate::ledger::MemoryLedger;

    #[test]
    fn test_concurrent_acquire_single_winner() {
        loom::model(|| {
            let clock = Arc::new(SimClock::new());
            let store = loom::sync::Arc::new(SeatLeaseStore::new(Arc::new(MemoryLedger::new()), clock));
            let key = LedgerKey::new("m", "s");

            let handles: Vec<_> = ["h1", "h2"]
                .into_iter()
                .map(|holder| {
                    let store = store.clone();
                    let key = key.clone();
                    loom::thread::spawn(move || {
                        store
                            .acquire(&key, "A1", holder, Duration::from_secs(60))
                            .unwrap()
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        });
    }
}
