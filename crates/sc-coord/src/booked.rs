//! The persisted list of booked seats per showtime.
//!
//! Stored under `booked:{movie}:{showtime}` as a JSON array. Seats are only
//! ever appended, each once, in the order they were first booked.
//!
//! With an initial occupancy configured, the first read of a showtime that
//! has no list yet draws a share of the layout as already booked and
//! persists it, so every context sees the same pre-booked seats.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use sc_core::SeatId;
use sc_dst::DeterministicRng;
use tracing::{debug, info};

use crate::error::Result;
use crate::ledger::{
    modify_json, read_json, ChangeCallback, LedgerKey, LedgerStore, SubscriptionId, Update,
};

/// Pre-booked share of a showtime, drawn once per key.
struct Occupancy {
    seats: Vec<SeatId>,
    rate: f64,
    rng: Mutex<DeterministicRng>,
}

impl Occupancy {
    fn draw(&self) -> Vec<SeatId> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        self.seats
            .iter()
            .filter(|_| rng.gen_bool(self.rate))
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct BookedSeats {
    store: Arc<dyn LedgerStore>,
    occupancy: Option<Arc<Occupancy>>,
}

impl BookedSeats {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            occupancy: None,
        }
    }

    /// Pre-book each of `seats` with probability `rate` when a showtime's
    /// list is first read.
    #[must_use]
    pub fn with_occupancy(mut self, seats: Vec<SeatId>, rate: f64, rng: DeterministicRng) -> Self {
        debug_assert!((0.0..=1.0).contains(&rate));
        self.occupancy = Some(Arc::new(Occupancy {
            seats,
            rate,
            rng: Mutex::new(rng),
        }));
        self
    }

    /// Write the pre-booked list of `key` unless a list already exists.
    fn ensure_seeded(&self, key: &LedgerKey) -> Result<()> {
        let Some(occupancy) = &self.occupancy else {
            return Ok(());
        };
        let booked_key = key.booked_key();
        if self.store.get(&booked_key)?.is_some() {
            return Ok(());
        }

        let mut seeded = Vec::new();
        let written = self.store.update(&booked_key, &mut |raw| {
            if raw.is_some() {
                return Ok(Update::Keep);
            }
            seeded = occupancy.draw();
            Ok(Update::Set(serde_json::to_string(&seeded)?))
        })?;
        if written {
            info!(%key, seats = seeded.len(), "initial occupancy seeded");
        }
        Ok(())
    }

    pub fn list(&self, key: &LedgerKey) -> Result<Vec<SeatId>> {
        self.ensure_seeded(key)?;
        read_json(self.store.as_ref(), &key.booked_key())
    }

    pub fn set(&self, key: &LedgerKey) -> Result<BTreeSet<SeatId>> {
        Ok(self.list(key)?.into_iter().collect())
    }

    pub fn contains(&self, key: &LedgerKey, seat_id: &str) -> Result<bool> {
        Ok(self.list(key)?.iter().any(|s| s == seat_id))
    }

    /// Append the seats not yet listed. Returns the ones added.
    pub fn merge(&self, key: &LedgerKey, seats: &[SeatId]) -> Result<Vec<SeatId>> {
        self.ensure_seeded(key)?;
        let added = modify_json(self.store.as_ref(), &key.booked_key(), |booked: &mut Vec<SeatId>| {
            let mut added = Vec::new();
            for seat in seats {
                if !booked.contains(seat) {
                    booked.push(seat.clone());
                    added.push(seat.clone());
                }
            }
            added
        })?;
        if !added.is_empty() {
            debug!(%key, added = ?added, "booked seats merged");
        }
        Ok(added)
    }

    pub fn subscribe(&self, key: &LedgerKey, callback: ChangeCallback) -> SubscriptionId {
        self.store.subscribe(&key.booked_key(), callback)
    }
}

impl std::fmt::Debug for BookedSeats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookedSeats")
            .field("occupancy", &self.occupancy.as_ref().map(|o| o.rate))
            .finish_non_exhaustive()
    }
}
