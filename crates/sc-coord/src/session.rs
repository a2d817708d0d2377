//! Browsing contexts and the seats they hold.
//!
//! A [`SelectionSession`] is one context (a tab, a kiosk, a test client)
//! with its own [`SessionId`]. Selecting a seat takes a lease under that id;
//! dropping the session releases every lease it still holds, on any exit
//! path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sc_core::SeatId;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::booking::{BookingCoordinator, BookingResult};
use crate::error::Result;
use crate::lease::SeatDisplay;
use crate::ledger::LedgerKey;

/// Opaque per-context token, used as the lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectOutcome {
    Selected,
    AlreadySelected,
    /// Booked, or leased by another session
    Unavailable,
    /// The session already holds the maximum number of seats
    LimitReached,
    UnknownSeat,
}

pub struct SelectionSession {
    coordinator: Arc<BookingCoordinator>,
    key: LedgerKey,
    id: SessionId,
    /// Seats in selection order
    selected: Vec<SeatId>,
}

impl SelectionSession {
    #[must_use]
    pub fn new(coordinator: Arc<BookingCoordinator>, key: LedgerKey) -> Self {
        Self::with_id(coordinator, key, SessionId::generate())
    }

    #[must_use]
    pub fn with_id(coordinator: Arc<BookingCoordinator>, key: LedgerKey, id: SessionId) -> Self {
        debug!(session = %id, %key, "session opened");
        Self {
            coordinator,
            key,
            id,
            selected: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    #[must_use]
    pub fn selected(&self) -> &[SeatId] {
        &self.selected
    }

    /// Lease `seat_id` for this session.
    pub fn select(&mut self, seat_id: &str) -> Result<SelectOutcome> {
        let config = self.coordinator.config();
        if !config.layout.contains(seat_id) {
            return Ok(SelectOutcome::UnknownSeat);
        }
        if self.selected.iter().any(|s| s == seat_id) {
            return Ok(SelectOutcome::AlreadySelected);
        }
        if self.selected.len() >= config.max_seats_per_booking {
            return Ok(SelectOutcome::LimitReached);
        }
        if self.coordinator.booked().contains(&self.key, seat_id)? {
            return Ok(SelectOutcome::Unavailable);
        }

        let ttl = config.lease_ttl();
        if !self
            .coordinator
            .leases()
            .acquire(&self.key, seat_id, self.id.as_str(), ttl)?
        {
            return Ok(SelectOutcome::Unavailable);
        }
        self.selected.push(seat_id.to_string());
        Ok(SelectOutcome::Selected)
    }

    /// Give `seat_id` back. Returns whether it was selected.
    pub fn deselect(&mut self, seat_id: &str) -> Result<bool> {
        let Some(index) = self.selected.iter().position(|s| s == seat_id) else {
            return Ok(false);
        };
        self.selected.remove(index);
        self.coordinator
            .leases()
            .release(&self.key, seat_id, self.id.as_str())?;
        Ok(true)
    }

    /// The theater as this session sees it.
    pub fn display(&self) -> Result<BTreeMap<SeatId, SeatDisplay>> {
        self.coordinator.display(&self.key, self.id.as_str())
    }

    /// Book the selected seats. Booked seats leave the selection; the rest
    /// stay selected so the caller can retry or deselect them.
    pub async fn book(&mut self) -> Result<BookingResult> {
        let seats = self.selected.clone();
        let result = self
            .coordinator
            .book_seats(&self.key, seats.as_slice(), self.id.as_str())
            .await?;
        let booked = result.booked_seats();
        self.selected.retain(|s| !booked.contains(s));
        Ok(result)
    }

    /// Release every lease this session holds under its key.
    pub fn release_all(&mut self) -> Result<Vec<SeatId>> {
        self.selected.clear();
        self.coordinator
            .leases()
            .release_all(&self.key, self.id.as_str())
    }
}

impl Drop for SelectionSession {
    fn drop(&mut self) {
        if let Err(err) = self.release_all() {
            warn!(session = %self.id, key = %self.key, error = %err, "failed to release leases");
        }
    }
}

impl fmt::Debug for SelectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use std::time::Duration;

    use sc_dst::DstEnv;

    use crate::cluster::Cluster;
    use crate::config::CoordinatorConfig;
    use crate::ledger::{LedgerStore, MemoryLedger};
    use crate::runtime::Runtime;

    fn coordinator(env: &mut DstEnv, config: CoordinatorConfig) -> Arc<BookingCoordinator> {
        let runtime = Arc::new(Runtime::simulated(env, config.faults.clone()));
        let cluster = Arc::new(Cluster::new(config, runtime).unwrap());
        Arc::new(BookingCoordinator::new(cluster, Arc::new(MemoryLedger::new())))
    }

    fn key() -> LedgerKey {
        LedgerKey::new("dune", "19:30")
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_two_sessions_contend() {
        let mut env = DstEnv::new(1);
        let booking = coordinator(&mut env, CoordinatorConfig::quick());
        let mut alice = booking.open_session(key());
        let mut bob = booking.open_session(key());

        assert_eq!(alice.select("A1").unwrap(), SelectOutcome::Selected);
        assert_eq!(alice.select("A1").unwrap(), SelectOutcome::AlreadySelected);
        assert_eq!(bob.select("A1").unwrap(), SelectOutcome::Unavailable);
        assert_eq!(bob.select("Z1").unwrap(), SelectOutcome::UnknownSeat);

        assert_eq!(bob.display().unwrap()["A1"], SeatDisplay::Locked);
        assert_eq!(alice.display().unwrap()["A1"], SeatDisplay::Selected);

        assert!(alice.deselect("A1").unwrap());
        assert!(!alice.deselect("A1").unwrap());
        assert_eq!(bob.select("A1").unwrap(), SelectOutcome::Selected);
    }

    #[test]
    fn test_selection_limit() {
        let mut env = DstEnv::new(2);
        let config = CoordinatorConfig {
            max_seats_per_booking: 2,
            ..CoordinatorConfig::quick()
        };
        let booking = coordinator(&mut env, config);
        let mut session = booking.open_session(key());

        assert_eq!(session.select("B1").unwrap(), SelectOutcome::Selected);
        assert_eq!(session.select("B2").unwrap(), SelectOutcome::Selected);
        assert_eq!(session.select("B3").unwrap(), SelectOutcome::LimitReached);
        assert_eq!(session.selected(), ["B1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn test_drop_releases_leases() {
        let mut env = DstEnv::new(3);
        let booking = coordinator(&mut env, CoordinatorConfig::quick());
        {
            let mut session = booking.open_session(key());
            session.select("C1").unwrap();
            session.select("C2").unwrap();
            assert_eq!(booking.leases().snapshot(&key()).unwrap().len(), 2);
        }
        assert!(booking.leases().snapshot(&key()).unwrap().is_empty());
        assert_eq!(booking.leases().store().get(&key().lease_key()).unwrap(), None);
    }

    #[test]
    fn test_book_moves_seats_out_of_selection() {
        let mut env = DstEnv::new(4);
        let booking = coordinator(&mut env, CoordinatorConfig::quick());
        let mut session = booking.open_session(key());
        let mut other = booking.open_session(key());

        session.select("D1").unwrap();
        session.select("D2").unwrap();
        // The other session books D2 out from under the lease once it expires.
        let ttl = booking.config().lease_ttl();
        env.scheduler().advance(ttl + Duration::from_secs(1));
        assert_eq!(other.select("D2").unwrap(), SelectOutcome::Selected);
        env.block_on(other.book()).unwrap().unwrap();

        let result = env.block_on(session.book()).unwrap().unwrap();
        assert_eq!(result.booked_seats(), vec!["D1".to_string()]);
        assert_eq!(result.outcome("D2"), Some(&crate::booking::SeatOutcome::AlreadyBooked));
        assert_eq!(session.selected(), ["D2".to_string()]);
        assert_eq!(session.display().unwrap()["D2"], SeatDisplay::Booked);
    }

    #[test]
    fn test_expired_selection_is_contended_at_booking() {
        let mut env = DstEnv::new(5);
        let booking = coordinator(&mut env, CoordinatorConfig::quick());
        let mut slow = booking.open_session(key());
        let mut fast = booking.open_session(key());

        slow.select("E1").unwrap();
        env.scheduler().advance(booking.config().lease_ttl());
        assert_eq!(fast.select("E1").unwrap(), SelectOutcome::Selected);

        let result = env.block_on(slow.book()).unwrap().unwrap();
        assert!(matches!(
            result.outcome("E1"),
            Some(crate::booking::SeatOutcome::Contended { .. })
        ));
        drop(slow);
        // The late session's drop leaves the newer lease alone.
        assert_eq!(
            booking.leases().lease_of(&key(), "E1").unwrap().unwrap().holder,
            fast.id().as_str()
        );
    }
}
