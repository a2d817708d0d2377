//! Coordinator configuration.
//!
//! Everything tunable lives in [`CoordinatorConfig`]. It deserializes from
//! JSON with every field optional (missing fields take their defaults), and
//! comes with presets for tests and demos.

use std::path::Path;
use std::time::Duration;

use sc_core::{NodeId, SeatId};
use sc_dst::FaultConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Theater layout: rows `A`.. and seats `1..=seats_per_row`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLayout {
    pub rows: u8,
    pub seats_per_row: u16,
}

impl Default for SeatLayout {
    fn default() -> Self {
        Self {
            rows: 10,
            seats_per_row: 12,
        }
    }
}

impl SeatLayout {
    /// All seat ids, row by row (`A1`, `A2`, ..., `J12`).
    #[must_use]
    pub fn seat_ids(&self) -> Vec<SeatId> {
        (0..self.rows)
            .flat_map(|row| {
                let letter = char::from(b'A' + row);
                (1..=self.seats_per_row).map(move |seat| format!("{}{}", letter, seat))
            })
            .collect()
    }

    /// Whether `seat_id` names a seat of this layout.
    #[must_use]
    pub fn contains(&self, seat_id: &str) -> bool {
        let mut chars = seat_id.chars();
        let Some(letter) = chars.next() else {
            return false;
        };
        if !letter.is_ascii_uppercase() || (letter as u8 - b'A') >= self.rows {
            return false;
        }
        let number = chars.as_str();
        if number.starts_with('0') || !number.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        matches!(number.parse::<u16>(), Ok(n) if n >= 1 && n <= self.seats_per_row)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.rows) * usize::from(self.seats_per_row)
    }
}

/// Configuration for a cluster and the booking layer on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Id of the authoritative node
    pub primary_id: NodeId,
    /// Number of replicas (`replica-1`, `replica-2`, ...)
    pub replica_count: usize,
    /// Latency, failure and drift injection
    pub faults: FaultConfig,
    /// Lifetime of a seat lease from creation
    pub lease_ttl_ms: u64,
    /// Poll interval of the ledger watcher fallback
    pub ledger_poll_interval_ms: u64,
    /// A node synced within this window counts as synced in status
    pub sync_freshness_ms: u64,
    /// Re-polls of the mutex queue head before giving up on a seat
    pub mutex_poll_attempts: u32,
    pub mutex_poll_interval_ms: u64,
    /// Most seats one session may hold at once
    pub max_seats_per_booking: usize,
    pub layout: SeatLayout,
    /// Share of seats pre-booked the first time a showtime is seen
    pub initial_occupancy_rate: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            primary_id: "primary".to_string(),
            replica_count: 2,
            faults: FaultConfig::default(),
            lease_ttl_ms: 10 * 60 * 1_000,
            ledger_poll_interval_ms: 5_000,
            sync_freshness_ms: 5_000,
            mutex_poll_attempts: 3,
            mutex_poll_interval_ms: 50,
            max_seats_per_booking: 8,
            layout: SeatLayout::default(),
            initial_occupancy_rate: 0.0,
        }
    }
}

/// Upper bound on replicas; larger clusters add nothing to the simulation.
const REPLICA_COUNT_MAX: usize = 64;

impl CoordinatorConfig {
    /// No latency, failures or drift. For unit tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            faults: FaultConfig::none(),
            ..Self::default()
        }
    }

    /// Latency and drift but replica pushes never fail.
    #[must_use]
    pub fn reliable() -> Self {
        Self {
            faults: FaultConfig::reliable(),
            ..Self::default()
        }
    }

    /// Slow replicas failing one push in ten.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            faults: FaultConfig::flaky(),
            ..Self::default()
        }
    }

    /// Parse from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_id.is_empty() {
            return Err(invalid("primary_id", "must not be empty"));
        }
        if self.replica_count > REPLICA_COUNT_MAX {
            return Err(invalid(
                "replica_count",
                format!("{} exceeds {}", self.replica_count, REPLICA_COUNT_MAX),
            ));
        }
        if let Some(reason) = self.faults.invalid_reason() {
            return Err(invalid("faults", reason));
        }
        if self.lease_ttl_ms == 0 {
            return Err(invalid("lease_ttl_ms", "must be positive"));
        }
        if self.ledger_poll_interval_ms == 0 {
            return Err(invalid("ledger_poll_interval_ms", "must be positive"));
        }
        if self.max_seats_per_booking == 0 {
            return Err(invalid("max_seats_per_booking", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.initial_occupancy_rate) {
            return Err(invalid("initial_occupancy_rate", "must be within [0, 1]"));
        }
        if self.layout.rows == 0 || self.layout.rows > 26 || self.layout.seats_per_row == 0 {
            return Err(invalid("layout", "rows must be 1..=26 and seats_per_row positive"));
        }
        Ok(())
    }

    /// Ids of all nodes, primary first.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        std::iter::once(self.primary_id.clone())
            .chain((1..=self.replica_count).map(|i| format!("replica-{}", i)))
            .collect()
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    #[must_use]
    pub fn ledger_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_poll_interval_ms)
    }

    #[must_use]
    pub fn mutex_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mutex_poll_interval_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
