//! # sc-coord
//!
//! Coordination core for seat booking.
//!
//! Two regimes live side by side:
//!
//! - A simulated cluster ([`Cluster`]): one primary and N replicas with
//!   Berkeley clock sync, Lamport-ordered events, a per-seat mutex queue and
//!   best-effort replication with explicit retry. All waiting goes through
//!   a [`Runtime`], so a whole cluster replays from one `SC_DST_SEED`.
//! - A shared ledger ([`LedgerStore`]): booked seats and TTL seat leases
//!   that independent contexts read and write with atomic
//!   read-modify-writes.
//!
//! [`BookingCoordinator`] joins the two and is the surface outside callers
//! use: `check_availability`, `book_seats` and `system_status`.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sc_coord::{BookingCoordinator, Cluster, CoordinatorConfig, LedgerKey, MemoryLedger, Runtime};
//! use sc_dst::DstEnv;
//!
//! let mut env = DstEnv::new(12345);
//! let config = CoordinatorConfig::reliable();
//! let runtime = Arc::new(Runtime::simulated(&mut env, config.faults.clone()));
//! let cluster = Arc::new(Cluster::new(config, runtime).unwrap());
//! let booking = BookingCoordinator::new(cluster, Arc::new(MemoryLedger::new()));
//!
//! let key = LedgerKey::new("dune", "19:30");
//! let result = env.block_on(booking.book_seats(&key, &["B4"], "session-1")).unwrap().unwrap();
//! assert!(result.succeeded());
//! ```

pub mod berkeley;
pub mod booked;
pub mod booking;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lamport;
pub mod lease;
pub mod ledger;
pub mod mutex;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod runtime;
pub mod session;
mod sync;

pub use booked::BookedSeats;
pub use booking::{BookingCoordinator, BookingResult, Contention, SeatOutcome, SeatResult};
pub use cluster::{BookSeatOutcome, Cluster, ClusterState, ReplicaSummary, SystemStatus};
pub use config::{CoordinatorConfig, SeatLayout};
pub use error::{ConfigError, CoordError, Result};
pub use lamport::{EventLog, LamportClocks};
pub use lease::{resolve_display, LeaseRecord, SeatDisplay, SeatLease, SeatLeaseStore};
pub use ledger::{
    ChangeCallback, JsonFileLedger, LedgerChange, LedgerKey, LedgerStore, LedgerWatcher,
    MemoryLedger, SubscriptionId, Update,
};
pub use mutex::{MutexCoordinator, RequestOutcome};
pub use node::{Node, NodeRole, ReplicaStatus};
pub use replication::{PushPlan, ReplicationCoordinator, ReplicationReport};
pub use rpc::{Operation, RpcGateway, RpcParams, RpcReply};
pub use runtime::Runtime;
pub use session::{SelectOutcome, SelectionSession, SessionId};
