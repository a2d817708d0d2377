//! Simulated remote dispatch to the cluster.
//!
//! Every call first suspends for a drawn RPC latency. Contention and
//! booked seats come back as reply values; only an unknown operation or a
//! missing parameter is an error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sc_core::{SeatId, SeatState};
use serde::Serialize;
use tracing::debug;

use crate::cluster::{BookSeatOutcome, Cluster};
use crate::error::{CoordError, Result};
use crate::replication::ReplicationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CheckAvailability,
    BookSeat,
    UpdateState,
}

impl Operation {
    pub const ALL: [Operation; 3] = [
        Operation::CheckAvailability,
        Operation::BookSeat,
        Operation::UpdateState,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::CheckAvailability => "checkAvailability",
            Operation::BookSeat => "bookSeat",
            Operation::UpdateState => "updateState",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoordError::UnknownOperation(s.to_string()))
    }
}

/// Parameters of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParams {
    pub seat_id: SeatId,
    /// Requesting node; required by `BookSeat`
    pub origin: Option<String>,
    /// Target state; required by `UpdateState`
    pub state: Option<SeatState>,
}

impl RpcParams {
    #[must_use]
    pub fn new(seat_id: impl Into<SeatId>) -> Self {
        Self {
            seat_id: seat_id.into(),
            origin: None,
            state: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: SeatState) -> Self {
        self.state = Some(state);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcReply {
    Availability(bool),
    Booking(BookSeatOutcome),
    Updated {
        version: u64,
        replication: ReplicationReport,
    },
}

impl RpcReply {
    /// The boolean view of the reply: available, booked or written.
    #[must_use]
    pub fn ok(&self) -> bool {
        match self {
            RpcReply::Availability(available) => *available,
            RpcReply::Booking(outcome) => matches!(outcome, BookSeatOutcome::Booked { .. }),
            RpcReply::Updated { .. } => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcGateway {
    cluster: Arc<Cluster>,
}

impl RpcGateway {
    #[must_use]
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    async fn latency(&self, op: Operation, seat_id: &str) {
        let latency = self.cluster.runtime().faults().rpc_latency();
        debug!(%op, seat = seat_id, latency_ms = latency.as_millis() as u64, "rpc dispatch");
        self.cluster.runtime().sleep(latency).await;
    }

    pub async fn call(&self, op: Operation, params: RpcParams) -> Result<RpcReply> {
        match op {
            Operation::CheckAvailability => self
                .check_availability(&params.seat_id)
                .await
                .map(RpcReply::Availability),
            Operation::BookSeat => {
                let origin = params.origin.as_deref().ok_or(CoordError::MissingParameter {
                    operation: "bookSeat",
                    parameter: "origin",
                })?;
                self.book_seat(&params.seat_id, origin)
                    .await
                    .map(RpcReply::Booking)
            }
            Operation::UpdateState => {
                let state = params.state.ok_or(CoordError::MissingParameter {
                    operation: "updateState",
                    parameter: "state",
                })?;
                let (version, replication) = self.update_state(&params.seat_id, state).await?;
                Ok(RpcReply::Updated {
                    version,
                    replication,
                })
            }
        }
    }

    /// Dispatch by operation name.
    pub async fn call_named(&self, name: &str, params: RpcParams) -> Result<RpcReply> {
        let op = name.parse::<Operation>()?;
        self.call(op, params).await
    }

    pub async fn check_availability(&self, seat_id: &str) -> Result<bool> {
        self.latency(Operation::CheckAvailability, seat_id).await;
        Ok(self.cluster.check_availability(seat_id))
    }

    pub async fn book_seat(&self, seat_id: &str, origin: &str) -> Result<BookSeatOutcome> {
        self.latency(Operation::BookSeat, seat_id).await;
        self.cluster.book_seat(seat_id, origin).await
    }

    pub async fn update_state(&self, seat_id: &str, state: SeatState) -> Result<(u64, ReplicationReport)> {
        self.latency(Operation::UpdateState, seat_id).await;
        self.cluster.update_state(seat_id, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::config::CoordinatorConfig;
    use crate::runtime::Runtime;

    fn gateway(config: CoordinatorConfig) -> RpcGateway {
        let runtime = Arc::new(Runtime::production(12345, config.faults.clone()));
        RpcGateway::new(Arc::new(Cluster::new(config, runtime).unwrap()))
    }

    #[test]
    fn test_operation_names() {
        for op in Operation::ALL {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert_eq!("BookSeat".parse::<Operation>().unwrap(), Operation::BookSeat);
        let err = "deleteSeat".parse::<Operation>().unwrap_err();
        assert!(matches!(err, CoordError::UnknownOperation(ref name) if name == "deleteSeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_waits_for_latency() {
        let gateway = gateway(CoordinatorConfig::reliable());
        let start = tokio::time::Instant::now();

        let reply = gateway
            .call(Operation::CheckAvailability, RpcParams::new("A1"))
            .await
            .unwrap();
        assert_eq!(reply, RpcReply::Availability(true));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_is_an_error() {
        let gateway = gateway(CoordinatorConfig::quick());
        let err = gateway
            .call_named("cancelSeat", RpcParams::new("A1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::UnknownOperation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_parameters() {
        let gateway = gateway(CoordinatorConfig::quick());

        let err = gateway
            .call(Operation::UpdateState, RpcParams::new("A1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::MissingParameter { parameter: "state", .. }
        ));

        let err = gateway
            .call(Operation::BookSeat, RpcParams::new("A1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::MissingParameter { parameter: "origin", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_booked_seat_is_a_false_reply() {
        let gateway = gateway(CoordinatorConfig::quick());
        let params = RpcParams::new("A1").with_origin("s1");

        let first = gateway.call(Operation::BookSeat, params.clone()).await.unwrap();
        assert!(first.ok());
        let second = gateway
            .call_named("bookSeat", params.with_origin("s2"))
            .await
            .unwrap();
        assert!(!second.ok());
        assert_eq!(second, RpcReply::Booking(BookSeatOutcome::AlreadyBooked));

        let reset = gateway
            .call(
                Operation::UpdateState,
                RpcParams::new("A1").with_state(SeatState::Available),
            )
            .await
            .unwrap();
        assert!(matches!(reset, RpcReply::Updated { version: 2, .. }));
        assert!(gateway.call(Operation::CheckAvailability, RpcParams::new("A1")).await.unwrap().ok());
    }
}
