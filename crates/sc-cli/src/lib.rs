//! Booking scenarios driven by the `sc-sim` binary.
//!
//! A [`Scenario`] opens a number of selection sessions on one showtime and
//! lets them compete for the same seats. In [`BookingMode::Leased`] each
//! session first leases seats the way a browsing context would, so leases
//! settle most conflicts before booking. In [`BookingMode::Direct`] every
//! session books every seat at once and the cluster's mutex queue decides.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use sc_coord::{
    BookingCoordinator, BookingResult, ConfigError, CoordError, CoordinatorConfig, LedgerKey,
    ReplicationReport, SelectOutcome, SelectionSession, SessionId, SystemStatus,
};
use sc_core::SeatId;
use sc_dst::DstError;
use serde::Serialize;
use tracing::info;

/// Errors surfaced by the simulator.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("simulation aborted: {0}")]
    Simulation(#[from] DstError),

    #[error("failed to start tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Named configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Preset {
    /// No latency, failures or drift
    Quick,
    /// Latency and drift, pushes never fail
    Reliable,
    /// Slow replicas failing one push in ten
    Flaky,
}

impl Preset {
    #[must_use]
    pub fn config(self) -> CoordinatorConfig {
        match self {
            Preset::Quick => CoordinatorConfig::quick(),
            Preset::Reliable => CoordinatorConfig::reliable(),
            Preset::Flaky => CoordinatorConfig::flaky(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BookingMode {
    /// Lease seats through sessions, then book the leased ones
    Leased,
    /// Book every seat from every session without leasing
    Direct,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub key: LedgerKey,
    pub seats: Vec<SeatId>,
    pub sessions: usize,
    pub mode: BookingMode,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub session: String,
    /// Empty in direct mode
    pub selections: BTreeMap<SeatId, SelectOutcome>,
    pub booking: BookingResult,
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub mode: BookingMode,
    pub sessions: Vec<SessionReport>,
    /// Outcome of one retry round after all bookings finished
    pub retried: ReplicationReport,
    pub status: SystemStatus,
}

impl ScenarioReport {
    /// Seats booked, with the session that booked each.
    #[must_use]
    pub fn winners(&self) -> BTreeMap<SeatId, Vec<String>> {
        let mut winners: BTreeMap<SeatId, Vec<String>> = BTreeMap::new();
        for report in &self.sessions {
            for seat in report.booking.booked_seats() {
                winners.entry(seat).or_default().push(report.session.clone());
            }
        }
        winners
    }
}

/// Run `scenario` to completion.
///
/// Session ids are `session-1`, `session-2`, ... so a seeded run is fully
/// reproducible. Leases still held when the scenario ends are released as
/// the sessions drop.
pub async fn run_scenario(
    coordinator: &Arc<BookingCoordinator>,
    scenario: &Scenario,
) -> Result<ScenarioReport, CoordError> {
    let mut sessions: Vec<SelectionSession> = (1..=scenario.sessions)
        .map(|i| {
            SelectionSession::with_id(
                Arc::clone(coordinator),
                scenario.key.clone(),
                SessionId::from(format!("session-{}", i)),
            )
        })
        .collect();
    let mut selections = vec![BTreeMap::new(); sessions.len()];

    let results = match scenario.mode {
        BookingMode::Leased => {
            // Rotate who picks first so seats spread across sessions.
            for (offset, seat_id) in scenario.seats.iter().enumerate() {
                for turn in 0..sessions.len() {
                    let index = (offset + turn) % sessions.len();
                    let outcome = sessions[index].select(seat_id)?;
                    selections[index].insert(seat_id.clone(), outcome);
                }
            }
            join_all(sessions.iter_mut().map(|session| session.book())).await
        }
        BookingMode::Direct => {
            join_all(sessions.iter().map(|session| {
                coordinator.book_seats(
                    &scenario.key,
                    scenario.seats.as_slice(),
                    session.id().as_str(),
                )
            }))
            .await
        }
    };

    let mut reports = Vec::with_capacity(sessions.len());
    for ((session, selections), result) in sessions.iter().zip(selections).zip(results) {
        reports.push(SessionReport {
            session: session.id().to_string(),
            selections,
            booking: result?,
        });
    }

    let retried = coordinator.cluster().retry_replication().await;
    let status = coordinator.system_status();
    info!(
        key = %scenario.key,
        sessions = reports.len(),
        synced = status.synced_node_count,
        "scenario finished"
    );

    Ok(ScenarioReport {
        mode: scenario.mode,
        sessions: reports,
        retried,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use sc_coord::{Cluster, MemoryLedger, Runtime};
    use sc_dst::DstEnv;

    fn coordinator(env: &mut DstEnv, config: CoordinatorConfig) -> Arc<BookingCoordinator> {
        let runtime = Arc::new(Runtime::simulated(env, config.faults.clone()));
        let cluster = Arc::new(Cluster::new(config, runtime).unwrap());
        Arc::new(BookingCoordinator::new(cluster, Arc::new(MemoryLedger::new())))
    }

    fn scenario(seats: &[&str], sessions: usize, mode: BookingMode) -> Scenario {
        Scenario {
            key: LedgerKey::new("dune", "19:30"),
            seats: seats.iter().map(|s| s.to_string()).collect(),
            sessions,
            mode,
        }
    }

    #[test]
    fn test_leased_sessions_split_seats() {
        let mut env = DstEnv::new(12345);
        let coordinator = coordinator(&mut env, CoordinatorConfig::reliable());
        let scenario = scenario(&["A1", "A2"], 2, BookingMode::Leased);

        let report = env
            .block_on(run_scenario(&coordinator, &scenario))
            .unwrap()
            .unwrap();

        let winners = report.winners();
        assert_eq!(winners["A1"], vec!["session-1"]);
        assert_eq!(winners["A2"], vec!["session-2"]);
        assert_eq!(
            report.sessions[1].selections["A1"],
            SelectOutcome::Unavailable
        );
        assert!(report.sessions.iter().all(|s| s.booking.succeeded()));
    }

    #[test]
    fn test_direct_sessions_book_each_seat_once() {
        for seed in 1..=10 {
            let mut env = DstEnv::new(seed);
            let coordinator = coordinator(&mut env, CoordinatorConfig::reliable());
            let scenario = scenario(&["A1"], 3, BookingMode::Direct);

            let report = env
                .block_on(run_scenario(&coordinator, &scenario))
                .unwrap()
                .unwrap();

            let winners = report.winners();
            assert_eq!(
                winners.get("A1").map(Vec::len),
                Some(1),
                "{}: {:?}",
                env.format_seed(),
                winners
            );
        }
    }

    #[test]
    fn test_leases_released_after_scenario() {
        let mut env = DstEnv::new(7);
        let coordinator = coordinator(&mut env, CoordinatorConfig::quick());
        let scenario = scenario(&["B1", "B2", "B3"], 2, BookingMode::Leased);

        env.block_on(run_scenario(&coordinator, &scenario))
            .unwrap()
            .unwrap();

        let leases = coordinator.leases().snapshot(&scenario.key).unwrap();
        assert!(leases.is_empty(), "leftover leases: {:?}", leases);
        let booked = coordinator.booked().set(&scenario.key).unwrap();
        assert_eq!(booked.len(), 3);
    }

    #[test]
    fn test_report_serializes() {
        let mut env = DstEnv::new(99);
        let coordinator = coordinator(&mut env, CoordinatorConfig::quick());
        let scenario = scenario(&["C4"], 1, BookingMode::Direct);

        let report = env
            .block_on(run_scenario(&coordinator, &scenario))
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["mode"], "direct");
        assert_eq!(json["sessions"][0]["booking"]["seats"][0]["outcome"], "booked");
        assert_eq!(json["status"]["node_count"], 3);
    }
}
