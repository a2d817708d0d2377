//! CLI for running seat booking scenarios and model checks.
//!
//! # Usage
//!
//! ```bash
//! # Two sessions leasing and booking A1,A2 in virtual time
//! cargo run -p sc-cli --bin sc-sim -- simulate --seats A1,A2 --sessions 2
//!
//! # Replay a run, flaky replicas, all sessions racing for one seat
//! SC_DST_SEED=42 cargo run -p sc-cli --bin sc-sim -- simulate --preset flaky --mode direct --seats B4 --sessions 5
//!
//! # Exhaustively check the coordination models
//! cargo run -p sc-cli --bin sc-sim -- check --threads 4
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use sc_cli::{run_scenario, BookingMode, CliError, Preset, Scenario};
use sc_coord::{
    BookingCoordinator, Cluster, CoordinatorConfig, JsonFileLedger, LedgerKey, LedgerStore,
    MemoryLedger, Runtime,
};
use sc_dst::{get_or_generate_seed, DeterministicRng, DstEnv};
use sc_stateright::{verify, LeaseModel, ModelCheckError, MutexModel, ReplicationModel};
use serde_json::json;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sc-sim", version, about = "Seat booking coordination simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run contending sessions against a simulated cluster and print a JSON report
    Simulate(SimulateArgs),
    /// Model-check the mutex queue, the lease ledger and replication
    Check {
        /// Checker threads
        #[arg(long, default_value_t = 1)]
        threads: usize,
        /// Nodes in the mutex queue model
        #[arg(long, default_value_t = 3)]
        nodes: usize,
    },
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Seed to replay; defaults to $SC_DST_SEED or a fresh one
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = Preset::Reliable)]
    preset: Preset,
    /// JSON config file; replaces the preset
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    sessions: usize,
    #[arg(long, value_delimiter = ',', default_value = "A1,A2")]
    seats: Vec<String>,
    #[arg(long, default_value = "dune")]
    movie: String,
    #[arg(long, default_value = "19:30")]
    showtime: String,
    #[arg(long, value_enum, default_value_t = BookingMode::Leased)]
    mode: BookingMode,
    /// Keep the ledger in this JSON file instead of memory
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Share of seats already booked when a showtime is first seen
    #[arg(long)]
    occupancy: Option<f64>,
    /// Wall clock and tokio timers instead of virtual time
    #[arg(long)]
    realtime: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,sc_coord=info,sc_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => match simulate(args) {
            Ok(report) => {
                println!("{}", report);
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "simulation failed");
                eprintln!("Error: {}", err);
                ExitCode::FAILURE
            }
        },
        Command::Check { threads, nodes } => check(threads, nodes),
    }
}

fn simulate(args: SimulateArgs) -> Result<String, CliError> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_path(path)?,
        None => args.preset.config(),
    };
    if let Some(rate) = args.occupancy {
        config.initial_occupancy_rate = rate;
        config.validate()?;
    }
    let seed = args.seed.unwrap_or_else(get_or_generate_seed);
    let ledger: Arc<dyn LedgerStore> = match &args.ledger {
        Some(path) => Arc::new(JsonFileLedger::open(path)?),
        None => Arc::new(MemoryLedger::new()),
    };
    let scenario = Scenario {
        key: LedgerKey::new(args.movie, args.showtime),
        seats: args.seats,
        sessions: args.sessions,
        mode: args.mode,
    };

    let report = if args.realtime {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)?;
        let runtime = Arc::new(Runtime::production(seed, config.faults.clone()));
        let cluster = Arc::new(Cluster::new(config, runtime)?);
        let coordinator = Arc::new(
            BookingCoordinator::new(cluster, ledger)
                .with_initial_occupancy(DeterministicRng::new(seed)),
        );

        let report = rt.block_on(run_scenario(&coordinator, &scenario))?;
        json!({
            "seed": seed,
            "clock": "realtime",
            "winners": report.winners(),
            "report": report,
        })
    } else {
        let mut env = DstEnv::new(seed);
        let runtime = Arc::new(Runtime::simulated(&mut env, config.faults.clone()));
        let cluster = Arc::new(Cluster::new(config, runtime)?);
        let coordinator = Arc::new(
            BookingCoordinator::new(cluster, ledger).with_initial_occupancy(env.rng().fork()),
        );

        let report = env.block_on(run_scenario(&coordinator, &scenario))??;
        json!({
            "seed": seed,
            "clock": "virtual",
            "stats": env.stats().to_string(),
            "winners": report.winners(),
            "report": report,
        })
    };

    Ok(serde_json::to_string_pretty(&report)?)
}

fn check(threads: usize, nodes: usize) -> ExitCode {
    if !(1..=4).contains(&nodes) {
        eprintln!("Error: --nodes must be 1..=4");
        return ExitCode::FAILURE;
    }

    let results: [(&str, Result<usize, ModelCheckError>); 3] = [
        ("mutex_queue", verify(MutexModel::new(nodes), threads)),
        ("lease_ledger", verify(LeaseModel::new(2, true), threads)),
        ("replication", verify(ReplicationModel::new(2, 2), threads)),
    ];

    let mut failed = false;
    for (name, result) in results {
        match result {
            Ok(states) => println!("{:<14} ok ({} states)", name, states),
            Err(err) => {
                failed = true;
                println!("{:<14} FAILED: {}", name, err);
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
