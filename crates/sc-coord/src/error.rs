//! Error types.
//!
//! Contention, booked seats and failed replica pushes are outcomes, not
//! errors. What ends up here is a programming mistake (unknown operation,
//! missing parameter, bad configuration) or a ledger that cannot be read or
//! written.

use std::path::PathBuf;

use sc_core::TransitionError;

/// Errors raised by the coordination core.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("unknown RPC operation `{0}`")]
    UnknownOperation(String),

    #[error("RPC {operation} requires parameter `{parameter}`")]
    MissingParameter {
        operation: &'static str,
        parameter: &'static str,
    },

    #[error("unknown node `{0}`")]
    UnknownNode(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("ledger i/o on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {} stayed locked for {waited_ms}ms", path.display())]
    LedgerBusy { path: PathBuf, waited_ms: u64 },

    #[error("ledger value under `{key}` is malformed: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode ledger value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoordError>;
