//! # sc-stateright
//!
//! Stateright models of the two coordination mechanisms.
//!
//! - [`mutex_queue`]: nodes racing for one seat through the Lamport-ordered
//!   request queue. Checks the same `MutualExclusion` property as
//!   `sc_core::invariants::MutexPropertyChecker`.
//! - [`lease_ledger`]: contexts acquiring a seat lease through a shared
//!   ledger, with atomic or split read-modify-write.
//! - [`replication`]: pushes from the primary that arrive out of order or
//!   fail and are retried.

pub mod lease_ledger;
pub mod mutex_queue;
pub mod replication;

use stateright::{Checker, Expectation, Model};

pub use lease_ledger::{LeaseAction, LeaseModel, LeaseState};
pub use mutex_queue::{MutexAction, MutexModel, MutexState};
pub use replication::{ReplicationAction, ReplicationModel, ReplicationState};

/// A property whose expectation did not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelCheckError {
    #[error("property `{property}` violated ({states} states explored)")]
    Violated { property: &'static str, states: usize },

    #[error("property `{property}` never satisfied ({states} states explored)")]
    Unreachable { property: &'static str, states: usize },
}

/// Exhaustively check `model` with breadth-first search.
///
/// Returns the number of unique states explored.
pub fn verify<M>(model: M, threads: usize) -> Result<usize, ModelCheckError>
where
    M: Model + Send + Sync + 'static,
    M::State: std::hash::Hash + Send + Sync + 'static,
{
    let properties = model.properties();
    let checker = model.checker().threads(threads.max(1)).spawn_bfs().join();
    let states = checker.unique_state_count();

    for property in properties {
        let discovered = checker.discovery(property.name).is_some();
        match property.expectation {
            Expectation::Always | Expectation::Eventually if discovered => {
                return Err(ModelCheckError::Violated {
                    property: property.name,
                    states,
                });
            }
            Expectation::Sometimes if !discovered => {
                return Err(ModelCheckError::Unreachable {
                    property: property.name,
                    states,
                });
            }
            _ => {}
        }
    }
    Ok(states)
}
