//! Stateright model of seat leases in a shared ledger.
//!
//! Browsing contexts compete for the lease of one seat. Each context tries
//! a bounded number of times; a lease can expire underneath its holder, and
//! a holder releases it when done. With `atomic` set the read of the ledger
//! and the write of the new lease are one step, as `modify_json` does them.
//! Without it they are two steps, and two contexts can both see the seat
//! free and both believe they hold it.

use stateright::Model;

/// The ledger's lease record for the seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseEntry {
    pub holder: usize,
    pub live: bool,
}

/// Where a context is in acquiring the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Idle,
    /// Read the ledger; the write has not happened yet
    Read { free: bool },
    /// Acquired; `expired` once the TTL ran out
    Holding { expired: bool },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseState {
    pub ledger: Option<LeaseEntry>,
    pub contexts: Vec<ContextState>,
    pub attempts: Vec<u8>,
}

impl LeaseState {
    pub fn new(contexts_count: usize) -> Self {
        debug_assert!(contexts_count > 0, "Must have at least one context");

        Self {
            ledger: None,
            contexts: vec![ContextState::Idle; contexts_count],
            attempts: vec![0; contexts_count],
        }
    }

    fn live_holders(&self) -> impl Iterator<Item = usize> + '_ {
        self.contexts
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, ContextState::Holding { expired: false }))
            .map(|(i, _)| i)
    }

    /// The lease is free for `context` if absent, expired or its own.
    fn free_for(&self, context: usize) -> bool {
        match self.ledger {
            None => true,
            Some(entry) => !entry.live || entry.holder == context,
        }
    }

    // ========== Invariants ==========

    /// No two contexts believe they hold a live lease.
    pub fn at_most_one_holder(&self) -> bool {
        self.live_holders().count() <= 1
    }

    /// A context holding a live lease is the ledger's holder.
    pub fn ledger_matches_holder(&self) -> bool {
        self.live_holders()
            .all(|i| self.ledger == Some(LeaseEntry { holder: i, live: true }))
    }

    pub fn invariants_hold(&self) -> bool {
        self.at_most_one_holder() && self.ledger_matches_holder()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseAction {
    /// Atomic read-modify-write of the ledger
    Acquire { context: usize },
    /// First half of a split acquire
    ReadLedger { context: usize },
    /// Second half of a split acquire
    WriteLedger { context: usize },
    Release { context: usize },
    /// The live lease's TTL runs out
    Expire,
}

/// Model for bounded model checking.
pub struct LeaseModel {
    pub contexts_count: usize,
    pub attempts_max: u8,
    pub atomic: bool,
}

impl LeaseModel {
    pub fn new(contexts_count: usize, atomic: bool) -> Self {
        debug_assert!(contexts_count > 0);

        Self {
            contexts_count,
            attempts_max: 2,
            atomic,
        }
    }
}

impl Model for LeaseModel {
    type State = LeaseState;
    type Action = LeaseAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![LeaseState::new(self.contexts_count)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (context, context_state) in state.contexts.iter().enumerate() {
            match context_state {
                ContextState::Idle => {
                    if state.attempts[context] < self.attempts_max {
                        if self.atomic {
                            actions.push(LeaseAction::Acquire { context });
                        } else {
                            actions.push(LeaseAction::ReadLedger { context });
                        }
                    }
                }
                ContextState::Read { .. } => {
                    actions.push(LeaseAction::WriteLedger { context });
                }
                ContextState::Holding { .. } => {
                    actions.push(LeaseAction::Release { context });
                }
                ContextState::Done => {}
            }
        }
        if matches!(state.ledger, Some(LeaseEntry { live: true, .. })) {
            actions.push(LeaseAction::Expire);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            LeaseAction::Acquire { context } => {
                next.attempts[context] += 1;
                if next.free_for(context) {
                    next.ledger = Some(LeaseEntry {
                        holder: context,
                        live: true,
                    });
                    next.contexts[context] = ContextState::Holding { expired: false };
                }
            }

            LeaseAction::ReadLedger { context } => {
                next.attempts[context] += 1;
                let free = next.free_for(context);
                next.contexts[context] = ContextState::Read { free };
            }

            LeaseAction::WriteLedger { context } => {
                if let ContextState::Read { free } = next.contexts[context] {
                    if free {
                        next.ledger = Some(LeaseEntry {
                            holder: context,
                            live: true,
                        });
                        next.contexts[context] = ContextState::Holding { expired: false };
                    } else {
                        next.contexts[context] = ContextState::Idle;
                    }
                }
            }

            LeaseAction::Release { context } => {
                // Only the owner's release touches the ledger.
                if matches!(next.ledger, Some(entry) if entry.holder == context) {
                    next.ledger = None;
                }
                next.contexts[context] = ContextState::Done;
            }

            LeaseAction::Expire => {
                if let Some(entry) = next.ledger.as_mut() {
                    entry.live = false;
                    if let ContextState::Holding { expired } = &mut next.contexts[entry.holder] {
                        *expired = true;
                    }
                }
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<stateright::Property<Self>> {
        vec![
            stateright::Property::always("AtMostOneHolder", |_model: &Self, state: &Self::State| {
                state.at_most_one_holder()
            }),
            stateright::Property::always(
                "LedgerMatchesHolder",
                |_model: &Self, state: &Self::State| state.ledger_matches_holder(),
            ),
            stateright::Property::sometimes("LeaseGranted", |_model: &Self, state: &Self::State| {
                state.live_holders().next().is_some()
            }),
        ]
    }
}
