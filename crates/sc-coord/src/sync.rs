//! Lock primitives, swapped for loom's under `cfg(loom)`.
//!
//! Only the memory ledger's writer lock goes through here; it is the one
//! piece of state shared across independent contexts.

#[cfg(loom)]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Mutex, MutexGuard};

/// Lock, recovering the guard from a poisoned mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
