//! Shared key-value ledger for booked seats and seat leases.
//!
//! Independent contexts (browser tabs, processes, tests) share one ledger.
//! Every mutation is a single read-modify-write under the store's writer
//! lock, and every write is announced to subscribers of its key. Contexts
//! that cannot subscribe poll with a [`LedgerWatcher`].

mod file;
mod memory;
mod watcher;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{CoordError, Result};

pub use file::JsonFileLedger;
pub use memory::MemoryLedger;
pub use watcher::LedgerWatcher;

/// The `(movie, showtime)` a ledger entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LedgerKey {
    pub movie_id: String,
    pub showtime: String,
}

impl LedgerKey {
    #[must_use]
    pub fn new(movie_id: impl Into<String>, showtime: impl Into<String>) -> Self {
        Self {
            movie_id: movie_id.into(),
            showtime: showtime.into(),
        }
    }

    /// Key of the booked seat list.
    #[must_use]
    pub fn booked_key(&self) -> String {
        format!("booked:{}:{}", self.movie_id, self.showtime)
    }

    /// Key of the lease map.
    #[must_use]
    pub fn lease_key(&self) -> String {
        format!("lease:{}:{}", self.movie_id, self.showtime)
    }

    /// Cluster resource name of `seat_id` for this showtime.
    #[must_use]
    pub fn seat_resource(&self, seat_id: &str) -> String {
        format!("{}:{}:{}", self.movie_id, self.showtime, seat_id)
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.movie_id, self.showtime)
    }
}

/// What a read-modify-write does with the value it read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Keep,
    Set(String),
    Delete,
}

/// A write to a ledger key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub key: String,
    /// New raw value; `None` when the key was deleted
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

pub type ChangeCallback = Arc<dyn Fn(&LedgerChange) + Send + Sync>;

/// Read-modify-write closure handed to [`LedgerStore::update`].
pub type Modify<'a> = &'a mut dyn FnMut(Option<&str>) -> Result<Update>;

/// A shared key-value ledger.
pub trait LedgerStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically read `key`, run `modify` on it exactly once and apply the
    /// returned [`Update`]. Returns whether the stored value changed.
    /// Subscribers of `key` are notified after the lock is released.
    fn update(&self, key: &str, modify: Modify<'_>) -> Result<bool>;

    fn subscribe(&self, key: &str, callback: ChangeCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Callback registry shared by the store implementations.
#[derive(Default)]
pub(crate) struct Subscribers {
    inner: Mutex<SubscriberList>,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    entries: Vec<(SubscriptionId, String, ChangeCallback)>,
}

impl Subscribers {
    pub(crate) fn add(&self, key: &str, callback: ChangeCallback) -> SubscriptionId {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.next_id += 1;
        let id = SubscriptionId(list.next_id);
        list.entries.push((id, key.to_string(), callback));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.entries.len();
        list.entries.retain(|(entry, _, _)| *entry != id);
        list.entries.len() != before
    }

    /// Invoke every callback registered for `change.key`, outside the
    /// registry lock so callbacks may read the ledger.
    pub(crate) fn notify(&self, change: &LedgerChange) {
        let callbacks: Vec<ChangeCallback> = {
            let list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            list.entries
                .iter()
                .filter(|(_, key, _)| *key == change.key)
                .map(|(_, _, callback)| Arc::clone(callback))
                .collect()
        };
        trace!(key = %change.key, subscribers = callbacks.len(), "ledger change");
        for callback in callbacks {
            callback(change);
        }
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Subscribers")
            .field("count", &list.entries.len())
            .finish()
    }
}

/// Apply `update` to `value`, returning the change it makes, if any.
pub(crate) fn apply_update(
    value: Option<&String>,
    key: &str,
    update: Update,
) -> Option<LedgerChange> {
    match update {
        Update::Keep => None,
        Update::Set(new) if value == Some(&new) => None,
        Update::Set(new) => Some(LedgerChange {
            key: key.to_string(),
            value: Some(new),
        }),
        Update::Delete if value.is_none() => None,
        Update::Delete => Some(LedgerChange {
            key: key.to_string(),
            value: None,
        }),
    }
}

/// Read `key` as JSON, or `T::default()` when absent.
pub fn read_json<T>(store: &dyn LedgerStore, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match store.get(key)? {
        Some(raw) => decode(key, &raw),
        None => Ok(T::default()),
    }
}

/// Atomic read-modify-write of a JSON value.
///
/// `modify` sees the decoded value (default when absent). The result is
/// written back only if it changed, and the key is deleted when it returns
/// to the default value.
pub fn modify_json<T, R>(store: &dyn LedgerStore, key: &str, modify: impl FnOnce(&mut T) -> R) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default + PartialEq + Clone,
    R: Default,
{
    let mut modify = Some(modify);
    let mut output = R::default();

    store.update(key, &mut |raw| {
        let original: T = match raw {
            Some(raw) => decode(key, raw)?,
            None => T::default(),
        };
        let Some(modify) = modify.take() else {
            return Ok(Update::Keep);
        };
        let mut value = original.clone();
        output = modify(&mut value);

        if value == original {
            Ok(Update::Keep)
        } else if value == T::default() {
            Ok(Update::Delete)
        } else {
            Ok(Update::Set(serde_json::to_string(&value)?))
        }
    })?;

    Ok(output)
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| CoordError::Malformed {
        key: key.to_string(),
        source,
    })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    #[test]
    fn test_key_rendering() {
        let key = LedgerKey::new("dune", "2026-10-19T19:30");
        assert_eq!(key.booked_key(), "booked:dune:2026-10-19T19:30");
        assert_eq!(key.lease_key(), "lease:dune:2026-10-19T19:30");
        assert_eq!(key.seat_resource("A1"), "dune:2026-10-19T19:30:A1");
    }

    #[test]
    fn test_modify_json_writes_only_changes() {
        let store = MemoryLedger::new();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&writes);
        store.subscribe(
            "k",
            Arc::new(move |change: &LedgerChange| seen.lock().unwrap().push(change.value.clone())),
        );

        let len = modify_json(&store, "k", |map: &mut BTreeMap<String, u32>| {
            map.insert("a".to_string(), 1);
            map.len()
        })
        .unwrap();
        assert_eq!(len, 1);

        // No change, no write.
        modify_json(&store, "k", |map: &mut BTreeMap<String, u32>| map.get("a").copied()).unwrap();

        // Back to default deletes the key.
        modify_json(&store, "k", |map: &mut BTreeMap<String, u32>| map.clear()).unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        assert_eq!(
            *writes.lock().unwrap(),
            vec![Some(r#"{"a":1}"#.to_string()), None]
        );
    }

    #[test]
    fn test_malformed_value_reported() {
        let store = MemoryLedger::new();
        store
            .update("k", &mut |_| Ok(Update::Set("not json".to_string())))
            .unwrap();

        let err = read_json::<Vec<String>>(&store, "k").unwrap_err();
        assert!(matches!(err, CoordError::Malformed { ref key, .. } if key == "k"));
        assert!(modify_json(&store, "k", |v: &mut Vec<String>| v.push("A1".to_string())).is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = MemoryLedger::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = store.subscribe("k", Arc::new(move |_: &LedgerChange| *counter.lock().unwrap() += 1));

        store.update("k", &mut |_| Ok(Update::Set("1".to_string()))).unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.update("k", &mut |_| Ok(Update::Set("2".to_string()))).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
