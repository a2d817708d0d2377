use std::collections::BTreeMap;

use super::{apply_update, ChangeCallback, LedgerStore, Modify, Subscribers, SubscriptionId};
use crate::error::Result;
use crate::sync::{lock, Mutex};

/// In-process ledger. Contexts share it through an `Arc`.
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<String, String>>,
    subscribers: Subscribers,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("keys", &self.len())
            .field("subscribers", &self.subscribers)
            .finish()
    }
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            subscribers: Subscribers::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl LedgerStore for MemoryLedger {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn update(&self, key: &str, modify: Modify<'_>) -> Result<bool> {
        let change = {
            let mut entries = lock(&self.entries);
            let update = modify(entries.get(key).map(String::as_str))?;
            let change = apply_update(entries.get(key), key, update);
            if let Some(change) = &change {
                match &change.value {
                    Some(value) => entries.insert(key.to_string(), value.clone()),
                    None => entries.remove(key),
                };
            }
            change
        };

        match change {
            Some(change) => {
                self.subscribers.notify(&change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, key: &str, callback: ChangeCallback) -> SubscriptionId {
        self.subscribers.add(key, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::ledger::{LedgerChange, Update};

    #[test]
    fn test_update_sees_current_value() {
        let ledger = MemoryLedger::new();
        assert!(ledger.is_empty());
        assert!(ledger.update("k", &mut |raw| {
            assert_eq!(raw, None);
            Ok(Update::Set("1".to_string()))
        })
        .unwrap());
        assert!(!ledger.update("k", &mut |raw| {
            assert_eq!(raw, Some("1"));
            Ok(Update::Keep)
        })
        .unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_callback_may_read_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let reader = Arc::clone(&ledger);
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        ledger.subscribe(
            "k",
            Arc::new(move |change: &LedgerChange| {
                *sink.lock().unwrap() = reader.get(&change.key).unwrap();
            }),
        );

        ledger
            .update("k", &mut |_| Ok(Update::Set("v".to_string())))
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_concurrent_increments_not_lost() {
        let ledger = Arc::new(MemoryLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger
                            .update("count", &mut |raw| {
                                let n: u64 = raw.map_or(0, |r| r.parse().unwrap());
                                Ok(Update::Set((n + 1).to_string()))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.get("count").unwrap().as_deref(), Some("800"));
    }
}
