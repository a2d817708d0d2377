use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use sc_dst::Sleeper;
use tracing::debug;

use super::{LedgerChange, LedgerStore};
use crate::error::Result;

/// Polling fallback for contexts that cannot subscribe.
///
/// Re-reads one key and reports the raw value whenever it differs from the
/// last one seen. The first poll always reports.
pub struct LedgerWatcher {
    store: Arc<dyn LedgerStore>,
    key: String,
    last: Option<Option<String>>,
}

impl LedgerWatcher {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            last: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn poll(&mut self) -> Result<Option<LedgerChange>> {
        let current = self.store.get(&self.key)?;
        if self.last.as_ref() == Some(&current) {
            return Ok(None);
        }
        self.last = Some(current.clone());
        Ok(Some(LedgerChange {
            key: self.key.clone(),
            value: current,
        }))
    }

    /// Poll every `interval` until `on_change` breaks.
    pub async fn run(
        &mut self,
        sleeper: &dyn Sleeper,
        interval: Duration,
        mut on_change: impl FnMut(&LedgerChange) -> ControlFlow<()>,
    ) -> Result<()> {
        loop {
            if let Some(change) = self.poll()? {
                debug!(key = %change.key, "ledger change observed by poll");
                if on_change(&change).is_break() {
                    return Ok(());
                }
            }
            sleeper.sleep(interval).await;
        }
    }
}

impl std::fmt::Debug for LedgerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerWatcher")
            .field("key", &self.key)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
