//! Lamport logical clocks and the cluster event log.

use std::collections::BTreeMap;

use sc_core::{EventKind, LamportEvent, NodeId};

/// Per-node Lamport counters. Unknown nodes start at 0.
#[derive(Debug, Clone, Default)]
pub struct LamportClocks {
    counters: BTreeMap<NodeId, u64>,
}

impl LamportClocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Local or send event: increment and return the new timestamp.
    pub fn tick(&mut self, node_id: &str) -> u64 {
        let counter = self.counters.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Receive event: `max(current, received) + 1`.
    pub fn observe(&mut self, node_id: &str, received: u64) -> u64 {
        let counter = self.counters.entry(node_id.to_string()).or_insert(0);
        *counter = (*counter).max(received) + 1;
        *counter
    }

    #[must_use]
    pub fn current(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_tracked(&self, node_id: &str) -> bool {
        self.counters.contains_key(node_id)
    }

    /// Drop the counter of a node that has finished. Returns whether it
    /// was tracked.
    pub fn forget(&mut self, node_id: &str) -> bool {
        self.counters.remove(node_id).is_some()
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.counters.len()
    }
}

/// Unbounded, append-only log of timestamped events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<LamportEvent>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        timestamp: u64,
        node_id: &str,
        kind: EventKind,
        seat_id: &str,
        description: impl Into<String>,
    ) {
        self.events.push(LamportEvent {
            timestamp,
            node_id: node_id.to_string(),
            kind,
            seat_id: seat_id.to_string(),
            description: description.into(),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in append order.
    #[must_use]
    pub fn as_slice(&self) -> &[LamportEvent] {
        &self.events
    }

    /// Events in the total order `(timestamp, node_id)`.
    #[must_use]
    pub fn ordered(&self) -> Vec<LamportEvent> {
        let mut events = self.events.clone();
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_strictly_increases() {
        let mut clocks = LamportClocks::new();
        let mut last = 0;
        for i in 0..50 {
            let ts = if i % 3 == 0 {
                clocks.observe("a", i / 2)
            } else {
                clocks.tick("a")
            };
            assert!(ts > last, "{} not after {}", ts, last);
            last = ts;
        }
    }

    #[test]
    fn test_observe_jumps_past_received() {
        let mut clocks = LamportClocks::new();
        clocks.tick("a");
        assert_eq!(clocks.observe("a", 10), 11);
        // An older timestamp still advances by one.
        assert_eq!(clocks.observe("a", 3), 12);
        assert_eq!(clocks.current("a"), 12);
        assert_eq!(clocks.current("unknown"), 0);
    }

    #[test]
    fn test_forget_drops_counter() {
        let mut clocks = LamportClocks::new();
        clocks.tick("a");
        clocks.tick("b");
        assert!(clocks.forget("a"));
        assert!(!clocks.forget("a"));
        assert!(!clocks.is_tracked("a"));
        assert_eq!(clocks.current("a"), 0);
        assert_eq!(clocks.tracked_count(), 1);
    }

    #[test]
    fn test_ordered_breaks_ties_by_node() {
        let mut log = EventLog::new();
        log.append(2, "node-b", EventKind::Local, "A1", "second");
        log.append(1, "node-c", EventKind::Send, "A1", "first");
        log.append(2, "node-a", EventKind::Receive, "A1", "tie");

        let order: Vec<_> = log
            .ordered()
            .iter()
            .map(|e| (e.timestamp, e.node_id.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "node-c".to_string()),
                (2, "node-a".to_string()),
                (2, "node-b".to_string())
            ]
        );
        assert_eq!(log.len(), 3);
        assert_eq!(log.as_slice()[0].description, "second");
    }
}
