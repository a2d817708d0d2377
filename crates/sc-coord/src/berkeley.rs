//! Berkeley clock synchronization.
//!
//! The master polls every node's local time, computes each offset from its
//! own reference reading and redistributes the average. Every node ends on
//! `reference + mean(offsets)`, so the spread after a round is zero.

use std::collections::BTreeMap;

use sc_core::NodeId;
use tracing::debug;

use crate::node::Node;

/// Run one synchronization round.
///
/// Returns the adjustment applied to each node (`avg - offset`). An empty
/// node set is a no-op. Running it twice changes nothing the second time
/// apart from `last_sync_at_ms`.
pub fn synchronize(nodes: &mut [Node], reference_s: f64, now_ms: u64) -> BTreeMap<NodeId, f64> {
    if nodes.is_empty() {
        return BTreeMap::new();
    }

    let offsets: Vec<f64> = nodes.iter().map(|n| n.local_time_s - reference_s).collect();
    let avg = offsets.iter().sum::<f64>() / offsets.len() as f64;
    let synced_s = reference_s + avg;

    let mut adjustments = BTreeMap::new();
    for (node, offset) in nodes.iter_mut().zip(offsets) {
        let adjustment = avg - offset;
        node.local_time_s = synced_s;
        node.last_sync_at_ms = now_ms;
        adjustments.insert(node.id.clone(), adjustment);
    }

    debug!(
        nodes = adjustments.len(),
        avg_offset_s = avg,
        synced_s,
        "clock round complete"
    );
    adjustments
}

/// Largest pairwise difference between node clocks.
#[must_use]
pub fn spread_s(nodes: &[Node]) -> f64 {
    let times = nodes.iter().map(|n| n.local_time_s);
    let max = times.clone().fold(f64::NEG_INFINITY, f64::max);
    let min = times.fold(f64::INFINITY, f64::min);
    if nodes.is_empty() {
        0.0
    } else {
        max - min
    }
}
