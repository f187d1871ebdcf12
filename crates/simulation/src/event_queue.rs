//! Ordering key for the simulation event queue.

use crate::NodeIndex;
use pbft_core::{Event, EventPriority};
use std::time::Duration;

/// Events are processed by time, then priority, then node, then insertion
/// order. The sequence number makes every key unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_orders_by_time_then_priority() {
        let mut queue = BTreeMap::new();
        let t = Duration::from_millis(10);

        queue.insert(EventKey::new(t, &Event::ConsensusTimeout, 0, 1), "timer");
        queue.insert(
            EventKey::new(t, &Event::ViewChangeQuorumReached { view: pbft_types::View(1) }, 3, 2),
            "internal",
        );
        queue.insert(
            EventKey::new(Duration::from_millis(5), &Event::ApplyRetryTimer, 2, 3),
            "earlier",
        );

        let order: Vec<_> = queue.into_values().collect();
        assert_eq!(order, vec!["earlier", "internal", "timer"]);
    }

    #[test]
    fn test_sequence_breaks_ties() {
        let t = Duration::from_millis(1);
        let a = EventKey::new(t, &Event::ConsensusTimeout, 1, 7);
        let b = EventKey::new(t, &Event::ConsensusTimeout, 1, 8);
        assert!(a < b);
        assert_ne!(a, b);
    }
}
