//! Bounded in-memory message history (spec.md §3, §8 property 3).
//!
//! Single-producer from the router, N-producer from dealer workers; the
//! FIFO itself is internally synchronized so callers never coordinate
//! locking among themselves (spec.md §5).

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Maximum number of observations retained. Oldest is evicted on overflow.
pub const HISTORY_CAPACITY: usize = 30;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub peer_address: crate::identity::Address,
    pub kind: crate::envelope::MessageKind,
    pub observed_at: std::time::Instant,
}

/// A bounded FIFO of the last 30 observed messages, for diagnostics and
/// deduplication checks only — never consulted for delivery semantics.
pub struct MessageHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of entries in arrival order, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    fn entry(tag: u8) -> HistoryEntry {
        let mut address = [0u8; 20];
        address[0] = tag;
        HistoryEntry {
            peer_address: address,
            kind: MessageKind::Ping,
            observed_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn retains_only_the_most_recent_30_in_arrival_order() {
        let history = MessageHistory::new();
        for i in 0..40u8 {
            history.record(entry(i));
        }

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.first().unwrap().peer_address[0], 10);
        assert_eq!(snapshot.last().unwrap().peer_address[0], 39);
    }
}
