use tokio::sync::broadcast;

use crate::enums::EntryKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    EntryAdded {
        key: String,
        kind: EntryKind,
        size_bytes: u64,
    },
    EntryRemoved {
        key: String,
        kind: EntryKind,
        size_bytes: u64,
    },
    Purged,
    MaxSizeChanged {
        max_size: u64,
    },
}

/// Broadcast channel for cache mutations.
///
/// `publish()` is a sync call and may be made while holding cache locks.
/// If there are no subscribers, events are silently dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }

    /// Slow subscribers receive `RecvError::Lagged(n)` instead of blocking
    /// the cache.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
