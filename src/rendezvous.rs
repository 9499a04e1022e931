//! Per-key rendezvous between an RPC handler and the apply loop: the handler
//! registers a slot keyed by log index (or `(num, shard)` for migrations),
//! then parks on the receiver; when the entry applies, the loop fires the
//! outcome through the matching sender. Channels are buffered size 1 and the
//! send never blocks, so the apply path cannot stall on a missing waiter.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

pub struct Rendezvous<K, V> {
    slots: DashMap<K, mpsc::Sender<V>>,
}

impl<K: Eq + Hash + Clone, V> Default for Rendezvous<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> Rendezvous<K, V> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Opens a slot for `key`, replacing any stale one, and returns the
    /// receiver to park on.
    pub fn register(&self, key: K) -> mpsc::Receiver<V> {
        let (tx, rx) = mpsc::channel(1);
        self.slots.insert(key, tx);
        rx
    }

    /// Delivers `value` to the waiter at `key`, if one is parked. A missing
    /// or already-satisfied slot drops the value; the waiter's deadline and
    /// the client's retry cover that case.
    pub fn complete(&self, key: &K, value: V) {
        if let Some(slot) = self.slots.get(key) {
            let _ = slot.try_send(value);
        }
    }

    pub fn remove(&self, key: &K) {
        self.slots.remove(key);
    }
}

/// Parks on a registered slot for at most `deadline`.
pub async fn wait<V>(mut rx: mpsc::Receiver<V>, deadline: Duration) -> Option<V> {
    tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_a_registered_waiter() {
        let table: Rendezvous<u64, &str> = Rendezvous::new();
        let rx = table.register(7);
        table.complete(&7, "applied");
        assert_eq!(wait(rx, Duration::from_millis(50)).await, Some("applied"));
    }

    #[tokio::test]
    async fn completing_an_absent_key_is_harmless() {
        let table: Rendezvous<u64, &str> = Rendezvous::new();
        table.complete(&3, "nobody listening");
        let rx = table.register(3);
        assert_eq!(wait(rx, Duration::from_millis(20)).await, None);
    }
}
