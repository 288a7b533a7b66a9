//! Filesystem-scoped broadcast channels used to wake waiting state machines.

use std::sync::Arc;

use dashmap::DashMap;
use snapmesh_zfs::Snapshot;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

/// Broadcast registry keyed by filesystem id.
///
/// Publishing to a key nobody listens on is a no-op. Channels are created on
/// first subscription and removed when the last [`Subscription`] drops.
pub struct Notifier<T: Clone> {
    channels: Arc<DashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> Default for Notifier<T> {
    fn default() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone> Notifier<T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening on `key`.
    pub fn subscribe(&self, key: &str) -> Subscription<T> {
        let rx = self
            .channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Subscription {
            key: key.to_string(),
            rx,
            channels: Arc::clone(&self.channels),
        }
    }

    /// Sends `value` to every current subscriber of `key`.
    pub fn publish(&self, key: &str, value: T) {
        if let Some(tx) = self.channels.get(key) {
            let receivers = tx.send(value).unwrap_or(0);
            trace!(key, receivers, "published");
        }
    }

    /// Number of keys with live subscribers.
    pub fn active_keys(&self) -> usize {
        self.channels.len()
    }
}

/// Live subscription; unsubscribes on drop.
pub struct Subscription<T: Clone> {
    key: String,
    rx: broadcast::Receiver<T>,
    channels: Arc<DashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> Subscription<T> {
    /// Next published value. Values missed while lagging are skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Our own receiver is still alive here.
        self.channels
            .remove_if(&self.key, |_, tx| tx.receiver_count() <= 1);
    }
}

/// Snapshots reported by one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSnapshots {
    /// Reporting node.
    pub server: String,
    /// Its snapshots of the filesystem.
    pub snapshots: Vec<Snapshot>,
}

/// Every notification channel a node uses.
#[derive(Default)]
pub struct Notifications {
    /// The master of a filesystem reported new snapshots.
    pub master_snapshots: Notifier<Vec<Snapshot>>,
    /// Any node reported snapshots of a filesystem.
    pub server_snapshots: Notifier<ServerSnapshots>,
    /// A pushed stream landed locally.
    pub external_snapshots_changed: Notifier<()>,
    /// Bytes of a pushed stream received so far.
    pub receive_progress: Notifier<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_that_key_only() {
        let notifier: Notifier<u32> = Notifier::new();
        let mut a = notifier.subscribe("fs-a");
        let mut b = notifier.subscribe("fs-b");
        notifier.publish("fs-a", 7);
        assert_eq!(a.recv().await, Some(7));
        notifier.publish("fs-b", 9);
        assert_eq!(b.recv().await, Some(9));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let notifier: Notifier<u32> = Notifier::new();
        notifier.publish("nobody", 1);
        assert_eq!(notifier.active_keys(), 0);
    }

    #[test]
    fn test_last_subscription_drop_removes_channel() {
        let notifier: Notifier<()> = Notifier::new();
        let first = notifier.subscribe("fs");
        let second = notifier.subscribe("fs");
        drop(first);
        assert_eq!(notifier.active_keys(), 1);
        drop(second);
        assert_eq!(notifier.active_keys(), 0);
    }
}
