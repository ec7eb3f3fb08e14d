//! Service discovery contract and built-in providers.
//!
//! A discovery provider answers two questions: what servers exist right
//! now ([`ServiceDiscovery::get_services`]), and how do I hear about
//! changes ([`ServiceDiscovery::watch`]). Snapshots are whole-state, not
//! deltas. Concrete backends (etcd and friends) live outside this crate;
//! the built-in providers cover direct peer-to-peer connections and
//! statically configured server sets.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

/// Capacity of each watcher's snapshot channel.
const WATCH_CHANNEL_CAPACITY: usize = 10;

/// How long a snapshot delivery may block before it is dropped.
const WATCH_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// One discovered server: key is `<network>@<address>` (bare addresses
/// default to `tcp`), value is a query-string of advertised metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVPair {
    /// Server key.
    pub key: String,
    /// Advertised metadata, e.g. `weight=4`.
    pub value: String,
}

impl KVPair {
    /// Creates a pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Snapshot plus change-stream contract consumed by the `XClient`.
pub trait ServiceDiscovery: Send + Sync {
    /// Returns the current whole-state server snapshot.
    fn get_services(&self) -> Vec<KVPair>;

    /// Subscribes to snapshot updates. Providers without a change stream
    /// return `None`. Dropping the receiver unsubscribes.
    fn watch(&self) -> Option<mpsc::Receiver<Vec<KVPair>>> {
        None
    }

    /// Derives a discovery handle scoped to another service path.
    fn clone_with_path(&self, service_path: &str) -> Box<dyn ServiceDiscovery>;

    /// Releases provider resources.
    fn close(&self) {}
}

/// Discovery for a single, directly addressed peer. No change stream.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    server: String,
    metadata: String,
}

impl PeerDiscovery {
    /// Points at one server, e.g. `tcp@127.0.0.1:8972`.
    #[must_use]
    pub fn new(server: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            metadata: metadata.into(),
        }
    }
}

impl ServiceDiscovery for PeerDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        vec![KVPair::new(self.server.clone(), self.metadata.clone())]
    }

    fn clone_with_path(&self, _service_path: &str) -> Box<dyn ServiceDiscovery> {
        Box::new(self.clone())
    }
}

struct MultiInner {
    pairs: Mutex<Vec<KVPair>>,
    watchers: Mutex<Vec<mpsc::Sender<Vec<KVPair>>>>,
}

/// Discovery over a fixed, manually updated server list.
///
/// [`update`](MultipleServersDiscovery::update) replaces the snapshot and
/// fans it out to every watcher. Deliveries run on short-lived tasks with
/// a one-minute timeout; a delivery that cannot complete in time is
/// dropped with a warning, and a watcher whose receiver is gone is
/// removed.
#[derive(Clone)]
pub struct MultipleServersDiscovery {
    inner: Arc<MultiInner>,
}

impl MultipleServersDiscovery {
    /// Creates the provider with an initial server list.
    #[must_use]
    pub fn new(pairs: Vec<KVPair>) -> Self {
        Self {
            inner: Arc::new(MultiInner {
                pairs: Mutex::new(pairs),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replaces the server list and notifies watchers.
    pub fn update(&self, pairs: Vec<KVPair>) {
        *self.inner.pairs.lock() = pairs.clone();

        let watchers = self.inner.watchers.lock().clone();
        for watcher in watchers {
            let inner = Arc::clone(&self.inner);
            let pairs = pairs.clone();
            tokio::spawn(async move {
                match watcher.send_timeout(pairs, WATCH_SEND_TIMEOUT).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!("discovery watcher is full; snapshot dropped");
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        inner
                            .watchers
                            .lock()
                            .retain(|existing| !existing.same_channel(&watcher));
                    }
                }
            });
        }
    }
}

impl ServiceDiscovery for MultipleServersDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        self.inner.pairs.lock().clone()
    }

    fn watch(&self) -> Option<mpsc::Receiver<Vec<KVPair>>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.inner.watchers.lock().push(tx);
        Some(rx)
    }

    fn clone_with_path(&self, _service_path: &str) -> Box<dyn ServiceDiscovery> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_discovery_snapshot() {
        let discovery = PeerDiscovery::new("tcp@127.0.0.1:8972", "weight=2");
        let services = discovery.get_services();
        assert_eq!(services, vec![KVPair::new("tcp@127.0.0.1:8972", "weight=2")]);
        assert!(discovery.watch().is_none());
    }

    #[tokio::test]
    async fn test_update_reaches_watchers() {
        let discovery = MultipleServersDiscovery::new(vec![KVPair::new("tcp@a", "")]);
        let mut watch = discovery.watch().expect("watchable");

        let next = vec![KVPair::new("tcp@a", ""), KVPair::new("tcp@b", "")];
        discovery.update(next.clone());

        let snapshot = watch.recv().await.expect("snapshot delivered");
        assert_eq!(snapshot, next);
        assert_eq!(discovery.get_services(), next);
    }

    #[tokio::test]
    async fn test_closed_watcher_is_pruned() {
        let discovery = MultipleServersDiscovery::new(Vec::new());
        let watch = discovery.watch().expect("watchable");
        drop(watch);

        discovery.update(vec![KVPair::new("tcp@a", "")]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(discovery.inner.watchers.lock().is_empty());

        // Later updates see no watchers at all.
        discovery.update(vec![KVPair::new("tcp@b", "")]);
    }

    #[tokio::test]
    async fn test_two_watchers_both_receive() {
        let discovery = MultipleServersDiscovery::new(Vec::new());
        let mut first = discovery.watch().expect("watchable");
        let mut second = discovery.watch().expect("watchable");

        discovery.update(vec![KVPair::new("tcp@a", "")]);
        assert_eq!(first.recv().await.unwrap().len(), 1);
        assert_eq!(second.recv().await.unwrap().len(), 1);
    }
}
