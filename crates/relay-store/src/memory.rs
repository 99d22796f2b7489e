//! In-process binding.
//!
//! Counters live in a `DashMap`; each topic gets one `tokio::sync::broadcast`
//! sender created on first use. Every clone shares the same backing state,
//! so several relay instances in one test can behave like separate
//! processes talking to one external store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{RelayError, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::traits::{BroadcastChannel, CounterStore, Subscription};

/// Capacity of each topic's broadcast channel.
const TOPIC_CAPACITY: usize = 128;

/// Capacity of the per-subscription forwarding queue.
const SUBSCRIPTION_BUFFER: usize = 128;

#[derive(Debug, Default)]
struct Shared {
    counters: DashMap<String, i64>,
    topics: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
    publishes: AtomicU64,
}

/// Counter store and broadcast channel held entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `TransportUnavailable`
    /// (or succeed again when `false`). Existing subscriptions keep running.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Total successful publishes across all topics.
    pub fn publish_count(&self) -> u64 {
        self.shared.publishes.load(Ordering::SeqCst)
    }

    fn check_online(&self, operation: &'static str) -> Result<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            Err(RelayError::transport(operation, "store offline"))
        } else {
            Ok(())
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.shared
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .value()
            .clone()
    }

    fn add(&self, key: &str, delta: i64) -> i64 {
        let mut entry = self.shared.counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        *entry
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.check_online("GET")?;
        Ok(self.shared.counters.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.check_online("SET")?;
        let _ = self.shared.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        self.check_online("SET")?;
        let mut written = false;
        let _ = self.shared.counters.entry(key.to_string()).or_insert_with(|| {
            written = true;
            value
        });
        Ok(written)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_online("INCR")?;
        Ok(self.add(key, 1))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.check_online("DECR")?;
        Ok(self.add(key, -1))
    }
}

#[async_trait]
impl BroadcastChannel for MemoryStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.check_online("PUBLISH")?;
        // No receivers is not an error, same as an external channel.
        let receivers = self.sender(topic).send(payload.to_string()).unwrap_or(0);
        let _ = self.shared.publishes.fetch_add(1, Ordering::SeqCst);
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.check_online("SUBSCRIBE")?;
        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic_name = topic.to_string();

        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = source.recv() => match received {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(topic = %topic_name, skipped = n, "memory subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));

        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const KEY: &str = "chat:connection-count";

    #[tokio::test]
    async fn absent_key_reads_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_decr_from_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.incr(KEY).await.unwrap(), 1);
        assert_eq!(store.incr(KEY).await.unwrap(), 2);
        assert_eq!(store.decr(KEY).await.unwrap(), 1);
        assert_eq!(store.get(KEY).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn set_if_absent_only_writes_once() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent(KEY, 0).await.unwrap());
        store.set(KEY, 7).await.unwrap();
        assert!(!store.set_if_absent(KEY, 0).await.unwrap());
        assert_eq!(store.get(KEY).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        let _ = a.incr(KEY).await.unwrap();
        assert_eq!(b.incr(KEY).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_other_clones() {
        let a = MemoryStore::new();
        let b = a.clone();
        let mut sub_a = a.subscribe("t").await.unwrap();
        let mut sub_b = b.subscribe("t").await.unwrap();

        a.publish("t", "hello").await.unwrap();

        let got_a = timeout(Duration::from_secs(1), sub_a.recv()).await.unwrap();
        let got_b = timeout(Duration::from_secs(1), sub_b.recv()).await.unwrap();
        assert_eq!(got_a.as_deref(), Some("hello"));
        assert_eq!(got_b.as_deref(), Some("hello"));
        assert_eq!(a.publish_count(), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("one").await.unwrap();
        store.publish("two", "x").await.unwrap();
        store.publish("one", "y").await.unwrap();
        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let store = MemoryStore::new();
        store.publish("nobody", "x").await.unwrap();
        assert_eq!(store.publish_count(), 1);
    }

    #[tokio::test]
    async fn offline_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.incr(KEY).await.unwrap_err();
        assert!(err.is_transport());
        assert!(store.get(KEY).await.is_err());
        assert!(store.publish("t", "x").await.is_err());
        assert!(store.subscribe("t").await.is_err());
        assert_eq!(store.publish_count(), 0);

        store.set_offline(false);
        assert_eq!(store.incr(KEY).await.unwrap(), 1);
    }
}
