//! Store and channel seams.

use async_trait::async_trait;
use relay_core::Result;
use tokio::sync::mpsc;

/// Shared integer store, keyed by name.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Overwrite the value.
    async fn set(&self, key: &str, value: i64) -> Result<()>;

    /// Write the value only if the key is absent. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool>;

    /// Atomically increment and return the new value (absent counts as 0).
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically decrement and return the new value (absent counts as 0).
    async fn decr(&self, key: &str) -> Result<i64>;
}

/// Publish/subscribe transport with named topics.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`, in every process.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Subscribe to `topic`. Payloads published after this returns are delivered.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// A binding that is both a counter store and a broadcast channel.
pub trait RelayStore: CounterStore + BroadcastChannel {}

impl<T: CounterStore + BroadcastChannel> RelayStore for T {}

/// Receiving end of a topic subscription.
///
/// Yields payloads in channel delivery order; `recv` returns `None` once the
/// transport behind it is gone for good.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    /// Wrap a payload receiver fed by a binding-specific reader task.
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` when the subscription has ended.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_yields_in_order_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new("chat:new-message", rx);
        assert_eq!(sub.topic(), "chat:new-message");

        tx.send("a".into()).await.unwrap();
        tx.send("b".into()).await.unwrap();
        drop(tx);

        assert_eq!(sub.recv().await.as_deref(), Some("a"));
        assert_eq!(sub.recv().await.as_deref(), Some("b"));
        assert_eq!(sub.recv().await, None);
    }
}
