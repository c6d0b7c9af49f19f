//! The `Broker` trait: the single async interface to key/value, list, set and
//! pub/sub storage shared by the manager, its workers and clients.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BrokerError;

/// A live subscription to one pub/sub channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            forwarder: None,
        }
    }

    /// Attach the task that feeds this subscription; it is aborted on drop.
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next payload if one is already buffered.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Backend-agnostic broker. Values are opaque strings (JSON in practice).
#[async_trait]
pub trait Broker: Send + Sync {
    // ── Lists ───────────────────────────────────────────────────────

    /// Append to the tail of a list.
    async fn push(&self, list: &str, value: &str) -> Result<(), BrokerError>;

    /// Pop from the head of a list, waiting up to `timeout`. `None` on timeout.
    async fn blocking_pop(&self, list: &str, timeout: Duration)
    -> Result<Option<String>, BrokerError>;

    /// Pop from the head of `list` and record the value in `set` as one
    /// atomic step: at every instant the value is in exactly one of them,
    /// even if the returned future is dropped.
    async fn blocking_pop_to_set(
        &self,
        list: &str,
        set: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError>;

    /// Whole list, head first.
    async fn list_range(&self, list: &str) -> Result<Vec<String>, BrokerError>;

    /// Remove every occurrence of `value`. Returns how many were removed.
    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, BrokerError>;

    /// Atomically append all of `from` onto `to` and empty `from`.
    async fn move_list(&self, from: &str, to: &str) -> Result<usize, BrokerError>;

    // ── Sets ────────────────────────────────────────────────────────

    async fn set_add(&self, set: &str, value: &str) -> Result<(), BrokerError>;

    /// Returns whether the value was present.
    async fn set_remove(&self, set: &str, value: &str) -> Result<bool, BrokerError>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>, BrokerError>;

    // ── Keys ────────────────────────────────────────────────────────

    async fn set_value(&self, key: &str, value: &str) -> Result<(), BrokerError>;

    async fn get_value(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Delete a key of any type.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// All existing keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    // ── Pub/sub ─────────────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}
