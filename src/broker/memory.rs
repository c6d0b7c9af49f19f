//! In-memory broker for single-process deployments and tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::trace;

use super::traits::{Broker, Subscription};
use crate::error::BrokerError;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    values: HashMap<String, String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl State {
    fn pop_front(&mut self, list: &str) -> Option<String> {
        let items = self.lists.get_mut(list)?;
        let value = items.pop_front();
        if items.is_empty() {
            self.lists.remove(list);
        }
        value
    }
}

/// Broker held entirely in process memory. Blocking pops wake on any push.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for `try_take` to yield, up to `timeout`.
    async fn wait_for<F>(&self, timeout: Duration, mut try_take: F) -> Option<String>
    where
        F: FnMut(&mut State) -> Option<String>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = {
                let mut state = self.state();
                try_take(&mut *state)
            };
            if taken.is_some() {
                return taken;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, list: &str, value: &str) -> Result<(), BrokerError> {
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        Ok(self.wait_for(timeout, |state| state.pop_front(list)).await)
    }

    async fn blocking_pop_to_set(
        &self,
        list: &str,
        set: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let popped = self
            .wait_for(timeout, |state| {
                let value = state.pop_front(list)?;
                state
                    .sets
                    .entry(set.to_string())
                    .or_default()
                    .insert(value.clone());
                Some(value)
            })
            .await;
        Ok(popped)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .state()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, BrokerError> {
        let mut state = self.state();
        let Some(items) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|item| item != value);
        let removed = before - items.len();
        if items.is_empty() {
            state.lists.remove(list);
        }
        Ok(removed)
    }

    async fn move_list(&self, from: &str, to: &str) -> Result<usize, BrokerError> {
        let mut state = self.state();
        let Some(items) = state.lists.remove(from) else {
            return Ok(0);
        };
        let moved = items.len();
        state.lists.entry(to.to_string()).or_default().extend(items);
        drop(state);
        self.pushed.notify_waiters();
        Ok(moved)
    }

    async fn set_add(&self, set: &str, value: &str) -> Result<(), BrokerError> {
        self.state()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    async fn set_remove(&self, set: &str, value: &str) -> Result<bool, BrokerError> {
        let mut state = self.state();
        let Some(members) = state.sets.get_mut(set) else {
            return Ok(false);
        };
        let removed = members.remove(value);
        if members.is_empty() {
            state.sets.remove(set);
        }
        Ok(removed)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .state()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        self.state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.state().values.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.lists.remove(key);
        state.sets.remove(key);
        state.values.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state();
        let mut keys: Vec<String> = state
            .lists
            .keys()
            .chain(state.sets.keys())
            .chain(state.values.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if let Some(senders) = state.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
            trace!(channel, receivers = senders.len(), "Published");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }
}
