//! Redis-backed broker.
//!
//! Ordinary commands share one multiplexed connection. Blocking pops borrow
//! a dedicated connection from a small idle pool so a long BLPOP never
//! stalls the shared pipeline.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::traits::{Broker, Subscription};
use crate::error::BrokerError;

/// Append every element of KEYS[1] to KEYS[2], then delete KEYS[1].
const MOVE_LIST_SCRIPT: &str = r"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for _, item in ipairs(items) do
    redis.call('RPUSH', KEYS[2], item)
end
redis.call('DEL', KEYS[1])
return #items
";

/// Pop the head of KEYS[1] and add it to the set KEYS[2] in one step.
const POP_TO_SET_SCRIPT: &str = r"
local item = redis.call('LPOP', KEYS[1])
if item then
    redis.call('SADD', KEYS[2], item)
end
return item
";

static MOVE_LIST: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(MOVE_LIST_SCRIPT));
static POP_TO_SET: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(POP_TO_SET_SCRIPT));

/// How often an empty list is retried while waiting in `blocking_pop_to_set`.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 16;

fn poll_delay(remaining: Duration) -> Duration {
    remaining.min(POP_POLL_INTERVAL)
}

/// Broker backed by a Redis server.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    endpoint: String,
}

impl RedisBroker {
    /// Connect to `host:port` or a full `redis://` URL.
    pub async fn connect(endpoint: &str) -> Result<Self, BrokerError> {
        let url = if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
            endpoint.to_string()
        } else {
            format!("redis://{endpoint}")
        };
        let client =
            redis::Client::open(url.as_str()).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(endpoint = %url, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            endpoint: endpoint.to_string(),
        })
    }

    /// The endpoint this broker was connected with.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!(endpoint = %self.endpoint, "Opening blocking connection");
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    async fn pop_with_timeout(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        if timeout.is_zero() {
            // BLPOP with 0 would block forever.
            let value: Option<String> = self.conn().lpop(list, None).await?;
            return Ok(value);
        }
        // A connection whose BLPOP was cancelled is dropped, never reused.
        let mut conn = self.checkout_blocking().await?;
        let popped: Option<(String, String)> = conn.blpop(list, timeout.as_secs_f64()).await?;
        self.checkin_blocking(conn).await;
        Ok(popped.map(|(_, value)| value))
    }

    async fn try_pop_to_set(&self, list: &str, set: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        let value: Option<String> = POP_TO_SET.key(list).key(set).invoke_async(&mut conn).await?;
        Ok(value)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, list: &str, value: &str) -> Result<(), BrokerError> {
        let _: i64 = self.conn().rpush(list, value).await?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        self.pop_with_timeout(list, timeout).await
    }

    async fn blocking_pop_to_set(
        &self,
        list: &str,
        set: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop_to_set(list, set).await? {
                return Ok(Some(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(poll_delay(remaining)).await;
        }
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, BrokerError> {
        let items: Vec<String> = self.conn().lrange(list, 0, -1).await?;
        Ok(items)
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, BrokerError> {
        let removed: usize = self.conn().lrem(list, 0, value).await?;
        Ok(removed)
    }

    async fn move_list(&self, from: &str, to: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn();
        let moved: usize = MOVE_LIST
            .key(from)
            .key(to)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn set_add(&self, set: &str, value: &str) -> Result<(), BrokerError> {
        let _: i64 = self.conn().sadd(set, value).await?;
        Ok(())
    }

    async fn set_remove(&self, set: &str, value: &str) -> Result<bool, BrokerError> {
        let removed: i64 = self.conn().srem(set, value).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, BrokerError> {
        let members: Vec<String> = self.conn().smembers(set).await?;
        Ok(members)
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let _: i64 = self.conn().del(key).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut keys: Vec<String> = self.conn().keys(format!("{prefix}*")).await?;
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let _: i64 = self.conn().publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            tokio::pin!(messages);
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %name, error = %e, "Dropping undecodable payload"),
                }
            }
            debug!(channel = %name, "Subscription stream ended");
        });

        Ok(Subscription::new(channel, rx).with_forwarder(forwarder))
    }
}
