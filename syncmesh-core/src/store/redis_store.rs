//! Redis-backed shared store

use std::time::Duration;

use futures::StreamExt;
use redis::{aio::MultiplexedConnection, Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{SharedStore, StoreConfig, Subscription};
use crate::error::{Result, SyncError};

const SCAN_BATCH: usize = 200;

/// Extend the TTL only while the key still holds ARGV[1]
const EXPIRE_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete only while the key still holds ARGV[1]
const DEL_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Shared store on a Redis server
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    config: StoreConfig,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| SyncError::ConnectionFailed {
            endpoint: config.url.clone(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SyncError::ConnectionFailed {
                endpoint: config.url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            connection,
            config: config.clone(),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<Option<String>>(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok(updated == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = Script::new(EXPIRE_IF_EQ)
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(updated == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut self.conn())
            .await?;
        Ok(values)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        // -2: missing, -1: no expiry
        let remaining = redis::cmd("PTTL")
            .arg(key)
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let removed: i64 = Script::new(DEL_IF_EQ)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut self.conn())
            .await?;
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| SyncError::ConnectionFailed {
                endpoint: self.config.url.clone(),
                reason: e.to_string(),
            })?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer.max(1));
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping undecodable message on {}: {}", name, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!("Subscription to {} ended", name);
        });

        Ok(Subscription::new(channel, rx, forwarder))
    }
}
