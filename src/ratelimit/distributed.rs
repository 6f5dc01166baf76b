//! Shared counter store backed by Redis.
//!
//! Every process and machine serving traffic increments the same keys, so
//! limits hold across the whole deployment.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::backend::CounterStore;
use crate::error::Result;

/// Increment a key and give it an expiry the first time it is seen.
///
/// Runs as one script so that the INCR and the PEXPIRE cannot be split by a
/// crash, which would leave a counter that never expires.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl_ms = tonumber(ARGV[1])

local count = redis.call('INCR', key)
if redis.call('PTTL', key) < 0 then
  redis.call('PEXPIRE', key, ttl_ms)
end

return count
"#;

/// Redis implementation of the counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis at `url`; every key is prefixed with `key_prefix`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let key_prefix = key_prefix.into();

        info!(prefix = %key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            key_prefix,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}:{key}", self.key_prefix)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let redis_key = self.key_for(key);
        let mut connection = self.connection.clone();

        let count: u64 = self
            .script
            .key(&redis_key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;

        debug!(key = %redis_key, count, "Incremented shared counter");
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut connection = self.connection.clone();
        let value = redis::cmd("GET")
            .arg(self.key_for(key))
            .query_async::<Option<u64>>(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(self.key_for(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(self.key_for(key))
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }
}
