//! Counter store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for counter store implementations.
///
/// This trait abstracts over the shared `RedisCounterStore` and the
/// process-local `MemoryCounterStore`. Only the shared store gives correct
/// counts when several processes or machines serve the same traffic.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new count.
    ///
    /// A key that did not exist starts at zero and expires after `ttl`.
    /// Later increments leave the expiry untouched.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Read a value without changing it.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration) -> Result<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;
}
