//! Fixed windows and the process-local counter store.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use super::backend::CounterStore;
use crate::error::Result;

/// Current time in whole seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A fixed time window of `period` seconds.
///
/// Windows are aligned to the epoch, so every process agrees on where a
/// window starts and ends without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedWindow {
    /// Window length in seconds
    pub period: u64,
    /// `floor(now / period)`
    pub id: u64,
}

impl FixedWindow {
    /// The window containing `now` (epoch seconds). `period` must be positive.
    pub fn at(now: u64, period: u64) -> Self {
        let period = period.max(1);
        Self {
            period,
            id: now / period,
        }
    }

    /// Epoch second the window starts at.
    pub fn start(&self) -> u64 {
        self.id * self.period
    }

    /// Epoch second the next window starts at.
    pub fn end(&self) -> u64 {
        self.start() + self.period
    }

    /// Seconds from `now` until the window rolls over.
    pub fn reset_in(&self, now: u64) -> u64 {
        self.end().saturating_sub(now)
    }

    /// Expiry to give a counter created at `now`.
    ///
    /// One second past the window end, so a counter never disappears while
    /// its window is still current.
    pub fn ttl(&self, now: u64) -> Duration {
        Duration::from_secs(self.reset_in(now) + 1)
    }
}

struct Entry {
    count: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A counter store that lives in this process only.
///
/// Counts are not shared between processes, so this store under-counts in
/// any deployment with more than one worker. Use it for tests and local
/// development.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Entry>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: now + ttl,
        });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count))
    }

    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                count: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
