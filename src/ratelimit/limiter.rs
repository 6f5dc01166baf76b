//! Core throttle engine.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::counter::{epoch_secs, FixedWindow};
use super::descriptor::CounterKey;
use super::rules::{Discriminator, ThrottleRule};
use crate::error::TurnstileError;
use crate::settings::{BucketSettings, SettingsProvider};

/// Default upper bound for one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Details of a tripped throttle, used for response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottledInfo {
    /// The bucket that tripped
    pub rule: ThrottleRule,
    /// The counter partition
    pub discriminator: String,
    /// Requests allowed per period
    pub limit: u64,
    /// Requests seen in this window, including this one
    pub observed: u64,
    /// Period length in seconds
    pub period: u64,
    /// Seconds until the window rolls over
    pub reset_in: u64,
    /// Epoch second the window rolls over
    pub reset_at: u64,
}

impl ThrottledInfo {
    /// Requests left in the window, never negative.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.observed)
    }
}

/// Result of one throttle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// Within the limit, disabled, or the store could not be reached
    Allowed,
    /// Over the limit for the current window
    Throttled(ThrottledInfo),
}

impl ThrottleOutcome {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleOutcome::Allowed)
    }
}

/// Fixed-window throttle over a shared counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct ThrottleEngine {
    /// Counter storage shared by every worker
    store: Arc<dyn CounterStore>,
    /// Upper bound for a single store call
    store_timeout: Duration,
}

impl ThrottleEngine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every store call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Check and count a request against `rule`, reading the rule's
    /// settings from `settings` on every call.
    ///
    /// When the settings cannot be read the rule is treated as disabled.
    pub async fn check_and_increment(
        &self,
        settings: &dyn SettingsProvider,
        rule: ThrottleRule,
        discriminator: &Discriminator,
    ) -> ThrottleOutcome {
        let snapshot = match settings.current().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(rule = %rule, error = %e, "Settings unavailable, throttle disabled");
                return ThrottleOutcome::Allowed;
            }
        };

        self.check(rule, discriminator, snapshot.bucket(rule), epoch_secs())
            .await
    }

    /// Check and count a request against `rule` with already-read settings,
    /// as of `now` (epoch seconds).
    ///
    /// A disabled bucket is not counted. A store failure or timeout allows
    /// the request: a broken limiter must not take the application down.
    pub async fn check(
        &self,
        rule: ThrottleRule,
        discriminator: &Discriminator,
        bucket: &BucketSettings,
        now: u64,
    ) -> ThrottleOutcome {
        if !bucket.enabled {
            return ThrottleOutcome::Allowed;
        }
        if bucket.period_in_seconds == 0 {
            warn!(rule = %rule, "Throttle has a zero period, skipping");
            return ThrottleOutcome::Allowed;
        }

        let window = FixedWindow::at(now, bucket.period_in_seconds);
        let key = CounterKey::throttle(rule.name(), &discriminator.key(), window.id);

        trace!(key = %key, limit = bucket.requests_per_period, "Checking throttle");

        let observed = match self.increment(&key, window.ttl(now)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(rule = %rule, key = %key, error = %e, "Counter store unavailable, allowing request");
                return ThrottleOutcome::Allowed;
            }
        };

        if observed <= bucket.requests_per_period {
            return ThrottleOutcome::Allowed;
        }

        debug!(
            rule = %rule,
            discriminator = %discriminator,
            observed,
            limit = bucket.requests_per_period,
            "Throttle limit exceeded"
        );

        ThrottleOutcome::Throttled(ThrottledInfo {
            rule,
            discriminator: discriminator.key(),
            limit: bucket.requests_per_period,
            observed,
            period: window.period,
            reset_in: window.reset_in(now),
            reset_at: window.end(),
        })
    }

    async fn increment(&self, key: &CounterKey, ttl: Duration) -> crate::error::Result<u64> {
        let store_key = key.to_store_key();
        tokio::time::timeout(self.store_timeout, self.store.increment(&store_key, ttl))
            .await
            .map_err(|_| {
                TurnstileError::StoreUnavailable(format!(
                    "increment timed out after {:?}",
                    self.store_timeout
                ))
            })?
    }
}
