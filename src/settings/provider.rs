//! Settings providers.
//!
//! Settings resolve in a fixed order: environment override, then the live
//! dynamic settings, then the static defaults baked into [`ThrottleSettings`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::types::ThrottleSettings;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::ThrottleRule;
use crate::users::UserId;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "TURNSTILE_THROTTLE_";

/// Source of the current throttle settings.
///
/// Implementations must return the live values on every call.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Take a snapshot of the current settings.
    async fn current(&self) -> Result<ThrottleSettings>;
}

/// Writable in-process settings, changed through the admin surface.
#[derive(Debug, Default)]
pub struct InMemorySettings {
    inner: RwLock<ThrottleSettings>,
}

impl InMemorySettings {
    /// Create a provider holding the given settings.
    pub fn new(settings: ThrottleSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the settings after validating them.
    pub fn replace(&self, settings: ThrottleSettings) -> Result<()> {
        settings.validate()?;
        *self.inner.write() = settings;
        info!("Throttle settings replaced");
        Ok(())
    }

    /// Apply an in-place change and validate the result.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ThrottleSettings),
    {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        change(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> ThrottleSettings {
        self.inner.read().clone()
    }
}

#[async_trait]
impl SettingsProvider for InMemorySettings {
    async fn current(&self) -> Result<ThrottleSettings> {
        Ok(self.snapshot())
    }
}

/// Override for one bucket, every field optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketOverride {
    pub enabled: Option<bool>,
    pub requests_per_period: Option<u64>,
    pub period_in_seconds: Option<u64>,
}

/// Overrides captured from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    buckets: HashMap<ThrottleRule, BucketOverride>,
    dry_run: Option<Vec<String>>,
    user_allowlist: Option<Vec<UserId>>,
    bypass_header: Option<String>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read overrides from `(name, value)` pairs.
    ///
    /// Recognized names, with `<BUCKET>` being a rule name without the
    /// `throttle_` prefix in upper case:
    /// `TURNSTILE_THROTTLE_<BUCKET>_ENABLED`, `..._LIMIT`, `..._PERIOD`,
    /// `TURNSTILE_THROTTLE_DRY_RUN`, `TURNSTILE_THROTTLE_USER_ALLOWLIST`,
    /// `TURNSTILE_THROTTLE_BYPASS_HEADER`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut overrides = Self::default();

        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();

            match key {
                "DRY_RUN" => overrides.dry_run = Some(split_list(value)),
                "USER_ALLOWLIST" => {
                    let ids = split_list(value)
                        .iter()
                        .map(|id| parse_number(name.as_ref(), id).map(UserId))
                        .collect::<Result<Vec<_>>>()?;
                    overrides.user_allowlist = Some(ids);
                }
                "BYPASS_HEADER" => {
                    overrides.bypass_header =
                        (!value.is_empty()).then(|| value.to_ascii_lowercase());
                }
                _ => overrides.apply_bucket_var(name.as_ref(), key, value)?,
            }
        }

        Ok(overrides)
    }

    fn apply_bucket_var(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        for rule in ThrottleRule::ALL {
            let Some(field) = key
                .strip_prefix(rule.env_key().as_str())
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                continue;
            };

            // Longer bucket names share prefixes, so only an exact field counts.
            let entry = match field {
                "ENABLED" | "LIMIT" | "PERIOD" => self.buckets.entry(rule).or_default(),
                _ => continue,
            };
            match field {
                "ENABLED" => entry.enabled = Some(parse_bool(name, value)?),
                "LIMIT" => entry.requests_per_period = Some(parse_number(name, value)?),
                _ => entry.period_in_seconds = Some(parse_number(name, value)?),
            }
            debug!(variable = name, "Applied settings override");
            return Ok(());
        }
        Ok(())
    }

    /// Whether no override is set.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
            && self.dry_run.is_none()
            && self.user_allowlist.is_none()
            && self.bypass_header.is_none()
    }

    /// Apply the overrides on top of a dynamic snapshot.
    pub fn apply(&self, settings: &mut ThrottleSettings) {
        for (rule, over) in &self.buckets {
            let bucket = settings.bucket_mut(*rule);
            if let Some(enabled) = over.enabled {
                bucket.enabled = enabled;
            }
            if let Some(limit) = over.requests_per_period {
                bucket.requests_per_period = limit;
            }
            if let Some(period) = over.period_in_seconds {
                bucket.period_in_seconds = period;
            }
        }
        if let Some(dry_run) = &self.dry_run {
            settings.dry_run = dry_run.clone();
        }
        if let Some(allowlist) = &self.user_allowlist {
            settings.user_allowlist = allowlist.clone();
        }
        if let Some(header) = &self.bypass_header {
            settings.bypass_header = Some(header.clone());
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TurnstileError::Config(format!(
            "{} must be a boolean, got {:?}",
            name, value
        ))),
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        TurnstileError::Config(format!("{} must be a number, got {:?}", name, value))
    })
}

/// Dynamic settings with environment overrides layered on top.
pub struct LayeredSettings {
    dynamic: Arc<dyn SettingsProvider>,
    overrides: EnvOverrides,
}

impl LayeredSettings {
    /// Layer `overrides` over a dynamic provider.
    pub fn new(dynamic: Arc<dyn SettingsProvider>, overrides: EnvOverrides) -> Self {
        Self { dynamic, overrides }
    }
}

#[async_trait]
impl SettingsProvider for LayeredSettings {
    async fn current(&self) -> Result<ThrottleSettings> {
        let mut settings = self
            .dynamic
            .current()
            .await
            .map_err(|e| TurnstileError::ConfigUnavailable(e.to_string()))?;
        self.overrides.apply(&mut settings);
        Ok(settings)
    }
}
