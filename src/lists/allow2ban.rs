//! Ban-after-failures blocklist.
//!
//! Failed attempts are counted per address in fixed `findtime` windows. Once
//! an address reaches `maxretry` failures it is banned for `bantime` and
//! every request from it is rejected, valid credentials or not.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{epoch_secs, CounterKey, CounterStore, FixedWindow};
use crate::settings::Allow2BanSettings;

/// Name of the Git HTTP basic auth blocklist.
pub const GIT_BASIC_AUTH_RULE: &str = "git_basic_auth";

/// Allow2Ban filter over a counter store.
pub struct Allow2Ban {
    name: &'static str,
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl Allow2Ban {
    /// Create the filter named `name`.
    pub fn new(name: &'static str, store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self {
            name,
            store,
            timeout,
        }
    }

    /// The blocklist name reported in audit events.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn ban_key(&self, ip: &IpAddr) -> String {
        format!("allow2ban:ban:{}:{}", self.name, ip)
    }

    fn count_key(&self, ip: &IpAddr, settings: &Allow2BanSettings, now: u64) -> String {
        let window = FixedWindow::at(now, settings.findtime);
        CounterKey::allow2ban(self.name, &ip.to_string(), window.id).to_store_key()
    }

    fn applies_to(&self, ip: &IpAddr, settings: &Allow2BanSettings) -> bool {
        settings.enabled && !settings.ip_allowlist.iter().any(|a| a == &ip.to_string())
    }

    /// Whether `ip` is currently banned.
    ///
    /// Errors are returned to the caller, which decides how to fail.
    pub async fn is_banned(&self, ip: &IpAddr, settings: &Allow2BanSettings) -> Result<bool> {
        if !self.applies_to(ip, settings) {
            return Ok(false);
        }

        let banned = self.bounded(self.store.get(&self.ban_key(ip))).await?;
        Ok(banned.is_some())
    }

    /// Count a failed attempt; returns whether `ip` is now banned.
    pub async fn register_failure(&self, ip: &IpAddr, settings: &Allow2BanSettings) -> Result<bool> {
        self.register_failure_at(ip, settings, epoch_secs()).await
    }

    /// Count a failed attempt as of `now` (epoch seconds).
    pub async fn register_failure_at(
        &self,
        ip: &IpAddr,
        settings: &Allow2BanSettings,
        now: u64,
    ) -> Result<bool> {
        if !self.applies_to(ip, settings) {
            return Ok(false);
        }

        let window = FixedWindow::at(now, settings.findtime);
        let key = self.count_key(ip, settings, now);
        let failures = self
            .bounded(self.store.increment(&key, window.ttl(now)))
            .await?;

        if failures < settings.maxretry {
            return Ok(false);
        }

        self.bounded(self.store.set_with_ttl(
            &self.ban_key(ip),
            1,
            Duration::from_secs(settings.bantime),
        ))
        .await?;

        info!(
            blocklist = self.name,
            remote_ip = %ip,
            failures,
            bantime = settings.bantime,
            "Address banned"
        );
        Ok(true)
    }

    /// Forget the failures of `ip` after a successful authentication.
    pub async fn reset(&self, ip: &IpAddr, settings: &Allow2BanSettings) -> Result<()> {
        if !self.applies_to(ip, settings) {
            return Ok(());
        }

        let key = self.count_key(ip, settings, epoch_secs());
        self.bounded(self.store.delete(&key)).await
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, call).await.map_err(|_| {
            warn!(blocklist = self.name, "Counter store timed out");
            TurnstileError::StoreUnavailable(format!(
                "{} store call timed out after {:?}",
                self.name, self.timeout
            ))
        })?
    }
}
