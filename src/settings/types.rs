//! Throttle settings snapshot.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::ThrottleRule;
use crate::users::UserId;

/// Protected paths used when none are configured.
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    "/users/password",
    "/users/sign_in",
    "/api/v3/session.json",
    "/api/v3/session",
    "/api/v4/session.json",
    "/api/v4/session",
    "/users",
    "/users/confirmation",
    "/unsubscribes/",
    "/import/github/personal_access_token",
    "/admin/session",
];

/// Limit and period of a single throttle bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Whether the bucket is evaluated at all
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of requests per period
    pub requests_per_period: u64,
    /// Period length in seconds
    pub period_in_seconds: u64,
}

impl BucketSettings {
    /// A disabled bucket with the given limit and period.
    pub const fn disabled(requests_per_period: u64, period_in_seconds: u64) -> Self {
        Self {
            enabled: false,
            requests_per_period,
            period_in_seconds,
        }
    }

    /// The period as a duration.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_in_seconds)
    }

    fn general() -> Self {
        Self::disabled(3600, 3600)
    }

    fn protected() -> Self {
        Self::disabled(10, 60)
    }
}

/// Ban-after-failures settings for Git HTTP basic authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allow2BanSettings {
    /// Whether failures are counted and bans enforced
    #[serde(default)]
    pub enabled: bool,
    /// Addresses that are never banned
    #[serde(default = "default_ip_allowlist")]
    pub ip_allowlist: Vec<String>,
    /// Failures tolerated within `findtime` before a ban
    #[serde(default = "default_maxretry")]
    pub maxretry: u64,
    /// Failure counting window in seconds
    #[serde(default = "default_findtime")]
    pub findtime: u64,
    /// Ban duration in seconds
    #[serde(default = "default_bantime")]
    pub bantime: u64,
}

impl Default for Allow2BanSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_allowlist: default_ip_allowlist(),
            maxretry: default_maxretry(),
            findtime: default_findtime(),
            bantime: default_bantime(),
        }
    }
}

fn default_ip_allowlist() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_maxretry() -> u64 {
    10
}

fn default_findtime() -> u64 {
    60
}

fn default_bantime() -> u64 {
    3600
}

/// Every knob the request guard reads, as one snapshot.
///
/// A fresh snapshot is taken for every request so that operators can
/// change limits without restarting the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    #[serde(default = "BucketSettings::general")]
    pub throttle_unauthenticated: BucketSettings,
    #[serde(default = "BucketSettings::general")]
    pub throttle_authenticated_api: BucketSettings,
    #[serde(default = "BucketSettings::general")]
    pub throttle_authenticated_web: BucketSettings,
    #[serde(default = "BucketSettings::protected")]
    pub throttle_unauthenticated_protected_paths: BucketSettings,
    #[serde(default = "BucketSettings::protected")]
    pub throttle_authenticated_protected_paths_api: BucketSettings,
    #[serde(default = "BucketSettings::protected")]
    pub throttle_authenticated_protected_paths_web: BucketSettings,

    /// Ordered path prefixes that get the protected-path throttles
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Path prefixes that bypass all throttling
    #[serde(default)]
    pub safelist_paths: Vec<String>,

    /// Header that marks a request as trusted when its value is `1`
    #[serde(default)]
    pub bypass_header: Option<String>,

    /// Throttles that only track, `*` for all of them
    #[serde(default)]
    pub dry_run: Vec<String>,

    /// Users exempt from the authenticated throttles
    #[serde(default)]
    pub user_allowlist: Vec<UserId>,

    #[serde(default)]
    pub git_basic_auth: Allow2BanSettings,
}

fn default_protected_paths() -> Vec<String> {
    DEFAULT_PROTECTED_PATHS.iter().map(|p| p.to_string()).collect()
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            throttle_unauthenticated: BucketSettings::general(),
            throttle_authenticated_api: BucketSettings::general(),
            throttle_authenticated_web: BucketSettings::general(),
            throttle_unauthenticated_protected_paths: BucketSettings::protected(),
            throttle_authenticated_protected_paths_api: BucketSettings::protected(),
            throttle_authenticated_protected_paths_web: BucketSettings::protected(),
            protected_paths: default_protected_paths(),
            safelist_paths: Vec::new(),
            bypass_header: None,
            dry_run: Vec::new(),
            user_allowlist: Vec::new(),
            git_basic_auth: Allow2BanSettings::default(),
        }
    }
}

impl ThrottleSettings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle settings");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: ThrottleSettings = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse throttle settings: {}", e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings of one bucket.
    pub fn bucket(&self, rule: ThrottleRule) -> &BucketSettings {
        match rule {
            ThrottleRule::Unauthenticated => &self.throttle_unauthenticated,
            ThrottleRule::AuthenticatedApi => &self.throttle_authenticated_api,
            ThrottleRule::AuthenticatedWeb => &self.throttle_authenticated_web,
            ThrottleRule::UnauthenticatedProtectedPaths => {
                &self.throttle_unauthenticated_protected_paths
            }
            ThrottleRule::AuthenticatedProtectedPathsApi => {
                &self.throttle_authenticated_protected_paths_api
            }
            ThrottleRule::AuthenticatedProtectedPathsWeb => {
                &self.throttle_authenticated_protected_paths_web
            }
        }
    }

    /// Mutable settings of one bucket.
    pub fn bucket_mut(&mut self, rule: ThrottleRule) -> &mut BucketSettings {
        match rule {
            ThrottleRule::Unauthenticated => &mut self.throttle_unauthenticated,
            ThrottleRule::AuthenticatedApi => &mut self.throttle_authenticated_api,
            ThrottleRule::AuthenticatedWeb => &mut self.throttle_authenticated_web,
            ThrottleRule::UnauthenticatedProtectedPaths => {
                &mut self.throttle_unauthenticated_protected_paths
            }
            ThrottleRule::AuthenticatedProtectedPathsApi => {
                &mut self.throttle_authenticated_protected_paths_api
            }
            ThrottleRule::AuthenticatedProtectedPathsWeb => {
                &mut self.throttle_authenticated_protected_paths_web
            }
        }
    }

    /// Whether a throttle only tracks instead of rejecting.
    pub fn is_dry_run(&self, rule: ThrottleRule) -> bool {
        self.dry_run
            .iter()
            .any(|name| name == "*" || name == rule.name())
    }

    /// Whether a user skips the authenticated throttles.
    pub fn is_allowlisted(&self, user_id: UserId) -> bool {
        self.user_allowlist.contains(&user_id)
    }

    /// Reject settings the engine cannot apply.
    pub fn validate(&self) -> Result<()> {
        for rule in ThrottleRule::ALL {
            let bucket = self.bucket(rule);
            if bucket.enabled && bucket.period_in_seconds == 0 {
                return Err(TurnstileError::Config(format!(
                    "{} has a zero period",
                    rule.name()
                )));
            }
        }

        if let Some(path) = self.protected_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(TurnstileError::Config(format!(
                "protected path must start with '/': {}",
                path
            )));
        }

        let ban = &self.git_basic_auth;
        if ban.enabled && (ban.maxretry == 0 || ban.findtime == 0 || ban.bantime == 0) {
            return Err(TurnstileError::Config(
                "git_basic_auth maxretry, findtime and bantime must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
