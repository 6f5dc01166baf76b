//! The static throttle buckets.
//!
//! Which buckets exist is fixed at compile time. Whether each one is enabled,
//! and with which limit and period, comes from the live settings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classify::{AuthScope, Classified};
use crate::error::TurnstileError;
use crate::settings::ThrottleSettings;

/// A named throttle bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThrottleRule {
    /// Anonymous traffic, keyed by IP
    #[serde(rename = "throttle_unauthenticated")]
    Unauthenticated,
    /// Authenticated API traffic, keyed by user
    #[serde(rename = "throttle_authenticated_api")]
    AuthenticatedApi,
    /// Authenticated web traffic, keyed by user
    #[serde(rename = "throttle_authenticated_web")]
    AuthenticatedWeb,
    /// Anonymous POSTs to protected paths, keyed by IP
    #[serde(rename = "throttle_unauthenticated_protected_paths")]
    UnauthenticatedProtectedPaths,
    /// Authenticated API POSTs to protected paths, keyed by user
    #[serde(rename = "throttle_authenticated_protected_paths_api")]
    AuthenticatedProtectedPathsApi,
    /// Authenticated web POSTs to protected paths, keyed by user
    #[serde(rename = "throttle_authenticated_protected_paths_web")]
    AuthenticatedProtectedPathsWeb,
}

/// What a bucket partitions its counters by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminator {
    /// Requester address
    Ip(String),
    /// Authenticated user
    User(crate::users::UserId),
}

impl Discriminator {
    /// The value used in counter keys.
    pub fn key(&self) -> String {
        match self {
            Discriminator::Ip(ip) => ip.clone(),
            Discriminator::User(id) => format!("user:{}", id),
        }
    }

    /// The user behind this discriminator, if any.
    pub fn user_id(&self) -> Option<crate::users::UserId> {
        match self {
            Discriminator::Ip(_) => None,
            Discriminator::User(id) => Some(*id),
        }
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl ThrottleRule {
    /// Every bucket, in evaluation order.
    pub const ALL: [ThrottleRule; 6] = [
        ThrottleRule::Unauthenticated,
        ThrottleRule::AuthenticatedApi,
        ThrottleRule::AuthenticatedWeb,
        ThrottleRule::UnauthenticatedProtectedPaths,
        ThrottleRule::AuthenticatedProtectedPathsApi,
        ThrottleRule::AuthenticatedProtectedPathsWeb,
    ];

    /// The bucket name used in settings, keys, logs and headers.
    pub fn name(&self) -> &'static str {
        match self {
            ThrottleRule::Unauthenticated => "throttle_unauthenticated",
            ThrottleRule::AuthenticatedApi => "throttle_authenticated_api",
            ThrottleRule::AuthenticatedWeb => "throttle_authenticated_web",
            ThrottleRule::UnauthenticatedProtectedPaths => {
                "throttle_unauthenticated_protected_paths"
            }
            ThrottleRule::AuthenticatedProtectedPathsApi => {
                "throttle_authenticated_protected_paths_api"
            }
            ThrottleRule::AuthenticatedProtectedPathsWeb => {
                "throttle_authenticated_protected_paths_web"
            }
        }
    }

    /// Upper-case name fragment used by environment overrides.
    pub fn env_key(&self) -> String {
        self.name()
            .trim_start_matches("throttle_")
            .to_ascii_uppercase()
    }

    /// Whether this bucket is keyed by an authenticated user.
    pub fn is_authenticated(&self) -> bool {
        !matches!(
            self,
            ThrottleRule::Unauthenticated | ThrottleRule::UnauthenticatedProtectedPaths
        )
    }

    /// Whether this bucket only applies to protected-path POSTs.
    pub fn is_protected_paths(&self) -> bool {
        matches!(
            self,
            ThrottleRule::UnauthenticatedProtectedPaths
                | ThrottleRule::AuthenticatedProtectedPathsApi
                | ThrottleRule::AuthenticatedProtectedPathsWeb
        )
    }

    /// The counter partition for a request, or `None` when the bucket does
    /// not apply to it.
    ///
    /// Identity is only resolved when the path shape already matches.
    pub async fn discriminator(
        &self,
        request: &Classified<'_>,
        settings: &ThrottleSettings,
    ) -> Option<Discriminator> {
        if self.is_protected_paths() && !(request.is_post && request.protected_path_match) {
            return None;
        }

        let scope = match self {
            ThrottleRule::Unauthenticated | ThrottleRule::UnauthenticatedProtectedPaths => {
                if request.is_exempt_from_unauthenticated() || !request.unauthenticated().await {
                    return None;
                }
                return Some(Discriminator::Ip(request.request().remote_ip.to_string()));
            }
            ThrottleRule::AuthenticatedApi | ThrottleRule::AuthenticatedProtectedPathsApi => {
                if !request.is_api_request {
                    return None;
                }
                AuthScope::Api
            }
            ThrottleRule::AuthenticatedWeb | ThrottleRule::AuthenticatedProtectedPathsWeb => {
                if !request.is_web_request() {
                    return None;
                }
                AuthScope::Web
            }
        };

        let user_id = request.user_id(scope).await?;
        if settings.is_allowlisted(user_id) {
            return None;
        }
        Some(Discriminator::User(user_id))
    }
}

impl fmt::Display for ThrottleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ThrottleRule {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThrottleRule::ALL
            .into_iter()
            .find(|rule| rule.name() == s)
            .ok_or_else(|| TurnstileError::Config(format!("Unknown throttle: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classifier, RequestDescriptor};
    use crate::users::{InMemoryUserDirectory, UserEntry, UserId};
    use std::net::IpAddr;
    use std::sync::Arc;

    fn classifier() -> Classifier {
        let users = InMemoryUserDirectory::from_entries(&[UserEntry {
            id: 5,
            username: "carol".to_string(),
            api_tokens: vec!["api-carol".to_string()],
            feed_token: None,
            sessions: vec!["web-carol".to_string()],
        }]);
        Classifier::new(Arc::new(users)).unwrap()
    }

    fn ip() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    async fn applicable(request: &RequestDescriptor, settings: &ThrottleSettings) -> Vec<ThrottleRule> {
        let classifier = classifier();
        let classified = classifier.begin(request, settings);
        let mut rules = Vec::new();
        for rule in ThrottleRule::ALL {
            if rule.discriminator(&classified, settings).await.is_some() {
                rules.push(rule);
            }
        }
        rules
    }

    #[test]
    fn test_names_round_trip() {
        for rule in ThrottleRule::ALL {
            assert_eq!(rule.name().parse::<ThrottleRule>().unwrap(), rule);
        }
        assert!("throttle_everything".parse::<ThrottleRule>().is_err());
    }

    #[test]
    fn test_env_key() {
        assert_eq!(ThrottleRule::AuthenticatedApi.env_key(), "AUTHENTICATED_API");
        assert_eq!(
            ThrottleRule::UnauthenticatedProtectedPaths.env_key(),
            "UNAUTHENTICATED_PROTECTED_PATHS"
        );
    }

    #[tokio::test]
    async fn test_anonymous_login_post() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("POST", "/users/sign_in", ip());

        assert_eq!(
            applicable(&request, &settings).await,
            vec![
                ThrottleRule::Unauthenticated,
                ThrottleRule::UnauthenticatedProtectedPaths
            ]
        );
    }

    #[tokio::test]
    async fn test_protected_path_needs_post() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("GET", "/users/sign_in", ip());

        assert_eq!(
            applicable(&request, &settings).await,
            vec![ThrottleRule::Unauthenticated]
        );
    }

    #[tokio::test]
    async fn test_authenticated_api_post_to_protected_path() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("POST", "/api/v4/session", ip())
            .with_header("PRIVATE-TOKEN", "api-carol");

        assert_eq!(
            applicable(&request, &settings).await,
            vec![
                ThrottleRule::AuthenticatedApi,
                ThrottleRule::AuthenticatedProtectedPathsApi
            ]
        );
    }

    #[tokio::test]
    async fn test_authenticated_web_request() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("GET", "/dashboard", ip())
            .with_header("Cookie", "_turnstile_session=web-carol");

        let classifier = classifier();
        let classified = classifier.begin(&request, &settings);
        let discriminator = ThrottleRule::AuthenticatedWeb
            .discriminator(&classified, &settings)
            .await;

        assert_eq!(discriminator, Some(Discriminator::User(UserId(5))));
    }

    #[tokio::test]
    async fn test_internal_api_is_never_unauthenticated() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("POST", "/api/v4/internal/allowed", ip());

        assert!(applicable(&request, &settings).await.is_empty());
    }

    #[tokio::test]
    async fn test_allowlisted_user_skips_authenticated_buckets() {
        let settings = ThrottleSettings {
            user_allowlist: vec![UserId(5)],
            ..Default::default()
        };
        let request = RequestDescriptor::new("GET", "/api/v4/projects", ip())
            .with_header("PRIVATE-TOKEN", "api-carol");

        assert!(applicable(&request, &settings).await.is_empty());
    }

    #[test]
    fn test_discriminator_keys() {
        assert_eq!(Discriminator::Ip("1.2.3.4".into()).key(), "1.2.3.4");
        assert_eq!(Discriminator::User(UserId(9)).key(), "user:9");
        assert_eq!(Discriminator::User(UserId(9)).user_id(), Some(UserId(9)));
    }
}
