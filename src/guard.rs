//! The request guard: safelist, blocklist, then throttles.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tracing::{debug, instrument, warn};

use crate::audit::{AuditSink, MatchEvent, MatchType};
use crate::classify::{Classifier, RequestDescriptor};
use crate::error::Result;
use crate::lists::{safelist, Allow2Ban, GIT_BASIC_AUTH_RULE};
use crate::ratelimit::{
    epoch_secs, CounterStore, ThrottleEngine, ThrottleOutcome, ThrottleRule, ThrottledInfo,
    DEFAULT_STORE_TIMEOUT,
};
use crate::settings::{SettingsProvider, ThrottleSettings};
use crate::users::{UserDirectory, UserId};

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request on
    Allow,
    /// Reject with 429
    Throttled(ThrottledInfo),
    /// Reject with 403
    Banned { ip: IpAddr },
}

impl Decision {
    /// The HTTP status a rejected request gets, `200` when allowed.
    pub fn status(&self) -> StatusCode {
        match self {
            Decision::Allow => StatusCode::OK,
            Decision::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            Decision::Banned { .. } => StatusCode::FORBIDDEN,
        }
    }
}

/// Evaluates requests against the live settings.
pub struct Guard {
    settings: Arc<dyn SettingsProvider>,
    classifier: Classifier,
    engine: ThrottleEngine,
    allow2ban: Allow2Ban,
    audit: Arc<dyn AuditSink>,
}

impl Guard {
    /// Create a guard with the default store timeout.
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn CounterStore>,
        users: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        Self::with_timeout(settings, store, users, audit, DEFAULT_STORE_TIMEOUT)
    }

    /// Create a guard whose store calls are bounded by `store_timeout`.
    pub fn with_timeout(
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn CounterStore>,
        users: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditSink>,
        store_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            settings,
            classifier: Classifier::new(users)?,
            engine: ThrottleEngine::new(store.clone()).with_timeout(store_timeout),
            allow2ban: Allow2Ban::new(GIT_BASIC_AUTH_RULE, store, store_timeout),
            audit,
        })
    }

    /// The classifier used by this guard.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Decide what happens to `request`.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn evaluate(&self, request: &RequestDescriptor) -> Decision {
        self.evaluate_at(request, epoch_secs()).await
    }

    /// Decide what happens to `request` as of `now` (epoch seconds).
    pub async fn evaluate_at(&self, request: &RequestDescriptor, now: u64) -> Decision {
        let settings = match self.settings.current().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Settings unavailable, request not throttled");
                return Decision::Allow;
            }
        };
        let correlation_id = request
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let event = |rule: &str, match_type: MatchType, user_id: Option<UserId>| MatchEvent {
            rule_name: rule.to_string(),
            match_type,
            requester_ip: request.remote_ip,
            http_method: request.method.clone(),
            path: request.path.clone(),
            user_id,
            correlation_id: correlation_id.clone(),
        };

        if let Some(rule) = safelist::matched(request, &settings) {
            self.audit.record(event(rule, MatchType::Safelist, None));
            return Decision::Allow;
        }

        if self.is_banned(request, &settings).await {
            self.audit
                .record(event(self.allow2ban.name(), MatchType::Blocklist, None));
            return Decision::Banned {
                ip: request.remote_ip,
            };
        }

        let classified = self.classifier.begin(request, &settings);
        for rule in ThrottleRule::ALL {
            let bucket = settings.bucket(rule);
            if !bucket.enabled {
                continue;
            }
            let Some(discriminator) = rule.discriminator(&classified, &settings).await else {
                continue;
            };

            let ThrottleOutcome::Throttled(info) =
                self.engine.check(rule, &discriminator, bucket, now).await
            else {
                continue;
            };

            if settings.is_dry_run(rule) {
                self.audit
                    .record(event(rule.name(), MatchType::Track, discriminator.user_id()));
                continue;
            }

            self.audit
                .record(event(rule.name(), MatchType::Throttle, discriminator.user_id()));
            return Decision::Throttled(info);
        }

        Decision::Allow
    }

    /// Ban-state check; a store failure denies the request.
    async fn is_banned(&self, request: &RequestDescriptor, settings: &ThrottleSettings) -> bool {
        match self
            .allow2ban
            .is_banned(&request.remote_ip, &settings.git_basic_auth)
            .await
        {
            Ok(banned) => banned,
            Err(e) => {
                warn!(remote_ip = %request.remote_ip, error = %e, "Ban state unavailable, denying request");
                true
            }
        }
    }

    /// Feed the outcome of a Git HTTP basic auth attempt into the blocklist.
    ///
    /// `401` counts as a failure, any success clears earlier failures. Other
    /// requests are ignored.
    pub async fn record_auth_result(&self, request: &RequestDescriptor, status: StatusCode) {
        if !request.is_git_basic_auth_attempt() {
            return;
        }
        let settings = match self.settings.current().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Settings unavailable, auth result ignored");
                return;
            }
        };
        let ban = &settings.git_basic_auth;
        let ip = &request.remote_ip;

        let result = if status == StatusCode::UNAUTHORIZED {
            self.allow2ban.register_failure(ip, ban).await.map(|_| ())
        } else if status.is_success() {
            self.allow2ban.reset(ip, ban).await
        } else {
            return;
        };

        match result {
            Ok(()) => debug!(remote_ip = %ip, status = status.as_u16(), "Recorded auth result"),
            Err(e) => warn!(remote_ip = %ip, error = %e, "Failed to record auth result"),
        }
    }
}
