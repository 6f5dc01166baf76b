//! Request classification.
//!
//! Path-shape checks are computed up front. User identity is resolved lazily
//! and only through the credential schemes the asking bucket cares about.

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::warn;

use super::request::{Credential, FeedFormat, RequestDescriptor};
use crate::error::Result;
use crate::settings::ThrottleSettings;
use crate::users::{UserDirectory, UserId};

const INTERNAL_API_PATTERN: &str = r"^/api/v\d+/internal/";

const HEALTH_CHECK_PATHS: &[&str] = &["/-/health", "/-/liveness", "/-/readiness", "/-/metrics"];

/// Credential schemes consulted when resolving a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScope {
    /// API token only
    Api,
    /// API token, RSS and ICS feed tokens, web session
    Web,
}

/// Ordered path prefixes compiled into one alternation.
#[derive(Debug, Clone)]
pub struct ProtectedPathSet {
    paths: Vec<String>,
    pattern: Option<Regex>,
}

impl ProtectedPathSet {
    /// Compile a prefix list.
    pub fn new(paths: &[String]) -> Result<Self> {
        let pattern = if paths.is_empty() {
            None
        } else {
            let alternation = paths
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!("^(?:{})", alternation))?)
        };

        Ok(Self {
            paths: paths.to_vec(),
            pattern,
        })
    }

    /// Whether `path` starts with any prefix.
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(path))
    }

    /// The prefixes this set was compiled from.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

/// Full classification of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub unauthenticated: bool,
    pub is_api_request: bool,
    pub is_internal_api_request: bool,
    pub is_health_check: bool,
    pub is_post: bool,
    pub protected_path_match: bool,
    /// User resolved through the API token
    pub api_user_id: Option<UserId>,
    /// User resolved through any web credential
    pub authenticated_user_id: Option<UserId>,
}

/// Classifies requests against the current settings.
pub struct Classifier {
    users: Arc<dyn UserDirectory>,
    internal_api: Regex,
    protected: Mutex<Arc<ProtectedPathSet>>,
}

impl Classifier {
    /// Create a classifier resolving identities through `users`.
    pub fn new(users: Arc<dyn UserDirectory>) -> Result<Self> {
        Ok(Self {
            users,
            internal_api: Regex::new(INTERNAL_API_PATTERN)?,
            protected: Mutex::new(Arc::new(ProtectedPathSet::new(&[])?)),
        })
    }

    /// Start classifying a request; identity is resolved on demand.
    pub fn begin<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        settings: &ThrottleSettings,
    ) -> Classified<'a> {
        let path = request.path.as_str();
        let is_api_request = path.starts_with("/api");

        Classified {
            request,
            users: self.users.as_ref(),
            is_api_request,
            is_internal_api_request: is_api_request && self.internal_api.is_match(path),
            is_health_check: HEALTH_CHECK_PATHS.contains(&path),
            is_post: request.is_post(),
            protected_path_match: self.protected_paths(&settings.protected_paths).matches(path),
            api_user: OnceCell::new(),
            web_user: OnceCell::new(),
        }
    }

    /// Classify a request completely, resolving every identity.
    pub async fn classify(
        &self,
        request: &RequestDescriptor,
        settings: &ThrottleSettings,
    ) -> ClassificationResult {
        self.begin(request, settings).result().await
    }

    /// The compiled protected paths, recompiled when the list changes.
    fn protected_paths(&self, paths: &[String]) -> Arc<ProtectedPathSet> {
        let mut cached = self.protected.lock();
        if cached.paths() != paths {
            match ProtectedPathSet::new(paths) {
                Ok(set) => *cached = Arc::new(set),
                Err(e) => {
                    warn!(error = %e, "Failed to compile protected paths, keeping previous set");
                }
            }
        }
        Arc::clone(&cached)
    }
}

/// A request being classified.
pub struct Classified<'a> {
    request: &'a RequestDescriptor,
    users: &'a dyn UserDirectory,
    pub is_api_request: bool,
    pub is_internal_api_request: bool,
    pub is_health_check: bool,
    pub is_post: bool,
    pub protected_path_match: bool,
    api_user: OnceCell<Option<UserId>>,
    web_user: OnceCell<Option<UserId>>,
}

impl Classified<'_> {
    /// The request under classification.
    pub fn request(&self) -> &RequestDescriptor {
        self.request
    }

    /// Whether a web request, i.e. not under `/api`.
    pub fn is_web_request(&self) -> bool {
        !self.is_api_request
    }

    /// Requests that never count against unauthenticated buckets.
    pub fn is_exempt_from_unauthenticated(&self) -> bool {
        self.is_internal_api_request || self.is_health_check
    }

    /// The user behind the request, looked up through `scope` only.
    pub async fn user_id(&self, scope: AuthScope) -> Option<UserId> {
        let api = *self
            .api_user
            .get_or_init(|| self.lookup(self.request.api_token()))
            .await;
        if scope == AuthScope::Api || api.is_some() {
            return api;
        }

        *self
            .web_user
            .get_or_init(|| async {
                let candidates = [
                    self.request.feed_token(FeedFormat::Rss),
                    self.request.feed_token(FeedFormat::Ics),
                    self.request.session(),
                ];
                for credential in candidates.into_iter().flatten() {
                    if let Some(id) = self.lookup(Some(credential)).await {
                        return Some(id);
                    }
                }
                None
            })
            .await
    }

    /// Whether no credential scheme resolves to a user.
    pub async fn unauthenticated(&self) -> bool {
        self.user_id(AuthScope::Web).await.is_none()
    }

    /// Resolve everything into a [`ClassificationResult`].
    pub async fn result(&self) -> ClassificationResult {
        let api_user_id = self.user_id(AuthScope::Api).await;
        let authenticated_user_id = self.user_id(AuthScope::Web).await;

        ClassificationResult {
            unauthenticated: authenticated_user_id.is_none(),
            is_api_request: self.is_api_request,
            is_internal_api_request: self.is_internal_api_request,
            is_health_check: self.is_health_check,
            is_post: self.is_post,
            protected_path_match: self.protected_path_match,
            api_user_id,
            authenticated_user_id,
        }
    }

    async fn lookup(&self, credential: Option<Credential>) -> Option<UserId> {
        let credential = credential?;
        match self.users.find_user(&credential).await {
            Ok(found) => found,
            Err(e) => {
                // Treated as anonymous; the unauthenticated bucket still applies.
                warn!(error = %e, "User lookup failed");
                None
            }
        }
    }
}
