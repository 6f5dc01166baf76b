//! User identity resolution.
//!
//! The throttle never authenticates anyone itself. It asks a [`UserDirectory`]
//! which user, if any, a credential found on the request belongs to.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::classify::Credential;
use crate::error::Result;

/// Identifier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lookup service for request credentials and usernames.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a credential to the user it belongs to.
    async fn find_user(&self, credential: &Credential) -> Result<Option<UserId>>;

    /// Look up the username of a user, used to enrich audit records.
    async fn username(&self, user_id: UserId) -> Result<Option<String>>;
}

/// A user entry as it appears in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserEntry {
    /// Numeric user id
    pub id: u64,
    /// Display username
    pub username: String,
    /// Personal access tokens accepted on API requests
    #[serde(default)]
    pub api_tokens: Vec<String>,
    /// Feed token accepted on `.atom` and `.ics` requests
    #[serde(default)]
    pub feed_token: Option<String>,
    /// Web session identifiers
    #[serde(default)]
    pub sessions: Vec<String>,
}

#[derive(Debug, Default)]
struct Tables {
    api_tokens: HashMap<String, UserId>,
    feed_tokens: HashMap<String, UserId>,
    sessions: HashMap<String, UserId>,
    usernames: HashMap<UserId, String>,
}

/// In-process user directory populated from configuration.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    tables: RwLock<Tables>,
}

impl InMemoryUserDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory from configured entries.
    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let directory = Self::new();
        for entry in entries {
            directory.insert(entry);
        }
        directory
    }

    /// Add or replace a user and all of its credentials.
    pub fn insert(&self, entry: &UserEntry) {
        let id = UserId(entry.id);
        let mut tables = self.tables.write();

        tables.usernames.insert(id, entry.username.clone());
        for token in &entry.api_tokens {
            tables.api_tokens.insert(token.clone(), id);
        }
        if let Some(token) = &entry.feed_token {
            tables.feed_tokens.insert(token.clone(), id);
        }
        for session in &entry.sessions {
            tables.sessions.insert(session.clone(), id);
        }
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.tables.read().usernames.len()
    }

    /// Whether the directory has no users.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, credential: &Credential) -> Result<Option<UserId>> {
        let tables = self.tables.read();
        let found = match credential {
            Credential::ApiToken(token) => tables.api_tokens.get(token),
            Credential::FeedToken { token, .. } => tables.feed_tokens.get(token),
            Credential::Session(id) => tables.sessions.get(id),
        };
        Ok(found.copied())
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.tables.read().usernames.get(&user_id).cloned())
    }
}
