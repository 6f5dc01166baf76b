//! Owned description of an inbound HTTP request.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use axum::http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};

/// Name of the cookie carrying a web session id.
pub const SESSION_COOKIE: &str = "_turnstile_session";

/// Path suffixes of Git smart HTTP endpoints.
const GIT_HTTP_SUFFIXES: &[&str] = &["/info/refs", "/git-upload-pack", "/git-receive-pack"];

/// Format of a feed that was requested with a feed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedFormat {
    Rss,
    Ics,
}

/// A credential found on a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    /// Personal access token (`PRIVATE-TOKEN`, `private_token`, bearer)
    ApiToken(String),
    /// Feed token on an `.atom` or `.ics` request
    FeedToken { token: String, format: FeedFormat },
    /// Web session cookie
    Session(String),
}

/// The parts of a request that classification looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method, upper case
    pub method: String,
    /// Request path without query string
    pub path: String,
    /// Raw query string
    #[serde(default)]
    pub query: Option<String>,
    /// Headers with lower-cased names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Address of the requester
    pub remote_ip: IpAddr,
}

impl RequestDescriptor {
    /// Create a descriptor without headers or query.
    pub fn new(method: &str, path: &str, remote_ip: IpAddr) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path.to_string(), None),
        };

        Self {
            method: method.to_ascii_uppercase(),
            path,
            query,
            headers: BTreeMap::new(),
            remote_ip,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Build a descriptor from HTTP request parts.
    pub fn from_http(method: &Method, uri: &Uri, headers: &HeaderMap, remote_ip: IpAddr) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            method: method.as_str().to_string(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            remote_ip,
        }
    }

    /// Normalize a descriptor received from an untrusted caller.
    pub fn normalized(mut self) -> Self {
        self.method = self.method.to_ascii_uppercase();
        self.headers = self
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// First value of a query parameter.
    ///
    /// Names and values are percent- and `+`-decoded; an undecodable query
    /// has no parameters.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(self.query.as_deref()?).ok()?;
        pairs
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
    }

    /// Whether the method is POST.
    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    /// The API token on the request, if any.
    pub fn api_token(&self) -> Option<Credential> {
        let token = self
            .header("private-token")
            .map(str::to_string)
            .or_else(|| self.query_param("private_token"))
            .or_else(|| {
                self.header("authorization")
                    .and_then(|value| value.strip_prefix("Bearer "))
                    .map(str::to_string)
            })?;
        Some(Credential::ApiToken(token.trim().to_string()))
    }

    /// The feed token, only honored on feed-shaped paths.
    pub fn feed_token(&self, format: FeedFormat) -> Option<Credential> {
        let suffix = match format {
            FeedFormat::Rss => ".atom",
            FeedFormat::Ics => ".ics",
        };
        if !self.path.ends_with(suffix) {
            return None;
        }
        let token = self.query_param("feed_token")?;
        Some(Credential::FeedToken {
            token,
            format,
        })
    }

    /// The web session cookie, if any.
    pub fn session(&self) -> Option<Credential> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| Credential::Session(value.to_string()))
    }

    /// Whether this is a Git smart HTTP request carrying Basic credentials.
    pub fn is_git_basic_auth_attempt(&self) -> bool {
        let is_git = GIT_HTTP_SUFFIXES
            .iter()
            .any(|suffix| self.path.ends_with(suffix));
        let has_basic = self
            .header("authorization")
            .is_some_and(|value| value.starts_with("Basic "));
        is_git && has_basic
    }

    /// Correlation id from `X-Request-Id`, if the caller sent one.
    pub fn request_id(&self) -> Option<&str> {
        self.header("x-request-id")
    }
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self::new("GET", "/", IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}
