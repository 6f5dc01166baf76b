//! Axum middleware that puts the guard in front of an application router.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::classify::RequestDescriptor;
use crate::guard::{Decision, Guard};
use crate::ratelimit::ThrottledInfo;

/// Body of a throttled response.
pub const THROTTLED_BODY: &str = "Retry later\n";

/// Body of a blocklisted response.
pub const FORBIDDEN_BODY: &str = "Forbidden\n";

/// Middleware state: the guard and how to find the client address.
#[derive(Clone)]
pub struct ThrottleLayer {
    guard: Arc<Guard>,
    trust_forwarded_for: bool,
}

impl ThrottleLayer {
    /// Create the middleware state.
    ///
    /// Only trust `X-Forwarded-For` behind a proxy that overwrites it.
    pub fn new(guard: Arc<Guard>, trust_forwarded_for: bool) -> Self {
        Self {
            guard,
            trust_forwarded_for,
        }
    }

    /// Wrap every route of `router`.
    pub fn apply<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(self, throttle))
    }

    /// The requester address of `request`.
    pub fn client_ip(&self, request: &Request) -> IpAddr {
        if self.trust_forwarded_for {
            if let Some(ip) = forwarded_for(request.headers()) {
                return ip;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// The left-most address of `X-Forwarded-For`.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Middleware function for [`axum::middleware::from_fn_with_state`].
pub async fn throttle(State(layer): State<ThrottleLayer>, request: Request, next: Next) -> Response {
    let remote_ip = layer.client_ip(&request);
    let descriptor = RequestDescriptor::from_http(
        request.method(),
        request.uri(),
        request.headers(),
        remote_ip,
    );

    match layer.guard.evaluate(&descriptor).await {
        Decision::Allow => {}
        Decision::Throttled(info) => return throttled_response(&info),
        Decision::Banned { .. } => return forbidden_response(),
    }

    let response = next.run(request).await;

    if descriptor.is_git_basic_auth_attempt() {
        debug!(status = response.status().as_u16(), "Git basic auth attempt answered");
        layer
            .guard
            .record_auth_result(&descriptor, response.status())
            .await;
    }

    response
}

/// Headers describing a tripped throttle.
///
/// `RateLimit-Limit` is normalized to requests per minute, rounded up.
pub fn rate_limit_headers(info: &ThrottledInfo) -> [(&'static str, String); 7] {
    let per_minute = (info.limit * 60).div_ceil(info.period.max(1));
    let reset_time = DateTime::<Utc>::from_timestamp(info.reset_at as i64, 0)
        .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default();

    [
        ("retry-after", info.reset_in.to_string()),
        ("ratelimit-name", info.rule.name().to_string()),
        ("ratelimit-limit", per_minute.to_string()),
        ("ratelimit-observed", info.observed.to_string()),
        ("ratelimit-remaining", info.remaining().to_string()),
        ("ratelimit-reset", info.reset_at.to_string()),
        ("ratelimit-resettime", reset_time),
    ]
}

/// The `429` sent for a throttled request.
pub fn throttled_response(info: &ThrottledInfo) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        rate_limit_headers(info),
        THROTTLED_BODY,
    )
        .into_response()
}

/// The `403` sent to a banned address.
pub fn forbidden_response() -> Response {
    (StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::ratelimit::{MemoryCounterStore, ThrottleRule};
    use crate::settings::{BucketSettings, InMemorySettings};
    use crate::users::{InMemoryUserDirectory, UserEntry};
    use axum::body::Body;
    use axum::routing::{get, post};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(settings: Arc<InMemorySettings>, trust_forwarded_for: bool) -> Router {
        let users = Arc::new(InMemoryUserDirectory::from_entries(&[UserEntry {
            id: 5,
            username: "grace".to_string(),
            ..Default::default()
        }]));
        let guard = Guard::new(
            settings,
            Arc::new(MemoryCounterStore::new()),
            users,
            Arc::new(RecordingAuditSink::default()),
        )
        .unwrap();

        let router = Router::new()
            .route("/users/sign_in", post(|| async { "signed in" }))
            .route("/explore", get(|| async { "projects" }))
            .route(
                "/group/project.git/info/refs",
                get(|headers: HeaderMap| async move {
                    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                        Some("Basic Z29vZDpnb29k") => StatusCode::OK,
                        _ => StatusCode::UNAUTHORIZED,
                    }
                }),
            );

        ThrottleLayer::new(Arc::new(guard), trust_forwarded_for).apply(router)
    }

    fn from(method: &str, uri: &str, ip: &str) -> Request {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = format!("{}:40000", ip).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn settings_with(rule: ThrottleRule, limit: u64, period: u64) -> Arc<InMemorySettings> {
        let settings = Arc::new(InMemorySettings::default());
        settings
            .update(|s| {
                *s.bucket_mut(rule) = BucketSettings {
                    enabled: true,
                    requests_per_period: limit,
                    period_in_seconds: period,
                }
            })
            .unwrap();
        settings
    }

    #[tokio::test]
    async fn test_sign_in_throttled_with_headers() {
        let app = app(
            settings_with(ThrottleRule::UnauthenticatedProtectedPaths, 6, 60),
            false,
        );

        for _ in 0..6 {
            let response = app
                .clone()
                .oneshot(from("POST", "/users/sign_in", "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(from("POST", "/users/sign_in", "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(
            headers["ratelimit-name"],
            "throttle_unauthenticated_protected_paths"
        );
        assert_eq!(headers["ratelimit-limit"], "6");
        assert_eq!(headers["ratelimit-observed"], "7");
        assert_eq!(headers["ratelimit-remaining"], "0");
        let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!(retry_after <= 60);
        assert!(headers["ratelimit-resettime"]
            .to_str()
            .unwrap()
            .ends_with(" GMT"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], THROTTLED_BODY.as_bytes());

        let other = app
            .oneshot(from("POST", "/users/sign_in", "5.6.7.8"))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarded_for_only_when_trusted() {
        let settings = settings_with(ThrottleRule::Unauthenticated, 1, 60);
        let forwarded = |ip: &str| {
            let mut request = from("GET", "/explore", "10.0.0.1");
            request
                .headers_mut()
                .insert("x-forwarded-for", format!("{}, 10.0.0.1", ip).parse().unwrap());
            request
        };

        let trusted = app(settings.clone(), true);
        let first = trusted.clone().oneshot(forwarded("1.1.1.1")).await.unwrap();
        let second = trusted.oneshot(forwarded("2.2.2.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        // Without trust both requests come from the proxy address
        let untrusted = app(settings, false);
        let first = untrusted.clone().oneshot(forwarded("1.1.1.1")).await.unwrap();
        let second = untrusted.oneshot(forwarded("2.2.2.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_failed_git_auth_leads_to_ban() {
        let settings = Arc::new(InMemorySettings::default());
        settings
            .update(|s| {
                s.git_basic_auth.enabled = true;
                s.git_basic_auth.maxretry = 10;
                s.git_basic_auth.findtime = 60;
                s.git_basic_auth.bantime = 3600;
            })
            .unwrap();
        let app = app(settings, false);

        let with_auth = |credentials: &str| {
            let mut request = from("GET", "/group/project.git/info/refs", "1.2.3.4");
            request
                .headers_mut()
                .insert("authorization", format!("Basic {}", credentials).parse().unwrap());
            request
        };

        for _ in 0..10 {
            let response = app.clone().oneshot(with_auth("YmFkOmJhZA==")).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app.clone().oneshot(with_auth("Z29vZDpnb29k")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], FORBIDDEN_BODY.as_bytes());

        let elsewhere = app.oneshot(from("GET", "/explore", "5.6.7.8")).await.unwrap();
        assert_eq!(elsewhere.status(), StatusCode::OK);
    }

    #[test]
    fn test_limit_header_rounds_up_per_minute() {
        let info = ThrottledInfo {
            rule: ThrottleRule::AuthenticatedApi,
            discriminator: "user:5".to_string(),
            limit: 7,
            observed: 8,
            period: 3600,
            reset_in: 120,
            reset_at: 1_700_000_000,
        };
        let headers = rate_limit_headers(&info);

        assert_eq!(headers[2], ("ratelimit-limit", "1".to_string()));
        assert_eq!(headers[0], ("retry-after", "120".to_string()));
        assert_eq!(
            headers[6].1,
            "Tue, 14 Nov 2023 22:13:20 GMT".to_string()
        );
    }
}
