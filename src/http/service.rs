//! Decision service routes.
//!
//! Lets a proxy or another process ask for throttle decisions over HTTP
//! instead of embedding the middleware.

use std::sync::Arc;

use axum::extract::{rejection::JsonRejection, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::layer::rate_limit_headers;
use crate::classify::{ClassificationResult, RequestDescriptor};
use crate::error::TurnstileError;
use crate::guard::{Decision, Guard};
use crate::ratelimit::ThrottledInfo;
use crate::settings::{InMemorySettings, SettingsProvider, ThrottleSettings};

/// Header carrying the admin token on `/admin` routes and `/v1/auth-result`.
pub const ADMIN_TOKEN_HEADER: &str = "x-turnstile-admin-token";

/// Shared state of the decision service.
#[derive(Clone)]
pub struct DecisionService {
    guard: Arc<Guard>,
    /// Settings the admin routes write to
    dynamic: Arc<InMemorySettings>,
    /// Settings the guard reads, overrides included
    effective: Arc<dyn SettingsProvider>,
    admin_token: Option<String>,
}

impl DecisionService {
    /// Create the service state.
    pub fn new(
        guard: Arc<Guard>,
        dynamic: Arc<InMemorySettings>,
        effective: Arc<dyn SettingsProvider>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            guard,
            dynamic,
            effective,
            admin_token,
        }
    }

    /// Whether admin routes and auth results are accepted without a token.
    pub fn is_open(&self) -> bool {
        self.admin_token.is_none()
    }

    /// All decision service routes.
    pub fn router(self) -> Router {
        if self.is_open() {
            warn!("No admin token configured, admin routes and auth results are unauthenticated");
        }
        Router::new()
            .route("/v1/check", post(check))
            .route("/v1/classify", post(classify))
            .route("/v1/auth-result", post(auth_result))
            .route("/admin/settings", get(read_settings).put(replace_settings))
            .route("/-/health", get(health))
            .with_state(self)
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Ok(());
        };
        match headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            Some(token) if token == expected => Ok(()),
            _ => {
                warn!("Rejected admin request with missing or wrong token");
                Err(ApiError::new(StatusCode::UNAUTHORIZED, "admin token required"))
            }
        }
    }
}

/// JSON error body with a status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TurnstileError> for ApiError {
    fn from(e: TurnstileError) -> Self {
        let status = match &e {
            TurnstileError::Config(_) | TurnstileError::Pattern(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TurnstileError::ConfigUnavailable(_)
            | TurnstileError::StoreUnavailable(_)
            | TurnstileError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            TurnstileError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Body of a `/v1/check` answer.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum CheckResponse {
    Allow,
    Throttled { throttle: ThrottledInfo },
    Banned { ip: std::net::IpAddr },
}

/// Body of a `/v1/auth-result` call.
#[derive(Debug, Deserialize)]
pub struct AuthResult {
    pub request: RequestDescriptor,
    pub status: u16,
}

fn descriptor(
    payload: Result<Json<RequestDescriptor>, JsonRejection>,
) -> Result<RequestDescriptor, ApiError> {
    let Json(request) = payload?;
    if request.path.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "path is required"));
    }
    Ok(request.normalized())
}

#[instrument(skip_all)]
async fn check(
    State(service): State<DecisionService>,
    payload: Result<Json<RequestDescriptor>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = descriptor(payload)?;
    debug!(
        method = %request.method,
        path = %request.path,
        remote_ip = %request.remote_ip,
        "Processing check"
    );

    let response = match service.guard.evaluate(&request).await {
        Decision::Allow => (StatusCode::OK, Json(CheckResponse::Allow)).into_response(),
        Decision::Throttled(info) => (
            StatusCode::TOO_MANY_REQUESTS,
            rate_limit_headers(&info),
            Json(CheckResponse::Throttled { throttle: info }),
        )
            .into_response(),
        Decision::Banned { ip } => {
            (StatusCode::FORBIDDEN, Json(CheckResponse::Banned { ip })).into_response()
        }
    };
    Ok(response)
}

#[instrument(skip_all)]
async fn classify(
    State(service): State<DecisionService>,
    payload: Result<Json<RequestDescriptor>, JsonRejection>,
) -> Result<Json<ClassificationResult>, ApiError> {
    let request = descriptor(payload)?;
    let settings = service.effective.current().await?;
    Ok(Json(
        service.guard.classifier().classify(&request, &settings).await,
    ))
}

#[instrument(skip_all)]
async fn auth_result(
    State(service): State<DecisionService>,
    headers: HeaderMap,
    payload: Result<Json<AuthResult>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers)?;
    let Json(result) = payload?;
    let status = StatusCode::from_u16(result.status)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid status code"))?;

    service
        .guard
        .record_auth_result(&result.request.normalized(), status)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_settings(
    State(service): State<DecisionService>,
    headers: HeaderMap,
) -> Result<Json<ThrottleSettings>, ApiError> {
    service.authorize(&headers)?;
    Ok(Json(service.effective.current().await?))
}

async fn replace_settings(
    State(service): State<DecisionService>,
    headers: HeaderMap,
    payload: Result<Json<ThrottleSettings>, JsonRejection>,
) -> Result<Json<ThrottleSettings>, ApiError> {
    service.authorize(&headers)?;
    let Json(settings) = payload?;

    service.dynamic.replace(settings)?;

    Ok(Json(service.effective.current().await?))
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::ratelimit::{MemoryCounterStore, ThrottleRule};
    use crate::settings::{EnvOverrides, LayeredSettings};
    use crate::users::InMemoryUserDirectory;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn service(admin_token: Option<&str>) -> (Router, Arc<InMemorySettings>) {
        let dynamic = Arc::new(InMemorySettings::default());
        let effective: Arc<dyn SettingsProvider> =
            Arc::new(LayeredSettings::new(dynamic.clone(), EnvOverrides::default()));
        let guard = Guard::new(
            effective.clone(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(InMemoryUserDirectory::new()),
            Arc::new(RecordingAuditSink::default()),
        )
        .unwrap();

        let router = DecisionService::new(
            Arc::new(guard),
            dynamic.clone(),
            effective,
            admin_token.map(str::to_string),
        )
        .router();
        (router, dynamic)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sign_in(ip: &str) -> serde_json::Value {
        json!({ "method": "post", "path": "/users/sign_in", "remote_ip": ip })
    }

    #[tokio::test]
    async fn test_check_allows_then_throttles() {
        let (app, dynamic) = service(None);
        dynamic
            .update(|s| {
                let bucket = s.bucket_mut(ThrottleRule::UnauthenticatedProtectedPaths);
                bucket.enabled = true;
                bucket.requests_per_period = 1;
                bucket.period_in_seconds = 60;
            })
            .unwrap();

        let first = app
            .clone()
            .oneshot(json_request("POST", "/v1/check", sign_in("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_json(first).await["decision"], "allow");

        let second = app
            .oneshot(json_request("POST", "/v1/check", sign_in("1.2.3.4")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));

        let body = body_json(second).await;
        assert_eq!(body["decision"], "throttled");
        assert_eq!(
            body["throttle"]["rule"],
            "throttle_unauthenticated_protected_paths"
        );
        assert_eq!(body["throttle"]["observed"], 2);
    }

    #[tokio::test]
    async fn test_check_rejects_bad_input() {
        let (app, _) = service(None);

        let empty_path = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/check",
                json!({ "method": "GET", "path": "", "remote_ip": "1.2.3.4" }),
            ))
            .await
            .unwrap();
        assert_eq!(empty_path.status(), StatusCode::BAD_REQUEST);

        let bad_ip = app
            .oneshot(json_request(
                "POST",
                "/v1/check",
                json!({ "method": "GET", "path": "/", "remote_ip": "nope" }),
            ))
            .await
            .unwrap();
        assert!(bad_ip.status().is_client_error());
    }

    #[tokio::test]
    async fn test_classify_reports_flags() {
        let (app, _) = service(None);
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/classify",
                json!({ "method": "POST", "path": "/api/v4/internal/allowed", "remote_ip": "1.2.3.4" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["is_api_request"], true);
        assert_eq!(body["is_internal_api_request"], true);
        assert_eq!(body["unauthenticated"], true);
    }

    #[tokio::test]
    async fn test_auth_results_ban_address() {
        let (app, dynamic) = service(None);
        dynamic
            .update(|s| {
                s.git_basic_auth.enabled = true;
                s.git_basic_auth.maxretry = 2;
            })
            .unwrap();
        let attempt = json!({
            "method": "GET",
            "path": "/g/p.git/info/refs",
            "headers": { "Authorization": "Basic dTpw" },
            "remote_ip": "1.2.3.4"
        });

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/v1/auth-result",
                    json!({ "request": attempt.clone(), "status": 401 }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .oneshot(json_request("POST", "/v1/check", attempt))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["decision"], "banned");
    }

    #[tokio::test]
    async fn test_admin_settings_roundtrip() {
        let (app, dynamic) = service(Some("secret"));

        let denied = app
            .clone()
            .oneshot(Request::get("/admin/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut settings = ThrottleSettings::default();
        settings.throttle_unauthenticated.enabled = true;
        settings.throttle_unauthenticated.requests_per_period = 5;
        let mut request = json_request(
            "PUT",
            "/admin/settings",
            serde_json::to_value(&settings).unwrap(),
        );
        request
            .headers_mut()
            .insert(ADMIN_TOKEN_HEADER, "secret".parse().unwrap());

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await["throttle_unauthenticated"]["requests_per_period"],
            5
        );
        assert_eq!(dynamic.snapshot(), settings);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let (app, dynamic) = service(None);
        let mut settings = ThrottleSettings::default();
        settings.throttle_authenticated_web.enabled = true;
        settings.throttle_authenticated_web.period_in_seconds = 0;

        let response = app
            .oneshot(json_request(
                "PUT",
                "/admin/settings",
                serde_json::to_value(&settings).unwrap(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(dynamic.snapshot(), ThrottleSettings::default());
    }

    #[tokio::test]
    async fn test_auth_results_require_admin_token() {
        let (app, dynamic) = service(Some("secret"));
        dynamic
            .update(|s| {
                s.git_basic_auth.enabled = true;
                s.git_basic_auth.maxretry = 1;
            })
            .unwrap();
        let failure = json!({
            "request": {
                "method": "GET",
                "path": "/g/p.git/info/refs",
                "headers": { "Authorization": "Basic dTpw" },
                "remote_ip": "1.2.3.4"
            },
            "status": 401
        });

        let denied = app
            .clone()
            .oneshot(json_request("POST", "/v1/auth-result", failure.clone()))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        // The rejected call must not have counted
        let check = app
            .clone()
            .oneshot(json_request("POST", "/v1/check", failure["request"].clone()))
            .await
            .unwrap();
        assert_eq!(check.status(), StatusCode::OK);

        let mut request = json_request("POST", "/v1/auth-result", failure);
        request
            .headers_mut()
            .insert(ADMIN_TOKEN_HEADER, "secret".parse().unwrap());
        let accepted = app.oneshot(request).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn test_open_only_without_admin_token() {
        let build = |token: Option<&str>| {
            let dynamic = Arc::new(InMemorySettings::default());
            let guard = Guard::new(
                dynamic.clone(),
                Arc::new(MemoryCounterStore::new()),
                Arc::new(InMemoryUserDirectory::new()),
                Arc::new(RecordingAuditSink::default()),
            )
            .unwrap();
            DecisionService::new(
                Arc::new(guard),
                dynamic.clone(),
                dynamic,
                token.map(str::to_string),
            )
        };

        assert!(build(None).is_open());
        assert!(!build(Some("secret")).is_open());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = service(None);
        let response = app
            .oneshot(Request::get("/-/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
