//! HTTP surfaces: the throttle middleware and the decision service.

mod layer;
mod server;
mod service;

pub use layer::{
    forbidden_response, rate_limit_headers, throttle, throttled_response, ThrottleLayer,
    FORBIDDEN_BODY, THROTTLED_BODY,
};
pub use server::HttpServer;
pub use service::{ApiError, AuthResult, CheckResponse, DecisionService, ADMIN_TOKEN_HEADER};
