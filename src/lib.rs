//! Turnstile - adaptive request throttling
//!
//! Classifies incoming requests (authenticated or not, API or web, protected
//! path or not), counts them in fixed windows per client address or user, and
//! rejects requests over the configured limits. A ban-after-failures blocklist
//! guards Git HTTP basic authentication. Limits are read live from a settings
//! provider, so changes apply to the next request.
//!
//! The [`guard::Guard`] is usable as axum middleware through
//! [`http::ThrottleLayer`] or as a standalone decision service through
//! [`http::DecisionService`].

pub mod audit;
pub mod classify;
pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod lists;
pub mod ratelimit;
pub mod settings;
pub mod users;
