//! Safelist and blocklist checks evaluated before any throttle.

mod allow2ban;
pub mod safelist;

pub use allow2ban::{Allow2Ban, GIT_BASIC_AUTH_RULE};
