//! Live throttle settings.

mod provider;
mod types;

pub use provider::{
    BucketOverride, EnvOverrides, InMemorySettings, LayeredSettings, SettingsProvider, ENV_PREFIX,
};
pub use types::{Allow2BanSettings, BucketSettings, ThrottleSettings, DEFAULT_PROTECTED_PATHS};
