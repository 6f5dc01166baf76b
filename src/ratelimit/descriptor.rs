//! Counter key generation and handling.

use std::fmt;

/// Which family a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// Throttle bucket counters
    Throttle,
    /// Allow2Ban failure counters
    Allow2Ban,
}

impl KeyScope {
    fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Throttle => "throttle",
            KeyScope::Allow2Ban => "allow2ban",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "throttle" => Some(KeyScope::Throttle),
            "allow2ban" => Some(KeyScope::Allow2Ban),
            _ => None,
        }
    }
}

/// A key that uniquely identifies one counter in one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Counter family
    pub scope: KeyScope,
    /// Rule or blocklist name
    pub name: String,
    /// Window id, `floor(now / period)`
    pub window: u64,
    /// Requester address or user key
    pub discriminator: String,
}

impl CounterKey {
    /// Create a key for a throttle bucket counter.
    pub fn throttle(name: &str, discriminator: &str, window: u64) -> Self {
        Self {
            scope: KeyScope::Throttle,
            name: name.to_string(),
            window,
            discriminator: discriminator.to_string(),
        }
    }

    /// Create a key for an Allow2Ban failure counter.
    pub fn allow2ban(name: &str, discriminator: &str, window: u64) -> Self {
        Self {
            scope: KeyScope::Allow2Ban,
            name: name.to_string(),
            window,
            discriminator: discriminator.to_string(),
        }
    }

    /// Convert to the store key string.
    /// Format: "{scope}:{name}:{window}:{discriminator}"
    /// The discriminator goes last since IPv6 addresses contain ':'
    pub fn to_store_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.scope.as_str(),
            self.name,
            self.window,
            self.discriminator
        )
    }

    /// Parse from a store key string.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, ':');
        let scope = KeyScope::parse(parts.next()?)?;
        let name = parts.next()?;
        let window: u64 = parts.next()?.parse().ok()?;
        let discriminator = parts.next()?;

        if name.is_empty() || discriminator.is_empty() {
            return None;
        }

        Some(Self {
            scope,
            name: name.to_string(),
            window,
            discriminator: discriminator.to_string(),
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_to_string() {
        let key = CounterKey::throttle("throttle_unauthenticated", "1.2.3.4", 28401120);
        assert_eq!(
            key.to_store_key(),
            "throttle:throttle_unauthenticated:28401120:1.2.3.4"
        );
    }

    #[test]
    fn test_counter_key_parses_ipv6_discriminator() {
        let key = CounterKey::allow2ban("git_basic_auth", "2001:db8::1", 7);
        let parsed = CounterKey::from_store_key(&key.to_store_key()).unwrap();

        assert_eq!(parsed, key);
        assert_eq!(parsed.discriminator, "2001:db8::1");
    }

    #[test]
    fn test_counter_key_parsing_invalid() {
        assert!(CounterKey::from_store_key("invalid").is_none());
        assert!(CounterKey::from_store_key("throttle:only:two").is_none());
        assert!(CounterKey::from_store_key("other:a:1:b").is_none());
        assert!(CounterKey::from_store_key("throttle:a:notanumber:b").is_none());
    }

    #[test]
    fn test_windows_produce_distinct_keys() {
        let key1 = CounterKey::throttle("rule", "user:1", 1);
        let key2 = CounterKey::throttle("rule", "user:1", 2);

        assert_ne!(key1, key2);
        assert_ne!(key1.to_store_key(), key2.to_store_key());
    }
}
