//! Requests that bypass throttling entirely.

use crate::classify::RequestDescriptor;
use crate::settings::ThrottleSettings;

/// Name reported when the bypass header matched.
pub const BYPASS_HEADER_RULE: &str = "throttle_bypass_header";

/// Name reported when a safelisted path prefix matched.
pub const SAFELIST_PATH_RULE: &str = "safelist_path";

/// The safelist rule matching `request`, if any.
pub fn matched(request: &RequestDescriptor, settings: &ThrottleSettings) -> Option<&'static str> {
    if let Some(header) = settings.bypass_header.as_deref() {
        if request.header(header) == Some("1") {
            return Some(BYPASS_HEADER_RULE);
        }
    }

    settings
        .safelist_paths
        .iter()
        .any(|prefix| request.path.starts_with(prefix.as_str()))
        .then_some(SAFELIST_PATH_RULE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[test]
    fn test_bypass_header() {
        let settings = ThrottleSettings {
            bypass_header: Some("gitlab-bypass-rate-limiting".to_string()),
            ..Default::default()
        };

        let trusted = RequestDescriptor::new("GET", "/", ip())
            .with_header("Gitlab-Bypass-Rate-Limiting", "1");
        let wrong_value = RequestDescriptor::new("GET", "/", ip())
            .with_header("Gitlab-Bypass-Rate-Limiting", "true");
        let plain = RequestDescriptor::new("GET", "/", ip());

        assert_eq!(matched(&trusted, &settings), Some(BYPASS_HEADER_RULE));
        assert_eq!(matched(&wrong_value, &settings), None);
        assert_eq!(matched(&plain, &settings), None);
    }

    #[test]
    fn test_header_ignored_when_not_configured() {
        let settings = ThrottleSettings::default();
        let request = RequestDescriptor::new("GET", "/", ip())
            .with_header("Gitlab-Bypass-Rate-Limiting", "1");

        assert_eq!(matched(&request, &settings), None);
    }

    #[test]
    fn test_safelist_path() {
        let settings = ThrottleSettings {
            safelist_paths: vec!["/assets/".to_string()],
            ..Default::default()
        };

        let asset = RequestDescriptor::new("GET", "/assets/app.js", ip());
        let page = RequestDescriptor::new("GET", "/explore", ip());

        assert_eq!(matched(&asset, &settings), Some(SAFELIST_PATH_RULE));
        assert_eq!(matched(&page, &settings), None);
    }
}
