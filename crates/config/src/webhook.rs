//! Webhook egress sink configuration, with an SSRF guard applied at load
//! time so a misconfigured URL never becomes a live request.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Configuration for the optional webhook event sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Destination URL. Validated against [`validate_egress_url`] at load time.
    pub url: Url,
    /// Number of retry attempts after the first, with progressive delays.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay before each retry, in seconds. Defaults to `[1, 4, 16]`.
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
    /// Failure count before the per-URL circuit breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the per-URL circuit breaker stays open.
    #[serde(default = "default_breaker_timeout_secs")]
    pub breaker_timeout_secs: u64,
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delays_secs() -> Vec<u64> {
    vec![1, 4, 16]
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout_secs() -> u64 {
    60
}

impl WebhookConfig {
    /// Per-attempt HTTP timeout: `5s + 5s * attempt`, per §6.
    pub fn attempt_timeout(attempt: u32) -> Duration {
        Duration::from_secs(5 + 5 * u64::from(attempt))
    }

    /// Validate the configured URL against the SSRF guard.
    pub fn validate(&self) -> Result<(), WebhookConfigError> {
        validate_egress_url(&self.url)
    }
}

/// Error raised when a webhook URL is unsafe to use for egress.
#[derive(Debug, thiserror::Error)]
pub enum WebhookConfigError {
    /// Scheme other than http/https.
    #[error("webhook url {0} must use http or https")]
    UnsupportedScheme(Url),
    /// URL has no host component.
    #[error("webhook url {0} has no host")]
    MissingHost(Url),
    /// Host resolves to a loopback, private, or link-local address.
    #[error("webhook url {0} targets a private or loopback address, which is not allowed")]
    UnsafeAddress(Url),
}

/// Reject outbound URLs that target loopback, private, or link-local
/// addresses, per §6's SSRF guard.
pub fn validate_egress_url(url: &Url) -> Result<(), WebhookConfigError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(WebhookConfigError::UnsupportedScheme(url.clone()));
    }

    let host = url.host_str().ok_or_else(|| WebhookConfigError::MissingHost(url.clone()))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_unsafe_address(ip) {
            return Err(WebhookConfigError::UnsafeAddress(url.clone()));
        }
    } else if host.eq_ignore_ascii_case("localhost") {
        return Err(WebhookConfigError::UnsafeAddress(url.clone()));
    }

    Ok(())
}

fn is_unsafe_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00 || is_v6_link_local(v6)
        }
    }
}

fn is_v6_link_local(v6: std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback() {
        let url: Url = "http://127.0.0.1/hook".parse().unwrap();
        assert!(validate_egress_url(&url).is_err());
    }

    #[test]
    fn rejects_private_range() {
        let url: Url = "http://10.0.0.5/hook".parse().unwrap();
        assert!(validate_egress_url(&url).is_err());
    }

    #[test]
    fn rejects_link_local() {
        let url: Url = "http://169.254.1.1/hook".parse().unwrap();
        assert!(validate_egress_url(&url).is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        let url: Url = "ftp://example.com/hook".parse().unwrap();
        assert!(validate_egress_url(&url).is_err());
    }

    #[test]
    fn accepts_public_host() {
        let url: Url = "https://hooks.example.com/webhook".parse().unwrap();
        assert!(validate_egress_url(&url).is_ok());
    }
}
