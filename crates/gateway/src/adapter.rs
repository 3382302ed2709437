//! The Adapter contract (§6): everything the admission middleware needs from
//! the surrounding framework, with defaults for every optional callback so an
//! adapter only implements the pieces it actually uses.

use config::{EndpointPolicy, Identity, UserOverride};
use http::request::Parts;

/// What the middleware needs from request-specific framework glue.
///
/// `identify` is the only required method; every other callback defaults to
/// "not configured" so a minimal adapter is a few lines. Stored as
/// `Arc<dyn Adapter>` in the layer, since a `tower::Layer` value must be
/// `Clone + Send + Sync + 'static`. Operates on [`Parts`] rather than a full
/// `Request<B>` since no callback needs the body.
pub trait Adapter: Send + Sync + 'static {
    /// Resolve the caller's identity for this request.
    fn identify(&self, parts: &Parts) -> Identity;

    /// Whether this request should bypass admission entirely.
    fn skip(&self, _parts: &Parts) -> bool {
        false
    }

    /// Monetary cost estimate for this request, if a cost rule applies.
    fn estimate_cost(&self, _parts: &Parts) -> Option<f64> {
        None
    }

    /// Token estimate for this request, if a token budget applies.
    fn estimate_tokens(&self, _parts: &Parts) -> u32 {
        0
    }

    /// Per-identity rate override, consulted before the plan's policy.
    fn user_override(&self, _parts: &Parts) -> Option<UserOverride> {
        None
    }

    /// Per-route policy override, taking precedence over the plan table.
    fn policy_override(&self, _parts: &Parts) -> Option<EndpointPolicy> {
        None
    }

    /// Concurrency queue priority for this request. Invalid values (≤ 0 is
    /// valid; only out-of-range/non-finite inputs from dynamic sources are
    /// invalid) fall back to the default of 5.
    fn priority(&self, _parts: &Parts) -> i64 {
        5
    }
}

/// The one concrete adapter the crate ships: reads the user key and plan tag
/// from two configurable header names, falling back to the caller's IP and
/// the `free` plan when identification is disabled or the headers are
/// missing. Grounded in the teacher's `config::client_identification`
/// (`ClientIdentificationConfig`/`IdentificationSource`).
pub struct HeaderAdapter {
    config: config::IdentificationConfig,
}

impl HeaderAdapter {
    /// Build an adapter over the loaded identification config.
    pub fn new(config: config::IdentificationConfig) -> Self {
        Self { config }
    }

    fn header_value(parts: &Parts, source: &config::IdentificationSource) -> Option<String> {
        parts.headers.get(&source.header).and_then(|v| v.to_str().ok()).map(str::to_string)
    }
}

impl Adapter for HeaderAdapter {
    fn identify(&self, parts: &Parts) -> Identity {
        if !self.config.enabled {
            return Identity::new(remote_ip_fallback(parts), config::DEFAULT_PLAN);
        }

        let user_key = self
            .config
            .user_id
            .as_ref()
            .and_then(|source| Self::header_value(parts, source))
            .unwrap_or_else(|| remote_ip_fallback(parts));

        let plan = self
            .config
            .plan
            .as_ref()
            .and_then(|source| Self::header_value(parts, source))
            .filter(|plan| self.config.known_plans.is_empty() || self.config.known_plans.contains(plan))
            .unwrap_or_else(|| config::DEFAULT_PLAN.to_string());

        Identity::new(user_key, plan)
    }
}

fn remote_ip_fallback(parts: &Parts) -> String {
    crate::ip_filter::extract_client_ip(parts, false, 0)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use config::IdentificationSource;
    use http::Request;

    use super::*;

    fn config(enabled: bool) -> config::IdentificationConfig {
        config::IdentificationConfig {
            enabled,
            user_id: Some(IdentificationSource {
                header: "X-Client-Id".to_string(),
            }),
            plan: Some(IdentificationSource {
                header: "X-Plan".to_string(),
            }),
            known_plans: vec!["free".to_string(), "pro".to_string()],
        }
    }

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder();

        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn disabled_identification_falls_back_to_ip_and_free() {
        let adapter = HeaderAdapter::new(config(false));
        let identity = adapter.identify(&parts(&[]));
        assert_eq!(identity.plan, "free");
    }

    #[test]
    fn reads_user_and_plan_from_headers() {
        let adapter = HeaderAdapter::new(config(true));
        let identity = adapter.identify(&parts(&[("X-Client-Id", "user-42"), ("X-Plan", "pro")]));
        assert_eq!(identity.user_key, "user-42");
        assert_eq!(identity.plan, "pro");
    }

    #[test]
    fn unknown_plan_falls_back_to_free() {
        let adapter = HeaderAdapter::new(config(true));
        let identity = adapter.identify(&parts(&[("X-Client-Id", "user-42"), ("X-Plan", "enterprise")]));
        assert_eq!(identity.plan, "free");
    }

    #[test]
    fn missing_user_header_falls_back_to_ip() {
        let adapter = HeaderAdapter::new(config(true));
        let identity = adapter.identify(&parts(&[]));
        assert_eq!(identity.user_key, "unknown");
    }
}
