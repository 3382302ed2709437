//! Gatekeeper configuration structures, mapping the `gatekeeper.toml` file.

#![deny(missing_docs)]

pub mod identity;
mod loader;
pub mod policy;
pub mod store;
pub mod webhook;

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

pub use identity::{DEFAULT_PLAN, Identity, IdentificationConfig, IdentificationSource};
pub use policy::{
    ActionOnExceed, ConcurrencyAction, ConcurrencyConfig, CostRule, EndpointPolicy, PlanPolicy, PolicyConfig,
    PolicyConfigError, RateOverride, RateRule, RateWindowLimits, ResolvedWindow, TokenWindowLimits, UserOverride,
};
pub use store::{CircuitBreakerConfig, MemoryStoreConfig, OnError, RedisConfig, RedisPoolConfig, RedisTlsConfig, StorageConfig};
pub use webhook::{WebhookConfig, WebhookConfigError, validate_egress_url};

/// HTTP-surface settings: what IP ranges bypass or are rejected by the
/// admission middleware, and how to trust a reverse proxy's forwarded-for
/// header.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address the gateway listens on.
    pub listen_address: Option<SocketAddr>,
    /// IP addresses or CIDR ranges that always pass through untouched.
    pub ip_allowlist: Vec<String>,
    /// IP addresses or CIDR ranges that are always rejected with 403.
    pub ip_blocklist: Vec<String>,
    /// Whether to trust the `Forwarded`/`X-Forwarded-For` header.
    pub trust_proxy: bool,
    /// How many proxy hops to skip from the right of the forwarded-for list
    /// before trusting the next entry as the real client IP.
    pub trusted_proxy_count: usize,
    /// When true, policy decisions are logged and emitted as events but
    /// never applied — every request is admitted.
    pub dry_run: bool,
}

/// Top-level configuration for the gatekeeper.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server and admission settings.
    pub server: ServerConfig,
    /// Counter store backend.
    pub store: StorageConfig,
    /// Client identification.
    pub identification: IdentificationConfig,
    /// Per-plan, per-endpoint policy table.
    pub policies: PolicyConfig,
    /// Optional webhook event sink.
    pub webhook: Option<WebhookConfig>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validate invariants that span multiple sections: at least one plan
    /// is configured, every rule is well-formed, and the webhook URL (if
    /// any) passes the SSRF guard.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
                ip_allowlist: [],
                ip_blocklist: [],
                trust_proxy: false,
                trusted_proxy_count: 0,
                dry_run: false,
            },
            store: Memory(
                MemoryStoreConfig {
                    max_keys: 10000,
                    max_keys_per_user: 100,
                    sweep_interval_secs: 60,
                    allow_in_production: false,
                },
            ),
            identification: IdentificationConfig {
                enabled: false,
                user_id: None,
                plan: None,
                known_plans: [],
            },
            policies: {},
            webhook: None,
        }
        "#);
    }
}
