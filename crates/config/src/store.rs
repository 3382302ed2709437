//! Counter store backend configuration.

use serde::Deserialize;

/// Which counter store backend to use.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local LRU store. Not suitable for multi-instance deployments.
    Memory(MemoryStoreConfig),
    /// Redis-backed store shared across instances.
    Redis(RedisConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory(MemoryStoreConfig::default())
    }
}

/// In-process store tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryStoreConfig {
    /// Global cap on live counter entries before least-recently-used eviction.
    pub max_keys: usize,
    /// Per-identity cap on live counter entries.
    pub max_keys_per_user: usize,
    /// How often the background sweep removes expired entries.
    pub sweep_interval_secs: u64,
    /// Refuse construction unless this is explicitly set, guarding against
    /// accidentally running a process-local store in a clustered deployment.
    pub allow_in_production: bool,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            max_keys_per_user: 100,
            sweep_interval_secs: 60,
            allow_in_production: false,
        }
    }
}

/// How a distributed store failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Admit the request as if the budget were untouched.
    #[default]
    FailOpen,
    /// Propagate the error, typically surfaced as a 503.
    FailClosed,
}

/// Circuit breaker tuning for the distributed store.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before the next call is tried again.
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 30,
        }
    }
}

/// Redis connection pool tuning, mirroring `deadpool::managed::PoolConfig`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of pooled connections.
    pub max_size: Option<usize>,
    /// Timeout for establishing a new connection, in milliseconds.
    pub timeout_create_ms: Option<u64>,
    /// Timeout for waiting on a free connection, in milliseconds.
    pub timeout_wait_ms: Option<u64>,
    /// Timeout for the recycle health check, in milliseconds.
    pub timeout_recycle_ms: Option<u64>,
}

/// TLS settings for connecting to Redis.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Skip server certificate verification (self-signed deployments only).
    pub insecure: Option<bool>,
    /// Path to a CA certificate to trust.
    pub ca_cert_path: Option<String>,
    /// Path to a client certificate for mutual TLS.
    pub client_cert_path: Option<String>,
    /// Path to the client certificate's private key.
    pub client_key_path: Option<String>,
}

/// Redis-backed store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// TLS settings, if the URL uses `rediss://`.
    pub tls: Option<RedisTlsConfig>,
    /// Connection pool tuning.
    pub pool: RedisPoolConfig,
    /// Prefix prepended to every storage key.
    pub key_prefix: String,
    /// Degradation policy on a transient store failure.
    pub on_error: OnError,
    /// Circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            tls: None,
            pool: RedisPoolConfig::default(),
            key_prefix: "limitrate:".to_string(),
            on_error: OnError::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}
