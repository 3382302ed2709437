//! The counter store: atomic windowed counters for rate, cost and token
//! budgets, behind a single backend-agnostic trait.

#![deny(missing_docs)]

mod circuit_breaker;
mod error;
mod memory;
mod redis;
mod redis_pool;
mod result;

use std::sync::Arc;

use config::StorageConfig;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redis::RedisStore;
pub use result::{CostResult, RateResult, TokenResult};

/// Backend-agnostic contract for counting rate, cost and token budgets, plus
/// a small generic key-value facility used for auxiliary state (e.g.
/// penalties). See SPEC_FULL.md §4.1 for the full semantics.
#[allow(async_fn_in_trait)]
pub trait CounterStore: Send + Sync {
    /// Atomically check and increment a fixed-window counter, with an
    /// optional fixed burst allowance consumed once the steady limit is hit.
    async fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        burst: Option<u32>,
    ) -> Result<RateResult, StoreError>;

    /// Read-only variant of `check_rate`: never increments, returns a
    /// zero-state result for a key with no live window.
    async fn peek_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateResult, StoreError>;

    /// Atomically increment a cost accumulator, rejecting (without
    /// incrementing) once `current + cost` would exceed `cap`. The window's
    /// TTL is set on first use and never reset by subsequent calls.
    async fn increment_cost(&self, key: &str, cost: f64, window_secs: u64, cap: f64) -> Result<CostResult, StoreError>;

    /// Atomically increment a token accumulator, rejecting (without
    /// incrementing) once `current + tokens` would exceed `limit`.
    async fn increment_tokens(
        &self,
        key: &str,
        tokens: u32,
        window_secs: u64,
        limit: u32,
    ) -> Result<TokenResult, StoreError>;

    /// Read a generic value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a generic value, with an optional TTL in seconds.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), StoreError>;

    /// Delete a generic value.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Health check.
    async fn ping(&self) -> Result<bool, StoreError>;

    /// Release backend resources (connections, background tasks).
    async fn close(&self);
}

/// A constructed store, ready to be shared across the policy engine.
///
/// This is the one place that knows about both backends; callers depend
/// only on [`CounterStore`].
pub enum AnyStore {
    /// Process-local LRU store.
    Memory(InMemoryStore),
    /// Redis store, wrapped in a circuit breaker for fail-open/fail-closed
    /// degradation on transient failures.
    Redis(CircuitBreaker<RedisStore>),
}

impl AnyStore {
    /// Construct the configured backend.
    pub async fn from_config(config: &StorageConfig) -> Result<Arc<Self>, StoreError> {
        let store = match config {
            StorageConfig::Memory(memory_config) => AnyStore::Memory(InMemoryStore::new(memory_config)?),
            StorageConfig::Redis(redis_config) => {
                let redis_store = RedisStore::connect(redis_config).await?;

                AnyStore::Redis(CircuitBreaker::new(
                    redis_store,
                    redis_config.circuit_breaker,
                    redis_config.on_error,
                ))
            }
        };

        Ok(Arc::new(store))
    }
}

impl CounterStore for AnyStore {
    async fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        burst: Option<u32>,
    ) -> Result<RateResult, StoreError> {
        match self {
            AnyStore::Memory(s) => s.check_rate(key, limit, window_secs, burst).await,
            AnyStore::Redis(s) => s.check_rate(key, limit, window_secs, burst).await,
        }
    }

    async fn peek_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateResult, StoreError> {
        match self {
            AnyStore::Memory(s) => s.peek_rate(key, limit, window_secs).await,
            AnyStore::Redis(s) => s.peek_rate(key, limit, window_secs).await,
        }
    }

    async fn increment_cost(&self, key: &str, cost: f64, window_secs: u64, cap: f64) -> Result<CostResult, StoreError> {
        match self {
            AnyStore::Memory(s) => s.increment_cost(key, cost, window_secs, cap).await,
            AnyStore::Redis(s) => s.increment_cost(key, cost, window_secs, cap).await,
        }
    }

    async fn increment_tokens(
        &self,
        key: &str,
        tokens: u32,
        window_secs: u64,
        limit: u32,
    ) -> Result<TokenResult, StoreError> {
        match self {
            AnyStore::Memory(s) => s.increment_tokens(key, tokens, window_secs, limit).await,
            AnyStore::Redis(s) => s.increment_tokens(key, tokens, window_secs, limit).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            AnyStore::Memory(s) => s.get(key).await,
            AnyStore::Redis(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.set(key, value, ttl_secs).await,
            AnyStore::Redis(s) => s.set(key, value, ttl_secs).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.delete(key).await,
            AnyStore::Redis(s) => s.delete(key).await,
        }
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        match self {
            AnyStore::Memory(s) => s.ping().await,
            AnyStore::Redis(s) => s.ping().await,
        }
    }

    async fn close(&self) {
        match self {
            AnyStore::Memory(s) => s.close().await,
            AnyStore::Redis(s) => s.close().await,
        }
    }
}
