use config::{ConcurrencyAction, ConcurrencyConfig};
use dashmap::DashMap;

use crate::limiter::ConcurrencyLimiter;

/// Shared table of limiters keyed by `(endpoint, max, action_on_exceed)`, so
/// two endpoints (or the same endpoint reconfigured) never alias a limiter
/// meant for a different config.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: DashMap<(String, u32, ConcurrencyAction), ConcurrencyLimiter>,
}

impl LimiterRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the limiter for `(endpoint, config)`, creating it on first use.
    pub fn get_or_create(&self, endpoint: &str, config: &ConcurrencyConfig) -> ConcurrencyLimiter {
        let key = (endpoint.to_string(), config.max, config.action_on_exceed);

        self.limiters
            .entry(key)
            .or_insert_with(|| ConcurrencyLimiter::new(config))
            .clone()
    }

    /// Drop every limiter, discarding in-flight state. Intended for test
    /// isolation between cases that share a process-wide registry.
    pub fn clear_all(&self) {
        self.limiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: u32) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max,
            queue_timeout_secs: 30,
            max_queue_size: 10,
            action_on_exceed: ConcurrencyAction::Queue,
            priority_aging_seconds: 5,
        }
    }

    #[test]
    fn distinct_configs_on_same_endpoint_do_not_alias() {
        let registry = LimiterRegistry::new();

        let a = registry.get_or_create("/v1/chat", &config(5));
        let b = registry.get_or_create("/v1/chat", &config(10));

        assert_eq!(a.stats().available, 5);
        assert_eq!(b.stats().available, 10);
    }

    #[test]
    fn same_config_reuses_the_limiter() {
        let registry = LimiterRegistry::new();

        let a = registry.get_or_create("/v1/chat", &config(5));
        let b = registry.get_or_create("/v1/chat", &config(5));

        assert_eq!(a.stats().running, b.stats().running);
    }
}
