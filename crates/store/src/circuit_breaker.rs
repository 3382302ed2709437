//! Circuit breaker wrapping a distributed [`crate::CounterStore`], so a
//! struggling backend degrades instead of taking every request down with it.

use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use config::{CircuitBreakerConfig, OnError};

use crate::error::StoreError;
use crate::result::{CostResult, RateResult, TokenResult};

/// The breaker's two observable states. There is no half-open state: once
/// the timeout elapses the breaker optimistically closes again and the next
/// call either confirms health (closing for good) or re-opens it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through to the backend.
    Closed,
    /// Calls short-circuit to a fail-open/fail-closed result.
    Open,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;

/// Wraps any [`crate::CounterStore`] and trips to `Open` after
/// `failure_threshold` consecutive transient failures, auto-healing after
/// `timeout_secs`.
pub struct CircuitBreaker<S> {
    inner: S,
    config: CircuitBreakerConfig,
    on_error: OnError,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl<S> CircuitBreaker<S> {
    /// Wrap `inner` with the given breaker tuning and degradation policy.
    pub fn new(inner: S, config: CircuitBreakerConfig, on_error: OnError) -> Self {
        Self {
            inner,
            config,
            on_error,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    /// Current observable state, healing an expired `Open` back to `Closed`.
    pub fn state(&self) -> CircuitState {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return CircuitState::Closed;
        }

        let elapsed = self.opened_at.read().unwrap().map(|t| t.elapsed());

        match elapsed {
            Some(elapsed) if elapsed >= Duration::from_secs(self.config.timeout_secs) => {
                self.state.store(CLOSED, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                CircuitState::Closed
            }
            _ => CircuitState::Open,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if failures >= self.config.failure_threshold {
            self.state.store(OPEN, Ordering::Release);
            *self.opened_at.write().unwrap() = Some(Instant::now());
            log::warn!(
                "counter store circuit breaker opened after {failures} consecutive failures; \
                 will retry in {}s",
                self.config.timeout_secs
            );
        }
    }

    async fn guarded<T>(&self, fallback: impl FnOnce() -> T, op: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        if self.state() == CircuitState::Open {
            return Ok(fallback());
        }

        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.is_transient() => {
                self.record_failure();

                match self.on_error {
                    OnError::FailOpen => Ok(fallback()),
                    OnError::FailClosed => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: crate::CounterStore> crate::CounterStore for CircuitBreaker<S> {
    async fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        burst: Option<u32>,
    ) -> Result<RateResult, StoreError> {
        self.guarded(
            || RateResult::fail_open(limit),
            self.inner.check_rate(key, limit, window_secs, burst),
        )
        .await
    }

    async fn peek_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateResult, StoreError> {
        self.guarded(|| RateResult::fail_open(limit), self.inner.peek_rate(key, limit, window_secs))
            .await
    }

    async fn increment_cost(&self, key: &str, cost: f64, window_secs: u64, cap: f64) -> Result<CostResult, StoreError> {
        self.guarded(
            || CostResult {
                allowed: true,
                current: 0.0,
                cap,
                reset_in_seconds: 0,
            },
            self.inner.increment_cost(key, cost, window_secs, cap),
        )
        .await
    }

    async fn increment_tokens(
        &self,
        key: &str,
        tokens: u32,
        window_secs: u64,
        limit: u32,
    ) -> Result<TokenResult, StoreError> {
        self.guarded(
            || TokenResult {
                allowed: true,
                current: 0,
                limit,
                reset_in_seconds: 0,
            },
            self.inner.increment_tokens(key, tokens, window_secs, limit),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.guarded(|| None, self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        self.guarded(|| (), self.inner.set(key, value, ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guarded(|| (), self.inner.delete(key)).await
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        self.guarded(|| false, self.inner.ping()).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use config::{CircuitBreakerConfig, OnError};

    use super::*;
    use crate::CounterStore;

    /// A store double that fails its first `fail_count` calls, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        fail_count: u32,
    }

    impl crate::CounterStore for Flaky {
        async fn check_rate(&self, _: &str, limit: u32, _: u64, _: Option<u32>) -> Result<RateResult, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            if call < self.fail_count {
                Err(StoreError::Transient("boom".to_string()))
            } else {
                Ok(RateResult {
                    allowed: true,
                    current: 1,
                    limit,
                    remaining: limit - 1,
                    reset_in_seconds: 60,
                    burst_tokens: None,
                })
            }
        }

        async fn peek_rate(&self, _: &str, limit: u32, _: u64) -> Result<RateResult, StoreError> {
            Ok(RateResult::fail_open(limit))
        }

        async fn increment_cost(&self, _: &str, _: f64, _: u64, cap: f64) -> Result<CostResult, StoreError> {
            Ok(CostResult {
                allowed: true,
                current: 0.0,
                cap,
                reset_in_seconds: 0,
            })
        }

        async fn increment_tokens(&self, _: &str, _: u32, _: u64, limit: u32) -> Result<TokenResult, StoreError> {
            Ok(TokenResult {
                allowed: true,
                current: 0,
                limit,
                reset_in_seconds: 0,
            })
        }

        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        async fn set(&self, _: &str, _: Vec<u8>, _: Option<u64>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn ping(&self) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_open() {
        let flaky = Flaky {
            calls: AtomicU32::new(0),
            fail_count: 10,
        };

        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            timeout_secs: 3600,
        };

        let breaker = CircuitBreaker::new(flaky, config, OnError::FailOpen);

        for _ in 0..3 {
            let result = breaker.check_rate("k", 10, 60, None).await.unwrap();
            assert!(result.allowed);
        }

        assert_eq!(breaker.state(), CircuitState::Open);

        // breaker is open: no further calls reach the backend.
        let before = breaker.inner.calls.load(Ordering::SeqCst);
        let result = breaker.check_rate("k", 10, 60, None).await.unwrap();
        assert!(result.allowed);
        assert_eq!(breaker.inner.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn fail_closed_propagates_transient_errors() {
        let flaky = Flaky {
            calls: AtomicU32::new(0),
            fail_count: 10,
        };

        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            timeout_secs: 3600,
        };

        let breaker = CircuitBreaker::new(flaky, config, OnError::FailClosed);

        let result = breaker.check_rate("k", 10, 60, None).await;
        assert!(result.is_err());
    }
}
