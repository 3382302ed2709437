//! Error types for the counter store.

/// Errors a [`crate::CounterStore`] implementation can raise.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A transient backend failure: network, timeout, or a 5xx-equivalent
    /// response. Subject to the circuit breaker and the configured
    /// fail-open/fail-closed policy.
    #[error("counter store transient failure: {0}")]
    Transient(String),

    /// A non-recoverable backend failure: protocol error, authentication
    /// failure, or malformed response. Always propagated.
    #[error("counter store fatal failure: {0}")]
    Fatal(String),

    /// Invalid construction-time configuration (bad URL, zero pool size).
    #[error("counter store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether this error should be handled via the store's degradation
    /// policy (fail-open/fail-closed) rather than always propagated.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
