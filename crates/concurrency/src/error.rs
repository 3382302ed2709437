use thiserror::Error;

/// Failure modes for [`crate::ConcurrencyLimiter::acquire`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// `actionOnExceed = block` and the limit was already reached.
    #[error("concurrency limit reached")]
    LimitReached,
    /// The queue itself is full (`actionOnExceed = queue`).
    #[error("concurrency queue is full")]
    QueueFull,
    /// The waiter's `queue_timeout_secs` elapsed before a slot freed up.
    #[error("timed out waiting for a concurrency slot")]
    QueueTimeout,
    /// The queue was cleared (e.g. during shutdown or a test reset) while
    /// this waiter was still enqueued.
    #[error("concurrency queue was cleared")]
    QueueCleared,
}
