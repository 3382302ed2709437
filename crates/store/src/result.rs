//! Result types returned by [`crate::CounterStore`] operations.

/// Outcome of a `check_rate`/`peek_rate` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateResult {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Requests counted in the current window, including this one if admitted.
    pub current: u32,
    /// The configured limit.
    pub limit: u32,
    /// Requests still available in the current window (0 if exhausted).
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
    /// Burst tokens remaining, if the rule has a burst allowance.
    pub burst_tokens: Option<u32>,
}

impl RateResult {
    /// A fail-open result: admit without having touched the backend.
    pub fn fail_open(limit: u32) -> Self {
        Self {
            allowed: true,
            current: 0,
            limit,
            remaining: limit,
            reset_in_seconds: 0,
            burst_tokens: None,
        }
    }
}

/// Outcome of an `increment_cost` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostResult {
    /// Whether the increment was admitted (and applied).
    pub allowed: bool,
    /// Cost accumulated in the current window after this call, if admitted;
    /// the pre-call value if rejected (a rejected increment never applies).
    pub current: f64,
    /// The configured cap.
    pub cap: f64,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
}

/// Outcome of an `increment_tokens` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenResult {
    /// Whether the increment was admitted (and applied).
    pub allowed: bool,
    /// Tokens accumulated in the current window after this call, if admitted.
    pub current: u32,
    /// The configured limit.
    pub limit: u32,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
}
