//! The policy engine's outcome type, per SPEC_FULL.md §4.4.

use config::ActionOnExceed;

/// What the middleware should do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// No rule applied, or every rule admitted cleanly.
    Admit,
    /// Reject the request.
    Block,
    /// Admit, but delay the response.
    Slowdown,
    /// Admit, with a tracking event emitted.
    AllowAndLog,
}

/// The counter state behind a decision, used to populate `RateLimit-*`
/// response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionDetails {
    /// Requests/cost/tokens used so far in the current window.
    pub used: f64,
    /// The configured limit or cap.
    pub limit: f64,
    /// Budget remaining in the current window.
    pub remaining: f64,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
    /// Remaining burst tokens, when the rule configures a burst allowance.
    pub burst_tokens: Option<u32>,
}

impl DecisionDetails {
    /// Build details from a rate-check result.
    pub fn from_rate(result: &store::RateResult) -> Self {
        Self {
            used: result.current as f64,
            limit: result.limit as f64,
            remaining: result.remaining as f64,
            reset_in_seconds: result.reset_in_seconds,
            burst_tokens: result.burst_tokens,
        }
    }

    /// Build details from a token-check result.
    pub fn from_tokens(result: &store::TokenResult) -> Self {
        Self {
            used: result.current as f64,
            limit: result.limit as f64,
            remaining: (result.limit.saturating_sub(result.current)) as f64,
            reset_in_seconds: result.reset_in_seconds,
            burst_tokens: None,
        }
    }

    /// Build details from a cost-check result.
    pub fn from_cost(result: &store::CostResult) -> Self {
        Self {
            used: result.current,
            limit: result.cap,
            remaining: (result.cap - result.current).max(0.0),
            reset_in_seconds: result.reset_in_seconds,
            burst_tokens: None,
        }
    }
}

/// The policy engine's per-request outcome.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// What the middleware should do about it.
    pub action: DecisionAction,
    /// Machine-readable reason tag (`rate_limited`, `cost_exceeded`, ...),
    /// present on any non-admit outcome.
    pub reason: Option<&'static str>,
    /// Seconds the caller should wait before retrying, on rejection.
    pub retry_after_seconds: Option<u64>,
    /// Delay to apply before proceeding, when `action = Slowdown`.
    pub slowdown_ms: Option<u64>,
    /// Counter state for response headers.
    pub details: DecisionDetails,
}

impl Decision {
    /// No policy matched this `(plan, endpoint)`: admit with empty details.
    pub fn admit_trivial() -> Self {
        Self {
            allowed: true,
            action: DecisionAction::Admit,
            reason: None,
            retry_after_seconds: None,
            slowdown_ms: None,
            details: DecisionDetails::default(),
        }
    }

    /// Every configured rule passed: admit, carrying the rate check's
    /// details (or empty details if no rate rule was configured).
    pub fn admit(details: DecisionDetails) -> Self {
        Self {
            allowed: true,
            action: DecisionAction::Admit,
            reason: None,
            retry_after_seconds: None,
            slowdown_ms: None,
            details,
        }
    }

    /// Build the terminal decision for one exceeded rule, per the §4.4
    /// action-mapping table. Cost rules never slow down; callers degrade
    /// `Slowdown` to `Block` before calling this for a cost violation.
    pub fn exceeded(
        action_on_exceed: ActionOnExceed,
        slowdown_ms: Option<u64>,
        reason: &'static str,
        details: DecisionDetails,
    ) -> Self {
        match action_on_exceed {
            ActionOnExceed::Block => Self {
                allowed: false,
                action: DecisionAction::Block,
                reason: Some(reason),
                retry_after_seconds: Some(details.reset_in_seconds),
                slowdown_ms: None,
                details,
            },
            ActionOnExceed::Slowdown => Self {
                allowed: true,
                action: DecisionAction::Slowdown,
                reason: Some(reason),
                retry_after_seconds: None,
                slowdown_ms,
                details,
            },
            ActionOnExceed::AllowAndLog => Self {
                allowed: true,
                action: DecisionAction::AllowAndLog,
                reason: Some(reason),
                retry_after_seconds: None,
                slowdown_ms: None,
                details,
            },
            ActionOnExceed::Allow => Self::admit(details),
        }
    }
}
