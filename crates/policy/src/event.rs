//! The event taxonomy emitted by the policy engine, per SPEC_FULL.md §4.4/§6.

use serde::Serialize;

/// The kind of occurrence an [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Request admitted with no budget violation.
    Allowed,
    /// Request rejected (`action_on_exceed = block`).
    Blocked,
    /// A rate window was exceeded.
    RateExceeded,
    /// A cost cap was exceeded.
    CostExceeded,
    /// A token window was exceeded.
    TokenLimitExceeded,
    /// Every configured token window accepted the increment.
    TokenUsageTracked,
    /// A slowdown delay was applied.
    SlowdownApplied,
    /// The caller's IP matched the configured blocklist.
    IpBlocked,
}

/// One occurrence recorded by the policy engine or middleware, fanned out to
/// every registered [`crate::EventBus`] handler.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unix epoch seconds at emission time.
    pub timestamp: u64,
    /// The caller's sanitized user key.
    pub user: String,
    /// The caller's plan tag.
    pub plan: String,
    /// The normalized endpoint key.
    pub endpoint: String,
    /// What kind of occurrence this is.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Window length in seconds, when relevant.
    pub window: Option<u64>,
    /// The observed counter value, when relevant.
    pub value: Option<f64>,
    /// The configured limit/cap, when relevant.
    pub threshold: Option<f64>,
    /// Token count, for token-related events.
    pub tokens: Option<u32>,
}

impl Event {
    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Build an event with only the fields common to every occurrence;
    /// callers fill in `window`/`value`/`threshold`/`tokens` as needed.
    pub fn new(user: impl Into<String>, plan: impl Into<String>, endpoint: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Self::now(),
            user: user.into(),
            plan: plan.into(),
            endpoint: endpoint.into(),
            event_type,
            window: None,
            value: None,
            threshold: None,
            tokens: None,
        }
    }

    /// Attach window/value/threshold budget details.
    pub fn with_budget(mut self, window: u64, value: f64, threshold: f64) -> Self {
        self.window = Some(window);
        self.value = Some(value);
        self.threshold = Some(threshold);
        self
    }

    /// Attach a token count.
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }
}
