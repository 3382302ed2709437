//! Policy data model: rate, cost and concurrency rules, and how they attach
//! to a plan and an endpoint.

use std::collections::BTreeMap;

use serde::Deserialize;

/// What to do once a rule's budget has been exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionOnExceed {
    /// Reject the request.
    Block,
    /// Admit the request, but delay the response by `slowdown_ms`.
    Slowdown,
    /// Admit the request, but emit a tracking event.
    AllowAndLog,
    /// Admit the request with no side effect beyond the usual `allowed` event.
    Allow,
}

/// Error raised when a config section fails its construction-time invariant.
#[derive(Debug, thiserror::Error)]
pub enum PolicyConfigError {
    /// A rate rule specified zero or more than one window.
    #[error("rate rule for {0:?} must set exactly one of max_per_second/minute/hour/day, found {1}")]
    RateWindowCount(String, usize),
    /// A cost rule specified zero or more than one cap.
    #[error("cost rule for {0:?} must set exactly one of hourly_cap/daily_cap, found {1}")]
    CostCapCount(String, usize),
    /// `action_on_exceed = slowdown` without `slowdown_ms`.
    #[error("rate rule for {0:?} uses action slowdown but sets no slowdown_ms")]
    MissingSlowdown(String),
    /// An endpoint policy declared none of rate/cost/concurrency.
    #[error("endpoint policy for {0:?} declares none of rate, cost or concurrency")]
    EmptyEndpointPolicy(String),
    /// `concurrency.max` was zero.
    #[error("concurrency config for {0:?} has max = 0")]
    ZeroConcurrency(String),
}

/// One rate-limiting window, exactly one of which must be set.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RateWindowLimits {
    /// Requests allowed per second.
    pub max_per_second: Option<u32>,
    /// Requests allowed per minute.
    pub max_per_minute: Option<u32>,
    /// Requests allowed per hour.
    pub max_per_hour: Option<u32>,
    /// Requests allowed per day.
    pub max_per_day: Option<u32>,
}

/// The effective window for a rate rule: a limit and the window length in
/// seconds it applies over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    /// Maximum admitted requests in the window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateWindowLimits {
    fn resolve(&self, label: &str) -> Result<ResolvedWindow, PolicyConfigError> {
        let candidates = [
            self.max_per_second.map(|l| (l, 1)),
            self.max_per_minute.map(|l| (l, 60)),
            self.max_per_hour.map(|l| (l, 3_600)),
            self.max_per_day.map(|l| (l, 86_400)),
        ];

        let set: Vec<_> = candidates.into_iter().flatten().collect();

        match set.as_slice() {
            [(limit, window_secs)] => Ok(ResolvedWindow {
                limit: *limit,
                window_secs: *window_secs,
            }),
            other => Err(PolicyConfigError::RateWindowCount(label.to_string(), other.len())),
        }
    }
}

/// Token budget windows, independent from the request-rate window.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TokenWindowLimits {
    /// Tokens allowed per minute.
    pub max_tokens_per_minute: Option<u32>,
    /// Tokens allowed per hour.
    pub max_tokens_per_hour: Option<u32>,
    /// Tokens allowed per day.
    pub max_tokens_per_day: Option<u32>,
}

impl TokenWindowLimits {
    /// Every configured token window as `(limit, window_secs)`, evaluated
    /// independently — §4.4 point 3 checks each one in turn.
    pub fn windows(&self) -> Vec<ResolvedWindow> {
        [
            self.max_tokens_per_minute.map(|l| (l, 60)),
            self.max_tokens_per_hour.map(|l| (l, 3_600)),
            self.max_tokens_per_day.map(|l| (l, 86_400)),
        ]
        .into_iter()
        .flatten()
        .map(|(limit, window_secs)| ResolvedWindow { limit, window_secs })
        .collect()
    }

    fn is_empty(&self) -> bool {
        self.max_tokens_per_minute.is_none() && self.max_tokens_per_hour.is_none() && self.max_tokens_per_day.is_none()
    }
}

/// A request-rate rule, with an optional burst allowance and optional token
/// budgets layered on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateRule {
    /// The request-rate window (exactly one of its fields must be set).
    #[serde(flatten)]
    pub window: RateWindowLimits,
    /// Extra requests allowed once the steady window is exhausted, fixed per
    /// window rather than continuously refilled.
    #[serde(default)]
    pub burst: Option<u32>,
    /// Token budgets, checked independently of the request-rate window.
    #[serde(flatten)]
    pub tokens: TokenWindowLimits,
    /// What happens once the rate window (not the token windows) is exceeded.
    pub action_on_exceed: ActionOnExceed,
    /// Delay applied when `action_on_exceed = slowdown`.
    #[serde(default)]
    pub slowdown_ms: Option<u64>,
}

impl RateRule {
    /// Validate and resolve this rule's window, failing fast on a
    /// misconfigured rule rather than misbehaving at request time.
    pub fn resolved_window(&self, label: &str) -> Result<ResolvedWindow, PolicyConfigError> {
        self.window.resolve(label)
    }

    fn validate(&self, label: &str) -> Result<(), PolicyConfigError> {
        self.resolved_window(label)?;

        if self.action_on_exceed == ActionOnExceed::Slowdown && self.slowdown_ms.is_none() {
            return Err(PolicyConfigError::MissingSlowdown(label.to_string()));
        }

        Ok(())
    }

    /// Whether any token budget is configured.
    pub fn has_token_limits(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// A cost-budget rule. `estimate_cost` is supplied by the adapter at request
/// time; this struct only carries the cap and the action.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostRule {
    /// Budget cap over a rolling hour.
    #[serde(default)]
    pub hourly_cap: Option<f64>,
    /// Budget cap over a rolling day.
    #[serde(default)]
    pub daily_cap: Option<f64>,
    /// What happens once the cap is exceeded. Cost rules never slow down —
    /// `slowdown` degrades to `block` at evaluation time.
    pub action_on_exceed: ActionOnExceed,
}

impl CostRule {
    /// Resolve to `(cap, window_secs)`, preferring the daily cap when both
    /// are set, per §4.4 step 4.
    pub fn resolved_cap(&self, label: &str) -> Result<(f64, u64), PolicyConfigError> {
        match (self.hourly_cap, self.daily_cap) {
            (_, Some(daily)) => Ok((daily, 86_400)),
            (Some(hourly), None) => Ok((hourly, 3_600)),
            (None, None) => Err(PolicyConfigError::CostCapCount(label.to_string(), 0)),
        }
    }

    fn validate(&self, label: &str) -> Result<(), PolicyConfigError> {
        self.resolved_cap(label)?;
        Ok(())
    }
}

/// What to do when the concurrency limit is reached and the queue is full
/// or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyAction {
    /// Wait in the priority queue.
    #[default]
    Queue,
    /// Reject immediately.
    Block,
}

/// Bounded-parallelism configuration for one endpoint policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Maximum number of concurrently admitted requests.
    pub max: u32,
    /// How long a queued waiter may wait before it times out.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Maximum number of waiters allowed to queue at once.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// What to do once `max` is reached.
    #[serde(default)]
    pub action_on_exceed: ConcurrencyAction,
    /// Seconds of waiting time that reduce a waiter's effective priority by one.
    #[serde(default = "default_priority_aging_seconds")]
    pub priority_aging_seconds: u64,
}

fn default_queue_timeout_secs() -> u64 {
    30
}

fn default_max_queue_size() -> usize {
    1_000
}

fn default_priority_aging_seconds() -> u64 {
    5
}

impl ConcurrencyConfig {
    fn validate(&self, label: &str) -> Result<(), PolicyConfigError> {
        if self.max == 0 {
            return Err(PolicyConfigError::ZeroConcurrency(label.to_string()));
        }

        Ok(())
    }
}

/// The rules attached to one `(plan, endpoint)` pair (or a plan's defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointPolicy {
    /// Rate-limiting rule.
    pub rate: Option<RateRule>,
    /// Cost-budget rule.
    pub cost: Option<CostRule>,
    /// Concurrency admission rule.
    pub concurrency: Option<ConcurrencyConfig>,
}

impl EndpointPolicy {
    /// Validate this policy, erroring if it declares nothing at all.
    pub fn validate(&self, label: &str) -> Result<(), PolicyConfigError> {
        if self.rate.is_none() && self.cost.is_none() && self.concurrency.is_none() {
            return Err(PolicyConfigError::EmptyEndpointPolicy(label.to_string()));
        }

        if let Some(rate) = &self.rate {
            rate.validate(label)?;
        }

        if let Some(cost) = &self.cost {
            cost.validate(label)?;
        }

        if let Some(concurrency) = &self.concurrency {
            concurrency.validate(label)?;
        }

        Ok(())
    }
}

/// One plan's policy: per-endpoint overrides plus an optional fallback
/// applied to endpoints with no specific entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PlanPolicy {
    /// Endpoint key (`METHOD|/normalized/path`) to policy.
    pub endpoints: BTreeMap<String, EndpointPolicy>,
    /// Fallback policy for endpoints with no specific entry.
    pub defaults: Option<EndpointPolicy>,
}

/// The full policy table: plan tag to [`PlanPolicy`].
pub type PolicyConfig = BTreeMap<String, PlanPolicy>;

/// Validate every rule in a [`PolicyConfig`], failing at load time rather
/// than at first request.
pub fn validate_policy_config(policies: &PolicyConfig) -> Result<(), PolicyConfigError> {
    for (plan, plan_policy) in policies {
        if let Some(defaults) = &plan_policy.defaults {
            defaults.validate(&format!("{plan}.defaults"))?;
        }

        for (endpoint, policy) in &plan_policy.endpoints {
            policy.validate(&format!("{plan}.{endpoint}"))?;
        }
    }

    Ok(())
}

/// A caller-specific override of a plan's rate limits. Any field outside
/// `(0, inf)` is silently discarded rather than rejected — see §3.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RateOverride {
    /// Override for `max_per_second`.
    pub max_per_second: Option<f64>,
    /// Override for `max_per_minute`.
    pub max_per_minute: Option<f64>,
    /// Override for `max_per_hour`.
    pub max_per_hour: Option<f64>,
    /// Override for `max_per_day`.
    pub max_per_day: Option<f64>,
    /// Override for `burst`.
    pub burst: Option<f64>,
}

impl RateOverride {
    /// Apply this override onto a base rule, discarding any field that is
    /// not a finite positive number and keeping the base value instead.
    pub fn apply(&self, base: &RateWindowLimits, base_burst: Option<u32>) -> (RateWindowLimits, Option<u32>) {
        fn valid(value: Option<f64>) -> Option<u32> {
            value.filter(|v| v.is_finite() && *v > 0.0).map(|v| v as u32)
        }

        let window = RateWindowLimits {
            max_per_second: valid(self.max_per_second).or(base.max_per_second),
            max_per_minute: valid(self.max_per_minute).or(base.max_per_minute),
            max_per_hour: valid(self.max_per_hour).or(base.max_per_hour),
            max_per_day: valid(self.max_per_day).or(base.max_per_day),
        };

        let burst = valid(self.burst).or(base_burst);

        (window, burst)
    }
}

/// A per-identity override of a plan's policy: a global rate override, plus
/// endpoint-scoped overrides that take precedence over it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct UserOverride {
    /// Override applied to every endpoint unless a more specific one exists.
    pub rate: Option<RateOverride>,
    /// Endpoint-scoped overrides, keyed the same way as [`PlanPolicy::endpoints`].
    pub endpoints: BTreeMap<String, RateOverride>,
}

impl UserOverride {
    /// The override to apply for one endpoint: the endpoint-scoped fields
    /// merged over the global ones, field by field, with the endpoint's
    /// value winning wherever both are set.
    pub fn for_endpoint(&self, endpoint: &str) -> Option<RateOverride> {
        let specific = self.endpoints.get(endpoint);
        if self.rate.is_none() && specific.is_none() {
            return None;
        }

        let empty = RateOverride::default();
        let global = self.rate.as_ref().unwrap_or(&empty);
        let specific = specific.unwrap_or(&empty);

        Some(RateOverride {
            max_per_second: specific.max_per_second.or(global.max_per_second),
            max_per_minute: specific.max_per_minute.or(global.max_per_minute),
            max_per_hour: specific.max_per_hour.or(global.max_per_hour),
            max_per_day: specific.max_per_day.or(global.max_per_day),
            burst: specific.burst.or(global.burst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_rule_requires_exactly_one_window() {
        let toml = r#"
            max_per_minute = 10
            max_per_hour = 100
            action_on_exceed = "block"
        "#;

        let rule: RateRule = toml::from_str(toml).unwrap();
        assert!(matches!(
            rule.resolved_window("t"),
            Err(PolicyConfigError::RateWindowCount(_, 2))
        ));
    }

    #[test]
    fn rate_rule_resolves_single_window() {
        let toml = r#"
            max_per_minute = 10
            burst = 3
            action_on_exceed = "block"
        "#;

        let rule: RateRule = toml::from_str(toml).unwrap();
        let resolved = rule.resolved_window("t").unwrap();
        assert_eq!(resolved.limit, 10);
        assert_eq!(resolved.window_secs, 60);
    }

    #[test]
    fn slowdown_without_delay_is_rejected() {
        let rule = RateRule {
            window: RateWindowLimits {
                max_per_minute: Some(5),
                ..Default::default()
            },
            burst: None,
            tokens: TokenWindowLimits::default(),
            action_on_exceed: ActionOnExceed::Slowdown,
            slowdown_ms: None,
        };

        assert!(matches!(rule.validate("t"), Err(PolicyConfigError::MissingSlowdown(_))));
    }

    #[test]
    fn cost_rule_prefers_daily_cap() {
        let rule = CostRule {
            hourly_cap: Some(1.0),
            daily_cap: Some(10.0),
            action_on_exceed: ActionOnExceed::Block,
        };

        assert_eq!(rule.resolved_cap("t").unwrap(), (10.0, 86_400));
    }

    #[test]
    fn invalid_override_values_are_discarded() {
        let base = RateWindowLimits {
            max_per_minute: Some(10),
            ..Default::default()
        };

        let over = RateOverride {
            max_per_minute: Some(f64::NAN),
            max_per_hour: Some(-1.0),
            max_per_day: Some(f64::INFINITY),
            ..Default::default()
        };

        let (resolved, _) = over.apply(&base, None);
        assert_eq!(resolved.max_per_minute, Some(10));
        assert_eq!(resolved.max_per_hour, None);
        assert_eq!(resolved.max_per_day, None);
    }

    #[test]
    fn valid_override_wins_over_base() {
        let base = RateWindowLimits {
            max_per_minute: Some(10),
            ..Default::default()
        };

        let over = RateOverride {
            max_per_minute: Some(50.0),
            ..Default::default()
        };

        let (resolved, _) = over.apply(&base, None);
        assert_eq!(resolved.max_per_minute, Some(50));
    }

    #[test]
    fn empty_endpoint_policy_rejected() {
        let policy = EndpointPolicy::default();
        assert!(matches!(
            policy.validate("t"),
            Err(PolicyConfigError::EmptyEndpointPolicy(_))
        ));
    }
}
