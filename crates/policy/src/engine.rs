//! C5: sequences rate → token → cost checks on a [`CounterStore`] using the
//! policy resolved by [`crate::PolicyResolver`], classifies the outcome, and
//! emits exactly one terminal event. See SPEC_FULL.md §4.4.

use std::sync::Arc;

use config::{ActionOnExceed, EndpointPolicy, Identity, PolicyConfig, UserOverride};
use store::CounterStore;

use crate::bus::EventBus;
use crate::decision::{Decision, DecisionDetails};
use crate::error::PolicyError;
use crate::event::{Event, EventType};
use crate::key;
use crate::resolver::PolicyResolver;

/// Everything the engine needs to evaluate one request. Cost and token
/// figures are precomputed estimates supplied by the adapter (§9): the
/// engine treats them as plain numbers, never computing them itself.
pub struct CheckContext<'a> {
    /// The caller's resolved identity.
    pub identity: &'a Identity,
    /// The normalized endpoint key.
    pub endpoint: &'a str,
    /// Pre-estimated token count for this request, if the adapter exposes one.
    pub tokens: u32,
    /// Pre-estimated monetary cost for this request, if a cost rule applies.
    pub cost: Option<f64>,
    /// Per-route policy override, taking precedence over the plan table.
    pub route_override: Option<&'a EndpointPolicy>,
    /// Per-identity override of numeric rate limits.
    pub user_override: Option<&'a UserOverride>,
}

/// The policy evaluation engine, bound to one counter store and one event bus.
pub struct PolicyEngine<S> {
    store: Arc<S>,
    bus: Arc<EventBus>,
}

impl<S: CounterStore> PolicyEngine<S> {
    /// Build an engine over a counter store and the bus its decisions are
    /// reported to.
    pub fn new(store: Arc<S>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Evaluate one request against the resolved policy, in strict order:
    /// resolve → rate → tokens → cost → admit. See SPEC_FULL.md §4.4.
    pub async fn check(&self, policies: &PolicyConfig, ctx: &CheckContext<'_>) -> Result<Decision, PolicyError> {
        let resolver = PolicyResolver::new(policies);

        let Some(policy) = resolver.resolve(&ctx.identity.plan, ctx.endpoint, ctx.route_override, ctx.user_override) else {
            self.emit(ctx, EventType::Allowed, None, None, None, None).await;
            return Ok(Decision::admit_trivial());
        };

        let mut details = DecisionDetails::default();

        if let Some(rate) = &policy.rate {
            let window = rate.resolved_window(ctx.endpoint).expect("rate rule validated at config load time");
            let rate_key = key::counter_key("rate", ctx.identity, ctx.endpoint);
            let result = self.store.check_rate(&rate_key, window.limit, window.window_secs, rate.burst).await?;

            details = DecisionDetails::from_rate(&result);

            if !result.allowed {
                self.emit(
                    ctx,
                    classify(rate.action_on_exceed, EventType::RateExceeded),
                    Some(window.window_secs),
                    Some(f64::from(result.current)),
                    Some(f64::from(result.limit)),
                    None,
                )
                .await;

                if rate.action_on_exceed != ActionOnExceed::Allow {
                    return Ok(Decision::exceeded(rate.action_on_exceed, rate.slowdown_ms, "rate_limited", details));
                }
            }

            if ctx.tokens > 0 && rate.has_token_limits() {
                for token_window in rate.tokens.windows() {
                    // Each token window is an independent counter: folding
                    // `window_secs` into the key keeps a maxTokensPerMinute
                    // and a maxTokensPerHour rule on the same rate rule from
                    // sharing one entry (and one TTL).
                    let token_key = format!("{}:{}", key::counter_key("tokens", ctx.identity, ctx.endpoint), token_window.window_secs);

                    let token_result = self
                        .store
                        .increment_tokens(&token_key, ctx.tokens, token_window.window_secs, token_window.limit)
                        .await?;

                    if !token_result.allowed {
                        let token_details = DecisionDetails::from_tokens(&token_result);

                        self.emit(
                            ctx,
                            classify(rate.action_on_exceed, EventType::TokenLimitExceeded),
                            Some(token_window.window_secs),
                            Some(f64::from(token_result.current)),
                            Some(f64::from(token_result.limit)),
                            Some(ctx.tokens),
                        )
                        .await;

                        if rate.action_on_exceed != ActionOnExceed::Allow {
                            return Ok(Decision::exceeded(
                                rate.action_on_exceed,
                                rate.slowdown_ms,
                                "token_limit_exceeded",
                                token_details,
                            ));
                        }
                    }
                }

                self.emit(ctx, EventType::TokenUsageTracked, None, None, None, Some(ctx.tokens)).await;
            }
        }

        if let (Some(cost_rule), Some(cost_value)) = (&policy.cost, ctx.cost) {
            let (cap, window_secs) = cost_rule.resolved_cap(ctx.endpoint).expect("cost rule validated at config load time");
            let cost_key = key::counter_key("cost", ctx.identity, ctx.endpoint);
            let result = self.store.increment_cost(&cost_key, cost_value, window_secs, cap).await?;

            if !result.allowed {
                let cost_details = DecisionDetails::from_cost(&result);

                // Cost rules never slow down; a configured slowdown degrades
                // to a block at evaluation time, per SPEC_FULL.md §4.4.
                let action_on_exceed = match cost_rule.action_on_exceed {
                    ActionOnExceed::Slowdown => ActionOnExceed::Block,
                    other => other,
                };

                self.emit(
                    ctx,
                    classify(action_on_exceed, EventType::CostExceeded),
                    Some(window_secs),
                    Some(result.current),
                    Some(result.cap),
                    None,
                )
                .await;

                if action_on_exceed != ActionOnExceed::Allow {
                    return Ok(Decision::exceeded(action_on_exceed, None, "cost_exceeded", cost_details));
                }
            }
        }

        self.emit(ctx, EventType::Allowed, None, None, None, None).await;
        Ok(Decision::admit(details))
    }

    async fn emit(
        &self,
        ctx: &CheckContext<'_>,
        event_type: EventType,
        window: Option<u64>,
        value: Option<f64>,
        threshold: Option<f64>,
        tokens: Option<u32>,
    ) {
        let mut event = Event::new(
            ctx.identity.user_key.clone(),
            ctx.identity.plan.clone(),
            ctx.endpoint.to_string(),
            event_type,
        );

        if let (Some(window), Some(value), Some(threshold)) = (window, value, threshold) {
            event = event.with_budget(window, value, threshold);
        }

        if let Some(tokens) = tokens {
            event = event.with_tokens(tokens);
        }

        self.bus.emit(event).await;
    }
}

/// Maps an exceeded check's configured action to the event recorded for it:
/// a hard block always reads as `blocked`, a slowdown as `slowdown_applied`,
/// and `allow`/`allow-and-log` keep the cause-specific type so consumers can
/// see exactly which budget was touched even though the request proceeded.
fn classify(action_on_exceed: ActionOnExceed, cause: EventType) -> EventType {
    match action_on_exceed {
        ActionOnExceed::Block => EventType::Blocked,
        ActionOnExceed::Slowdown => EventType::SlowdownApplied,
        ActionOnExceed::AllowAndLog | ActionOnExceed::Allow => cause,
    }
}

#[cfg(test)]
mod tests {
    use config::{Identity, MemoryStoreConfig, RateWindowLimits};
    use store::InMemoryStore;

    use super::*;
    use crate::decision::DecisionAction;

    fn rate_rule(max_per_minute: u32, action: ActionOnExceed) -> config::RateRule {
        config::RateRule {
            window: RateWindowLimits {
                max_per_minute: Some(max_per_minute),
                ..Default::default()
            },
            burst: None,
            tokens: Default::default(),
            action_on_exceed: action,
            slowdown_ms: if action == ActionOnExceed::Slowdown { Some(500) } else { None },
        }
    }

    fn policies(endpoint: &str, rule: config::RateRule) -> PolicyConfig {
        let mut plan_policy = config::PlanPolicy::default();

        plan_policy.endpoints.insert(
            endpoint.to_string(),
            EndpointPolicy {
                rate: Some(rule),
                cost: None,
                concurrency: None,
            },
        );

        [("free".to_string(), plan_policy)].into_iter().collect()
    }

    fn engine() -> PolicyEngine<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new(&MemoryStoreConfig::default()).unwrap());
        PolicyEngine::new(store, Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_blocks() {
        let engine = engine();
        let policies = policies("POST|/api/ask", rate_rule(10, ActionOnExceed::Block));
        let identity = Identity::new("u1", "free");

        for i in 1..=10 {
            let ctx = CheckContext {
                identity: &identity,
                endpoint: "POST|/api/ask",
                tokens: 0,
                cost: None,
                route_override: None,
                user_override: None,
            };

            let decision = engine.check(&policies, &ctx).await.unwrap();
            assert!(decision.allowed, "request {i} should be admitted");
        }

        let ctx = CheckContext {
            identity: &identity,
            endpoint: "POST|/api/ask",
            tokens: 0,
            cost: None,
            route_override: None,
            user_override: None,
        };

        let decision = engine.check(&policies, &ctx).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some("rate_limited"));
        assert!(decision.retry_after_seconds.unwrap() <= 60);
    }

    #[tokio::test]
    async fn no_policy_admits_trivially() {
        let engine = engine();
        let policies = PolicyConfig::new();
        let identity = Identity::new("u1", "free");

        let ctx = CheckContext {
            identity: &identity,
            endpoint: "GET|/anything",
            tokens: 0,
            cost: None,
            route_override: None,
            user_override: None,
        };

        let decision = engine.check(&policies, &ctx).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.action, DecisionAction::Admit);
    }

    #[tokio::test]
    async fn slowdown_action_admits_with_delay() {
        let engine = engine();
        let policies = policies("POST|/api/ask", rate_rule(1, ActionOnExceed::Slowdown));
        let identity = Identity::new("u1", "free");

        let ctx = CheckContext {
            identity: &identity,
            endpoint: "POST|/api/ask",
            tokens: 0,
            cost: None,
            route_override: None,
            user_override: None,
        };

        engine.check(&policies, &ctx).await.unwrap();
        let decision = engine.check(&policies, &ctx).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.action, DecisionAction::Slowdown);
        assert_eq!(decision.slowdown_ms, Some(500));
    }

    #[tokio::test]
    async fn cost_violation_rejects_without_slowdown() {
        let engine = engine();
        let mut plan_policy = config::PlanPolicy::default();

        plan_policy.endpoints.insert(
            "POST|/api/ask".to_string(),
            EndpointPolicy {
                rate: None,
                cost: Some(config::CostRule {
                    hourly_cap: Some(0.10),
                    daily_cap: None,
                    action_on_exceed: ActionOnExceed::Slowdown,
                }),
                concurrency: None,
            },
        );

        let policies: PolicyConfig = [("free".to_string(), plan_policy)].into_iter().collect();
        let identity = Identity::new("u1", "free");

        let ctx = CheckContext {
            identity: &identity,
            endpoint: "POST|/api/ask",
            tokens: 0,
            cost: Some(0.06),
            route_override: None,
            user_override: None,
        };

        let first = engine.check(&policies, &ctx).await.unwrap();
        assert!(first.allowed);

        let second = engine.check(&policies, &ctx).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.action, DecisionAction::Block);
        assert_eq!(second.reason, Some("cost_exceeded"));
    }

    #[tokio::test]
    async fn token_window_exceeded_short_circuits_before_cost() {
        let engine = engine();
        let mut plan_policy = config::PlanPolicy::default();

        let mut rate = rate_rule(100, ActionOnExceed::Block);
        rate.tokens.max_tokens_per_minute = Some(100);

        plan_policy.endpoints.insert(
            "POST|/api/ask".to_string(),
            EndpointPolicy {
                rate: Some(rate),
                cost: Some(config::CostRule {
                    hourly_cap: Some(1000.0),
                    daily_cap: None,
                    action_on_exceed: ActionOnExceed::Block,
                }),
                concurrency: None,
            },
        );

        let policies: PolicyConfig = [("free".to_string(), plan_policy)].into_iter().collect();
        let identity = Identity::new("u1", "free");

        let ctx = CheckContext {
            identity: &identity,
            endpoint: "POST|/api/ask",
            tokens: 150,
            cost: Some(1.0),
            route_override: None,
            user_override: None,
        };

        let decision = engine.check(&policies, &ctx).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some("token_limit_exceeded"));
    }
}
