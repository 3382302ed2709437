//! C4: maps `(plan, endpoint)` plus route/user overrides to the effective
//! [`EndpointPolicy`]. See SPEC_FULL.md §4.3.

use config::{EndpointPolicy, PolicyConfig, UserOverride};

/// Resolves the effective policy for one request.
///
/// Precedence, highest first: route override > plan-endpoint-specific >
/// plan defaults > none. A user override never replaces the policy; it only
/// rewrites specific numeric rate limits inside it, field-by-field, with
/// per-endpoint subsections winning over the user's global override.
pub struct PolicyResolver<'a> {
    policies: &'a PolicyConfig,
}

impl<'a> PolicyResolver<'a> {
    /// Build a resolver over the loaded policy table.
    pub fn new(policies: &'a PolicyConfig) -> Self {
        Self { policies }
    }

    /// Resolve the effective policy, or `None` if nothing applies.
    pub fn resolve(
        &self,
        plan: &str,
        endpoint: &str,
        route_override: Option<&EndpointPolicy>,
        user_override: Option<&UserOverride>,
    ) -> Option<EndpointPolicy> {
        let mut policy = route_override.cloned().or_else(|| self.plan_policy(plan, endpoint))?;

        if let Some(user_override) = user_override
            && let Some(rate) = &mut policy.rate
            && let Some(rate_override) = user_override.for_endpoint(endpoint)
        {
            let (window, burst) = rate_override.apply(&rate.window, rate.burst);
            rate.window = window;
            rate.burst = burst;
        }

        Some(policy)
    }

    fn plan_policy(&self, plan: &str, endpoint: &str) -> Option<EndpointPolicy> {
        let plan_policy = self.policies.get(plan)?;
        plan_policy.endpoints.get(endpoint).cloned().or_else(|| plan_policy.defaults.clone())
    }
}

#[cfg(test)]
mod tests {
    use config::{ActionOnExceed, ConcurrencyConfig, PlanPolicy, RateOverride, RateRule, RateWindowLimits};

    use super::*;

    fn rate_rule(max_per_minute: u32) -> RateRule {
        RateRule {
            window: RateWindowLimits {
                max_per_minute: Some(max_per_minute),
                ..Default::default()
            },
            burst: None,
            tokens: Default::default(),
            action_on_exceed: ActionOnExceed::Block,
            slowdown_ms: None,
        }
    }

    fn policies_with_endpoint(endpoint: &str, rule: RateRule) -> PolicyConfig {
        let mut plan_policy = PlanPolicy::default();

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

    #[test]
    fn endpoint_specific_beats_plan_defaults() {
        let mut plan_policy = PlanPolicy::default();

        plan_policy.endpoints.insert(
            "GET|/api/ask".to_string(),
            EndpointPolicy {
                rate: Some(rate_rule(10)),
                cost: None,
                concurrency: None,
            },
        );

        plan_policy.defaults = Some(EndpointPolicy {
            rate: Some(rate_rule(5)),
            cost: None,
            concurrency: None,
        });

        let policies: PolicyConfig = [("free".to_string(), plan_policy)].into_iter().collect();
        let resolver = PolicyResolver::new(&policies);

        let resolved = resolver.resolve("free", "GET|/api/ask", None, None).unwrap();
        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(10));
    }

    #[test]
    fn falls_back_to_plan_defaults() {
        let mut plan_policy = PlanPolicy::default();
        plan_policy.defaults = Some(EndpointPolicy {
            rate: Some(rate_rule(5)),
            cost: None,
            concurrency: None,
        });

        let policies: PolicyConfig = [("free".to_string(), plan_policy)].into_iter().collect();
        let resolver = PolicyResolver::new(&policies);

        let resolved = resolver.resolve("free", "GET|/anything", None, None).unwrap();
        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(5));
    }

    #[test]
    fn route_override_beats_everything() {
        let policies = policies_with_endpoint("GET|/api/ask", rate_rule(10));
        let resolver = PolicyResolver::new(&policies);

        let route_override = EndpointPolicy {
            rate: Some(rate_rule(1)),
            cost: None,
            concurrency: Some(ConcurrencyConfig {
                max: 1,
                queue_timeout_secs: 30,
                max_queue_size: 10,
                action_on_exceed: config::ConcurrencyAction::Block,
                priority_aging_seconds: 5,
            }),
        };

        let resolved = resolver.resolve("free", "GET|/api/ask", Some(&route_override), None).unwrap();
        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(1));
        assert!(resolved.concurrency.is_some());
    }

    #[test]
    fn no_policy_matches_returns_none() {
        let policies = PolicyConfig::new();
        let resolver = PolicyResolver::new(&policies);

        assert!(resolver.resolve("free", "GET|/anything", None, None).is_none());
    }

    #[test]
    fn user_override_rewrites_limit_but_not_the_policy() {
        let policies = policies_with_endpoint("GET|/api/ask", rate_rule(10));
        let resolver = PolicyResolver::new(&policies);

        let user_override = UserOverride {
            rate: Some(RateOverride {
                max_per_minute: Some(100.0),
                ..Default::default()
            }),
            endpoints: Default::default(),
        };

        let resolved = resolver
            .resolve("free", "GET|/api/ask", None, Some(&user_override))
            .unwrap();

        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(100));
    }

    #[test]
    fn endpoint_scoped_user_override_beats_global_one() {
        let policies = policies_with_endpoint("GET|/api/ask", rate_rule(10));
        let resolver = PolicyResolver::new(&policies);

        let mut endpoints = std::collections::BTreeMap::new();
        endpoints.insert(
            "GET|/api/ask".to_string(),
            RateOverride {
                max_per_minute: Some(42.0),
                ..Default::default()
            },
        );

        let user_override = UserOverride {
            rate: Some(RateOverride {
                max_per_minute: Some(100.0),
                ..Default::default()
            }),
            endpoints,
        };

        let resolved = resolver
            .resolve("free", "GET|/api/ask", None, Some(&user_override))
            .unwrap();

        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(42));
    }

    #[test]
    fn endpoint_override_merges_field_by_field_with_global() {
        let policies = policies_with_endpoint("GET|/api/ask", rate_rule(10));
        let resolver = PolicyResolver::new(&policies);

        let mut endpoints = std::collections::BTreeMap::new();
        endpoints.insert(
            "GET|/api/ask".to_string(),
            RateOverride {
                burst: Some(5.0),
                ..Default::default()
            },
        );

        let user_override = UserOverride {
            rate: Some(RateOverride {
                max_per_minute: Some(100.0),
                ..Default::default()
            }),
            endpoints,
        };

        let resolved = resolver
            .resolve("free", "GET|/api/ask", None, Some(&user_override))
            .unwrap();

        let rate = resolved.rate.unwrap();
        assert_eq!(rate.window.max_per_minute, Some(100));
        assert_eq!(rate.burst, Some(5));
    }

    #[test]
    fn invalid_user_override_is_discarded() {
        let policies = policies_with_endpoint("GET|/api/ask", rate_rule(10));
        let resolver = PolicyResolver::new(&policies);

        let user_override = UserOverride {
            rate: Some(RateOverride {
                max_per_minute: Some(f64::NAN),
                ..Default::default()
            }),
            endpoints: Default::default(),
        };

        let resolved = resolver
            .resolve("free", "GET|/api/ask", None, Some(&user_override))
            .unwrap();

        assert_eq!(resolved.rate.unwrap().window.max_per_minute, Some(10));
    }
}
