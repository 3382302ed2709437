//! C7: the admission middleware. A [`tower::Layer`]/[`tower::Service`] pair
//! that runs every request through IP filtering, identification,
//! concurrency admission and the policy engine before handing it to the
//! wrapped service. See SPEC_FULL.md §4.6. Grounded in the teacher's
//! `server::rate_limit::{RateLimitLayer, RateLimitService}`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use config::{Config, PolicyConfig, ServerConfig};
use http::{Request, Response};
use policy::{CheckContext, DecisionAction, PolicyEngine, PolicyResolver};
use store::CounterStore;
use tower::{Layer, Service};

use crate::adapter::Adapter;
use crate::ip_filter::{IpFilter, extract_client_ip};
use crate::response;

struct Shared<S> {
    adapter: Arc<dyn Adapter>,
    engine: Arc<PolicyEngine<S>>,
    policies: PolicyConfig,
    concurrency: Arc<concurrency::LimiterRegistry>,
    ip_filter: IpFilter,
    server: ServerConfig,
}

/// Builds an [`AdmissionService`] around every wrapped service.
pub struct AdmissionLayer<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<S: CounterStore + 'static> AdmissionLayer<S> {
    /// Build the layer from the loaded configuration, an adapter, and a
    /// policy engine wired to the configured counter store.
    pub fn new(config: &Config, adapter: Arc<dyn Adapter>, engine: Arc<PolicyEngine<S>>) -> Self {
        let ip_filter = IpFilter::new(&config.server.ip_allowlist, &config.server.ip_blocklist);

        Self {
            shared: Arc::new(Shared {
                adapter,
                engine,
                policies: config.policies.clone(),
                concurrency: Arc::new(concurrency::LimiterRegistry::new()),
                ip_filter,
                server: config.server.clone(),
            }),
        }
    }
}

impl<Inner, S: CounterStore + 'static> Layer<Inner> for AdmissionLayer<S> {
    type Service = AdmissionService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AdmissionService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Wraps an inner [`tower::Service`], gating every request on the resolved
/// policy before forwarding it.
pub struct AdmissionService<Inner, S> {
    inner: Inner,
    shared: Arc<Shared<S>>,
}

impl<Inner: Clone, S> Clone for AdmissionService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<Inner, S, ReqBody> Service<Request<ReqBody>> for AdmissionService<Inner, S>
where
    Inner: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    Inner::Future: Send,
    Inner::Error: Send + 'static,
    ReqBody: Send + 'static,
    S: CounterStore + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let shared = self.shared.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            if shared.adapter.skip(&parts) {
                return inner.call(Request::from_parts(parts, body)).await;
            }

            let client_ip = extract_client_ip(&parts, shared.server.trust_proxy, shared.server.trusted_proxy_count);

            if let Some(ip) = client_ip {
                if shared.ip_filter.is_allowed(ip) {
                    return inner.call(Request::from_parts(parts, body)).await;
                }

                if shared.ip_filter.is_blocked(ip) {
                    return Ok(response::ip_blocked_response());
                }
            }

            let identity = shared.adapter.identify(&parts);
            let endpoint = policy::normalize_endpoint(parts.method.as_str(), parts.uri.path());
            let route_override = shared.adapter.policy_override(&parts);
            let user_override = shared.adapter.user_override(&parts);

            let resolved = PolicyResolver::new(&shared.policies).resolve(
                &identity.plan,
                &endpoint,
                route_override.as_ref(),
                user_override.as_ref(),
            );

            // Held until this future completes, whichever branch returns:
            // releases the slot on success, rejection, and inner-service error
            // alike.
            let _slot = match resolved.as_ref().and_then(|policy| policy.concurrency.as_ref()) {
                Some(concurrency_config) => {
                    let limiter = shared.concurrency.get_or_create(&endpoint, concurrency_config);
                    let priority = shared.adapter.priority(&parts);

                    match limiter.acquire(priority).await {
                        Ok(slot) => Some(slot),
                        Err(_) => return Ok(response::concurrency_rejected_response(&endpoint)),
                    }
                }
                None => None,
            };

            let ctx = CheckContext {
                identity: &identity,
                endpoint: &endpoint,
                tokens: shared.adapter.estimate_tokens(&parts),
                cost: shared.adapter.estimate_cost(&parts),
                route_override: route_override.as_ref(),
                user_override: user_override.as_ref(),
            };

            let decision = match shared.engine.check(&shared.policies, &ctx).await {
                Ok(decision) => decision,
                Err(err) => {
                    log::error!("counter store unavailable, rejecting {endpoint}: {err}");
                    return Ok(response::store_unavailable_response());
                }
            };

            if shared.server.dry_run {
                if decision.action != DecisionAction::Admit {
                    log::info!(
                        "dry-run: would have applied {:?} to {endpoint} for {}",
                        decision.action,
                        identity.user_key
                    );
                }

                let mut resp = inner.call(Request::from_parts(parts, body)).await?;
                response::apply_rate_headers(&mut resp, &decision);
                return Ok(resp);
            }

            match decision.action {
                DecisionAction::Block => Ok(response::block_response(&decision, &identity.plan, &endpoint)),
                DecisionAction::Slowdown => {
                    if let Some(delay_ms) = decision.slowdown_ms {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }

                    let mut resp = inner.call(Request::from_parts(parts, body)).await?;
                    response::apply_rate_headers(&mut resp, &decision);
                    Ok(resp)
                }
                DecisionAction::AllowAndLog | DecisionAction::Admit => {
                    let mut resp = inner.call(Request::from_parts(parts, body)).await?;
                    response::apply_rate_headers(&mut resp, &decision);
                    Ok(resp)
                }
            }
        })
    }
}
