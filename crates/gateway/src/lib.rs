//! The admission gateway: a [`tower::Layer`] (C7) that sequences IP
//! filtering, client identification, concurrency admission and policy
//! evaluation in front of any `axum` router, plus a `serve` entry point that
//! wires it up into a bindable server. See SPEC_FULL.md §2A/§4.6.

#![deny(missing_docs)]

mod adapter;
mod ip_filter;
mod middleware;
mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{Router, routing::get};
use config::Config;
use policy::{EventBus, PolicyEngine, WebhookSink};
use store::AnyStore;
use tokio::net::TcpListener;

pub use adapter::{Adapter, HeaderAdapter};
pub use ip_filter::{IpFilter, extract_client_ip};
pub use middleware::{AdmissionLayer, AdmissionService};

/// Configuration for serving the gatekeeper.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The deserialized gatekeeper TOML configuration.
    pub config: Config,
}

/// Build the shared [`EventBus`], registering the configured webhook sink if
/// any. The returned bus has no in-process handlers; callers that want to
/// observe events (tests, alternate sinks) register their own with [`EventBus::on`].
pub fn event_bus(config: &Config) -> Arc<EventBus> {
    let bus = Arc::new(EventBus::new());

    if let Some(webhook_config) = &config.webhook {
        let sink = Arc::new(WebhookSink::new(webhook_config.clone()));
        bus.on(sink.handler());
    }

    bus
}

/// Starts and runs the gatekeeper server with the provided configuration: an
/// in-memory or Redis-backed counter store, the admission middleware wrapped
/// around a demo router, bound to `listen_address`.
pub async fn serve(ServeConfig { listen_address, config }: ServeConfig) -> anyhow::Result<()> {
    let store = AnyStore::from_config(&config.store).await?;
    let bus = event_bus(&config);
    let engine = Arc::new(PolicyEngine::new(store, bus));
    let adapter: Arc<dyn Adapter> = Arc::new(HeaderAdapter::new(config.identification.clone()));

    let admission = AdmissionLayer::new(&config, adapter, engine);

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .fallback(get(|| async { "ok" }))
        .layer(admission);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("failed to bind to {listen_address}: {e}"))?;

    log::info!("gatekeeper listening on http://{listen_address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| anyhow!("server error: {e}"))?;

    Ok(())
}
