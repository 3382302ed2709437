//! Webhook egress sink: posts [`Event`]s to a configured URL with progressive
//! retries and a per-URL circuit breaker. See SPEC_FULL.md §4.5/§6.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use config::WebhookConfig;
use reqwest::{Client, StatusCode};

use crate::bus::HandlerError;
use crate::event::Event;

/// A `POST`-based event sink, registered as an [`crate::EventBus`] handler
/// via [`WebhookSink::handler`].
///
/// Terminal (4xx) responses are not retried; network errors and 5xx
/// responses are retried with the configured progressive delays. Once
/// `failure_threshold` consecutive attempts fail, the breaker opens for
/// `breaker_timeout_secs` and every emit during that window is rejected
/// without making a request.
pub struct WebhookSink {
    config: WebhookConfig,
    client: Client,
    consecutive_failures: AtomicU32,
    opened_at: AtomicU64,
}

const BREAKER_CLOSED: u64 = 0;

impl WebhookSink {
    /// Build a sink over an already-validated [`WebhookConfig`].
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(BREAKER_CLOSED),
        }
    }

    /// Deliver one event, retrying on transient failure.
    pub async fn send(&self, event: &Event) -> Result<(), HandlerError> {
        if let Some(remaining) = self.breaker_remaining() {
            return Err(HandlerError(format!("webhook circuit open, retry in {remaining}s")));
        }

        let attempts = self.config.retries + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            match self.attempt(event, attempt).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(Attempt::Terminal(err)) => {
                    self.record_failure();
                    return Err(err);
                }
                Err(Attempt::Retryable(err)) => {
                    last_err = Some(err);

                    if attempt + 1 < attempts {
                        let delay = self
                            .config
                            .retry_delays_secs
                            .get(attempt as usize)
                            .copied()
                            .unwrap_or_else(|| self.config.retry_delays_secs.last().copied().unwrap_or(1));

                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }

        self.record_failure();
        Err(last_err.unwrap_or_else(|| HandlerError("webhook delivery failed with no response".to_string())))
    }

    /// An [`crate::EventBus`] handler closure delivering events to this sink.
    pub fn handler(self: std::sync::Arc<Self>) -> impl Fn(Event) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync + 'static {
        move |event| {
            let sink = self.clone();
            Box::pin(async move { sink.send(&event).await })
        }
    }

    async fn attempt(&self, event: &Event, attempt: u32) -> Result<(), Attempt> {
        let response = self
            .client
            .post(self.config.url.clone())
            .timeout(WebhookConfig::attempt_timeout(attempt))
            .json(event)
            .send()
            .await
            .map_err(|err| Attempt::Retryable(HandlerError(format!("webhook request failed: {err}"))))?;

        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        if is_retryable_status(status) {
            Err(Attempt::Retryable(HandlerError(format!("webhook returned {status}"))))
        } else {
            Err(Attempt::Terminal(HandlerError(format!("webhook returned {status}"))))
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if failures >= self.config.failure_threshold {
            self.opened_at.store(now(), Ordering::SeqCst);
        }
    }

    fn breaker_remaining(&self) -> Option<u64> {
        let opened_at = self.opened_at.load(Ordering::SeqCst);

        if opened_at == BREAKER_CLOSED {
            return None;
        }

        let elapsed = now().saturating_sub(opened_at);

        if elapsed >= self.config.breaker_timeout_secs {
            self.opened_at.store(BREAKER_CLOSED, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            None
        } else {
            Some(self.config.breaker_timeout_secs - elapsed)
        }
    }
}

enum Attempt {
    Retryable(HandlerError),
    Terminal(HandlerError),
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
