//! C6: fan-out of policy decisions to registered sinks. See SPEC_FULL.md §4.5.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::Event;

/// Error a handler can report. Never propagated back to the emitter; only
/// logged, so one handler's failure never prevents the others from running.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

type BoxedHandler = dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync;

/// Opaque handle returned by [`EventBus::on`], used to unregister with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    handler: std::sync::Arc<BoxedHandler>,
}

/// Registry of event sinks. Handlers may do synchronous or asynchronous
/// work; `emit` awaits every handler as a group and logs each failure
/// individually, so a struggling sink never blocks or breaks the others.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Construct an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning a handle that can later be passed to
    /// [`EventBus::off`].
    pub fn on<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: std::sync::Arc<BoxedHandler> = std::sync::Arc::new(move |event| Box::pin(handler(event)));

        self.handlers.write().unwrap().push(Registration { id, handler });

        id
    }

    /// Unregister a previously-registered handler. A no-op if `id` is
    /// already gone.
    pub fn off(&self, id: HandlerId) {
        self.handlers.write().unwrap().retain(|r| r.id != id);
    }

    /// Drop every registered handler.
    pub fn clear(&self) {
        self.handlers.write().unwrap().clear();
    }

    /// Number of currently registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Fan the event out to every handler, awaiting them as a group. A
    /// handler's failure is logged and never prevents the others from
    /// running or propagates to the caller.
    pub async fn emit(&self, event: Event) {
        let handlers: Vec<_> = self.handlers.read().unwrap().iter().map(|r| r.handler.clone()).collect();

        if handlers.is_empty() {
            return;
        }

        let calls = handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move { handler(event).await }
        });

        for result in futures::future::join_all(calls).await {
            if let Err(err) = result {
                log::error!("event handler failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::EventType;

    fn event() -> Event {
        Event::new("u1", "free", "GET|/api/ask", EventType::Allowed)
    }

    #[tokio::test]
    async fn emits_to_every_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            bus.on(move |_event| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        bus.emit(event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_handler_failing_does_not_stop_the_others() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on(|_event| async move { Err(HandlerError("boom".to_string())) });

        let calls_clone = calls.clone();
        bus.on(move |_event| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit(event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_unregisters_a_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let id = bus.on(move |_event| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.off(id);
        bus.emit(event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_removes_all_handlers() {
        let bus = EventBus::new();
        bus.on(|_event| async move { Ok(()) });
        bus.on(|_event| async move { Ok(()) });

        bus.clear();
        assert_eq!(bus.handler_count(), 0);
    }
}
