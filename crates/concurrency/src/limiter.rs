use std::cell::Cell;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::{ConcurrencyAction, ConcurrencyConfig};
use tokio::sync::oneshot;

use crate::error::ConcurrencyError;

/// Point-in-time view of a limiter's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyStats {
    /// Requests currently holding a slot.
    pub running: u32,
    /// Requests waiting in the priority queue.
    pub queued: usize,
    /// Slots that could be granted immediately.
    pub available: u32,
}

enum WaiterOutcome {
    Granted,
    TimedOut,
    Cleared,
}

struct Waiter {
    id: u64,
    priority: i64,
    enqueued_at: Instant,
    sender: Option<oneshot::Sender<WaiterOutcome>>,
}

struct State {
    running: u32,
    queue: Vec<Waiter>,
}

struct Inner {
    max: u32,
    max_queue_size: usize,
    action_on_exceed: ConcurrencyAction,
    queue_timeout: Duration,
    priority_aging_seconds: u64,
    next_id: AtomicU64,
    state: StdMutex<State>,
}

/// Bounds the number of in-flight operations admitted at once, queueing
/// overflow by aging priority so no waiter starves forever.
///
/// Cloning is cheap; every clone shares the same queue and counters.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

/// A held slot. Releases exactly once, on drop, transferring the slot to the
/// best-ranked waiter if one is queued, otherwise freeing it.
pub struct SlotHandle {
    inner: Arc<Inner>,
    released: Cell<bool>,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            Inner::release(&self.inner);
        }
    }
}

impl ConcurrencyLimiter {
    /// Build a limiter from its resolved endpoint configuration.
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                max: config.max,
                max_queue_size: config.max_queue_size,
                action_on_exceed: config.action_on_exceed,
                queue_timeout: Duration::from_secs(config.queue_timeout_secs),
                priority_aging_seconds: config.priority_aging_seconds.max(1),
                next_id: AtomicU64::new(0),
                state: StdMutex::new(State {
                    running: 0,
                    queue: Vec::new(),
                }),
            }),
        }
    }

    /// Acquire a slot, queueing (and aging) by `priority` if the limit is
    /// already reached and `action_on_exceed = queue`.
    pub async fn acquire(&self, priority: i64) -> Result<SlotHandle, ConcurrencyError> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();

            if state.running < self.inner.max {
                state.running += 1;

                return Ok(SlotHandle {
                    inner: self.inner.clone(),
                    released: Cell::new(false),
                });
            }

            match self.inner.action_on_exceed {
                ConcurrencyAction::Block => return Err(ConcurrencyError::LimitReached),
                ConcurrencyAction::Queue => {
                    if state.queue.len() >= self.inner.max_queue_size {
                        return Err(ConcurrencyError::QueueFull);
                    }

                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();

                    state.queue.push(Waiter {
                        id,
                        priority,
                        enqueued_at: Instant::now(),
                        sender: Some(tx),
                    });

                    self.spawn_timeout(id);

                    rx
                }
            }
        };

        match rx.await {
            Ok(WaiterOutcome::Granted) => Ok(SlotHandle {
                inner: self.inner.clone(),
                released: Cell::new(false),
            }),
            Ok(WaiterOutcome::TimedOut) => Err(ConcurrencyError::QueueTimeout),
            Ok(WaiterOutcome::Cleared) => Err(ConcurrencyError::QueueCleared),
            Err(_) => Err(ConcurrencyError::QueueCleared),
        }
    }

    fn spawn_timeout(&self, id: u64) {
        let inner = self.inner.clone();
        let timeout = inner.queue_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut state = inner.state.lock().unwrap();

            if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
                let mut waiter = state.queue.remove(pos);
                drop(state);

                if let Some(sender) = waiter.sender.take() {
                    let _ = sender.send(WaiterOutcome::TimedOut);
                }
            }
        });
    }

    /// Reject every queued waiter with [`ConcurrencyError::QueueCleared`].
    /// Used by tests and graceful-shutdown paths; does not touch `running`.
    pub fn clear_queue(&self) {
        let waiters = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.queue)
        };

        for mut waiter in waiters {
            if let Some(sender) = waiter.sender.take() {
                let _ = sender.send(WaiterOutcome::Cleared);
            }
        }
    }

    /// Current load snapshot.
    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.inner.state.lock().unwrap();

        ConcurrencyStats {
            running: state.running,
            queued: state.queue.len(),
            available: self.inner.max.saturating_sub(state.running),
        }
    }
}

impl Inner {
    /// Effective priority per SPEC_FULL §4.2: `max(0, priority - aged)`,
    /// recomputed at selection time rather than cached.
    fn effective_priority(waiter: &Waiter, now: Instant, aging_seconds: u64) -> i64 {
        let waited = now.saturating_duration_since(waiter.enqueued_at).as_secs();
        let aged = (waited / aging_seconds) as i64;
        (waiter.priority - aged).max(0)
    }

    fn best_waiter_index(state: &State, aging_seconds: u64) -> Option<usize> {
        let now = Instant::now();

        state
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (Self::effective_priority(w, now, aging_seconds), w.enqueued_at))
            .map(|(idx, _)| idx)
    }

    fn release(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();

        match Self::best_waiter_index(&state, inner.priority_aging_seconds) {
            Some(idx) => {
                let mut waiter = state.queue.remove(idx);
                drop(state);

                if let Some(sender) = waiter.sender.take() {
                    let _ = sender.send(WaiterOutcome::Granted);
                }
            }
            None => {
                state.running = state.running.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(max: u32) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max,
            queue_timeout_secs: 30,
            max_queue_size: 10,
            action_on_exceed: ConcurrencyAction::Queue,
            priority_aging_seconds: 5,
        }
    }

    #[tokio::test]
    async fn admits_up_to_max_then_queues() {
        let limiter = ConcurrencyLimiter::new(&config(1));

        let first = limiter.acquire(5).await.unwrap();
        assert_eq!(limiter.stats().running, 1);

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(5).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.stats().queued, 1);

        drop(first);
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.stats().running, 1);
        assert_eq!(limiter.stats().queued, 0);
        drop(handle);
        assert_eq!(limiter.stats().running, 0);
    }

    #[tokio::test]
    async fn block_mode_rejects_immediately() {
        let mut cfg = config(1);
        cfg.action_on_exceed = ConcurrencyAction::Block;
        let limiter = ConcurrencyLimiter::new(&cfg);

        let _slot = limiter.acquire(5).await.unwrap();
        let err = limiter.acquire(5).await.unwrap_err();
        assert_eq!(err, ConcurrencyError::LimitReached);
    }

    #[tokio::test]
    async fn queue_full_rejects() {
        let mut cfg = config(1);
        cfg.max_queue_size = 0;
        let limiter = ConcurrencyLimiter::new(&cfg);

        let _slot = limiter.acquire(5).await.unwrap();
        let err = limiter.acquire(5).await.unwrap_err();
        assert_eq!(err, ConcurrencyError::QueueFull);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_surfaces() {
        let mut cfg = config(1);
        cfg.queue_timeout_secs = 1;
        let limiter = ConcurrencyLimiter::new(&cfg);

        let _slot = limiter.acquire(5).await.unwrap();
        let waiter = limiter.acquire(5);
        tokio::pin!(waiter);

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = waiter.await.unwrap_err();
        assert_eq!(err, ConcurrencyError::QueueTimeout);
    }

    #[tokio::test]
    async fn lower_priority_number_wins_with_aging() {
        let limiter = ConcurrencyLimiter::new(&config(1));
        let _slot = limiter.acquire(0).await.unwrap();

        let low_priority = limiter.clone();
        let high_priority = limiter.clone();

        // enqueue a low-priority (large number) waiter first...
        let low = tokio::spawn(async move { low_priority.acquire(10).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // ...then a high-priority (small number) waiter.
        let high = tokio::spawn(async move { high_priority.acquire(1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(_slot);

        // the high-priority waiter should be granted the freed slot first.
        let high_handle = high.await.unwrap().unwrap();
        assert_eq!(limiter.stats().queued, 1);
        drop(high_handle);

        let _low_handle = low.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clear_queue_rejects_waiters() {
        let limiter = ConcurrencyLimiter::new(&config(1));
        let _slot = limiter.acquire(5).await.unwrap();

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(5).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        limiter.clear_queue();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, ConcurrencyError::QueueCleared);
    }
}
