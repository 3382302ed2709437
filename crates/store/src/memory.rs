//! Process-local counter store backed by a sharded map, with LRU-ish
//! eviction under two caps (global and per-identity) and a periodic sweep
//! of expired entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use config::MemoryStoreConfig;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::result::{CostResult, RateResult, TokenResult};

/// A live fixed-window counter: rate/token entries use `count`, cost entries
/// use `cost`. Both live on the same struct since a key only ever belongs
/// to one kind of rule and this avoids a third map.
#[derive(Clone)]
struct CounterState {
    count: u64,
    cost: f64,
    burst_tokens: Option<u32>,
    expires_at: Instant,
    last_access: Instant,
}

impl CounterState {
    fn new_window(now: Instant, window: Duration, burst: Option<u32>) -> Self {
        Self {
            count: 0,
            cost: 0.0,
            burst_tokens: burst,
            expires_at: now + window,
            last_access: now,
        }
    }

    fn reset_in_secs(&self, now: Instant) -> u64 {
        self.expires_at.saturating_duration_since(now).as_secs()
    }
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    last_access: Instant,
}

struct Inner {
    counters: DashMap<String, CounterState>,
    kv: DashMap<String, KvEntry>,
    max_keys: usize,
    max_keys_per_user: usize,
}

impl Inner {
    /// Every key is scoped to `namespace:identity` for the per-identity cap;
    /// a key is always formatted as `{namespace}:{identity}:{rest}` by
    /// callers, so the first two segments identify the owning scope.
    fn scope_of(key: &str) -> &str {
        match key.match_indices(':').nth(1) {
            Some((idx, _)) => &key[..idx],
            None => key,
        }
    }

    fn total_len(&self) -> usize {
        self.counters.len() + self.kv.len()
    }

    fn scope_len(&self, scope: &str) -> usize {
        let counters = self.counters.iter().filter(|e| Self::scope_of(e.key()) == scope).count();
        let kv = self.kv.iter().filter(|e| Self::scope_of(e.key()) == scope).count();
        counters + kv
    }

    /// Make room for a new key if either cap would otherwise be exceeded,
    /// evicting the least-recently-accessed entry in the relevant scope.
    fn make_room(&self, key: &str) {
        let scope = Self::scope_of(key).to_string();

        if self.scope_len(&scope) >= self.max_keys_per_user {
            self.evict_lru(Some(&scope));
        }

        if self.total_len() >= self.max_keys {
            self.evict_lru(None);
        }
    }

    fn evict_lru(&self, scope: Option<&str>) {
        let mut oldest: Option<(String, Instant, bool)> = None;

        for entry in self.counters.iter() {
            if scope.is_some_and(|s| Self::scope_of(entry.key()) != s) {
                continue;
            }

            if oldest.as_ref().is_none_or(|(_, t, _)| entry.last_access < *t) {
                oldest = Some((entry.key().clone(), entry.last_access, true));
            }
        }

        for entry in self.kv.iter() {
            if scope.is_some_and(|s| Self::scope_of(entry.key()) != s) {
                continue;
            }

            if oldest.as_ref().is_none_or(|(_, t, _)| entry.last_access < *t) {
                oldest = Some((entry.key().clone(), entry.last_access, false));
            }
        }

        if let Some((key, _, is_counter)) = oldest {
            if is_counter {
                self.counters.remove(&key);
            } else {
                self.kv.remove(&key);
            }

            log::debug!("evicted key '{key}' from in-memory store to stay under capacity");
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();

        self.counters.retain(|_, state| state.expires_at > now);
        self.kv.retain(|_, entry| entry.expires_at.is_none_or(|exp| exp > now));
    }
}

/// In-process counter store. Appropriate for a single-instance deployment;
/// construction fails in a production-like environment unless explicitly
/// allowed, since this store does not coordinate across processes.
pub struct InMemoryStore {
    inner: Arc<Inner>,
    sweeper: JoinHandle<()>,
}

impl InMemoryStore {
    /// Construct a new store from configuration.
    pub fn new(config: &MemoryStoreConfig) -> Result<Self, StoreError> {
        let looks_like_production = std::env::var("GATEKEEPER_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        if looks_like_production && !config.allow_in_production {
            return Err(StoreError::Config(
                "refusing to start an in-process counter store with GATEKEEPER_ENV=production; \
                 set store.allow_in_production = true if this is intentional, or configure a redis backend"
                    .to_string(),
            ));
        }

        let inner = Arc::new(Inner {
            counters: DashMap::new(),
            kv: DashMap::new(),
            max_keys: config.max_keys,
            max_keys_per_user: config.max_keys_per_user,
        });

        let sweep_interval = Duration::from_secs(config.sweep_interval_secs.max(1));
        let sweep_inner = inner.clone();

        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;

            loop {
                interval.tick().await;
                sweep_inner.sweep_expired();
            }
        });

        Ok(Self { inner, sweeper })
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl crate::CounterStore for InMemoryStore {
    async fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        burst: Option<u32>,
    ) -> Result<RateResult, StoreError> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs.max(1));

        let result = match self.inner.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();

                if now >= state.expires_at {
                    *state = CounterState::new_window(now, window, burst);
                }

                state.last_access = now;
                apply_rate(state, limit)
            }
            Entry::Vacant(vacant) => {
                self.inner.make_room(key);
                let mut state = CounterState::new_window(now, window, burst);
                let result = apply_rate(&mut state, limit);
                vacant.insert(state);
                result
            }
        };

        Ok(result)
    }

    async fn peek_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateResult, StoreError> {
        let now = Instant::now();

        if let Some(state) = self.inner.counters.get(key)
            && now < state.expires_at
        {
            let current = state.count as u32;

            return Ok(RateResult {
                allowed: current < limit,
                current,
                limit,
                remaining: limit.saturating_sub(current),
                reset_in_seconds: state.reset_in_secs(now),
                burst_tokens: state.burst_tokens,
            });
        }

        Ok(RateResult {
            allowed: true,
            current: 0,
            limit,
            remaining: limit,
            reset_in_seconds: window_secs,
            burst_tokens: None,
        })
    }

    async fn increment_cost(&self, key: &str, cost: f64, window_secs: u64, cap: f64) -> Result<CostResult, StoreError> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs.max(1));

        let result = match self.inner.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();

                if now >= state.expires_at {
                    *state = CounterState::new_window(now, window, None);
                }

                state.last_access = now;
                apply_cost(state, cost, cap)
            }
            Entry::Vacant(vacant) => {
                self.inner.make_room(key);
                let mut state = CounterState::new_window(now, window, None);
                let result = apply_cost(&mut state, cost, cap);
                vacant.insert(state);
                result
            }
        };

        Ok(result)
    }

    async fn increment_tokens(
        &self,
        key: &str,
        tokens: u32,
        window_secs: u64,
        limit: u32,
    ) -> Result<TokenResult, StoreError> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs.max(1));

        let result = match self.inner.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();

                if now >= state.expires_at {
                    *state = CounterState::new_window(now, window, None);
                }

                state.last_access = now;
                apply_tokens(state, tokens, limit)
            }
            Entry::Vacant(vacant) => {
                self.inner.make_room(key);
                let mut state = CounterState::new_window(now, window, None);
                let result = apply_tokens(&mut state, tokens, limit);
                vacant.insert(state);
                result
            }
        };

        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();

        if let Some(mut entry) = self.inner.kv.get_mut(key) {
            if entry.expires_at.is_some_and(|exp| now >= exp) {
                drop(entry);
                self.inner.kv.remove(key);
                return Ok(None);
            }

            entry.last_access = now;
            return Ok(Some(entry.value.clone()));
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let now = Instant::now();

        if !self.inner.kv.contains_key(key) {
            self.inner.make_room(key);
        }

        self.inner.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl_secs.map(|secs| now + Duration::from_secs(secs)),
                last_access: now,
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.kv.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn close(&self) {
        self.sweeper.abort();
    }
}

fn apply_rate(state: &mut CounterState, limit: u32) -> RateResult {
    let now = Instant::now();
    let reset_in_seconds = state.reset_in_secs(now);

    if (state.count as u32) < limit {
        state.count += 1;

        RateResult {
            allowed: true,
            current: state.count as u32,
            limit,
            remaining: limit - state.count as u32,
            reset_in_seconds,
            burst_tokens: state.burst_tokens,
        }
    } else if let Some(remaining_burst) = state.burst_tokens.filter(|b| *b > 0) {
        state.burst_tokens = Some(remaining_burst - 1);
        state.count += 1;

        RateResult {
            allowed: true,
            current: state.count as u32,
            limit,
            remaining: 0,
            reset_in_seconds,
            burst_tokens: state.burst_tokens,
        }
    } else {
        RateResult {
            allowed: false,
            current: state.count as u32,
            limit,
            remaining: 0,
            reset_in_seconds,
            burst_tokens: state.burst_tokens,
        }
    }
}

fn apply_cost(state: &mut CounterState, cost: f64, cap: f64) -> CostResult {
    let reset_in_seconds = state.reset_in_secs(Instant::now());

    if state.cost + cost > cap {
        CostResult {
            allowed: false,
            current: state.cost,
            cap,
            reset_in_seconds,
        }
    } else {
        state.cost += cost;

        CostResult {
            allowed: true,
            current: state.cost,
            cap,
            reset_in_seconds,
        }
    }
}

fn apply_tokens(state: &mut CounterState, tokens: u32, limit: u32) -> TokenResult {
    let reset_in_seconds = state.reset_in_secs(Instant::now());
    let projected = state.count + u64::from(tokens);

    if projected > u64::from(limit) {
        TokenResult {
            allowed: false,
            current: state.count as u32,
            limit,
            reset_in_seconds,
        }
    } else {
        state.count = projected;

        TokenResult {
            allowed: true,
            current: state.count as u32,
            limit,
            reset_in_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use config::MemoryStoreConfig;

    use super::*;
    use crate::CounterStore;

    fn store() -> InMemoryStore {
        InMemoryStore::new(&MemoryStoreConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let store = store();

        for i in 1..=10 {
            let result = store.check_rate("rate:u1:ep", 10, 60, None).await.unwrap();
            assert!(result.allowed, "request {i} should be admitted");
            assert_eq!(result.current, i);
        }

        let result = store.check_rate("rate:u1:ep", 10, 60, None).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.current, 10);
    }

    #[tokio::test]
    async fn burst_allows_extra_requests_then_rejects() {
        let store = store();

        for _ in 0..10 {
            store.check_rate("rate:u2:ep", 10, 60, Some(5)).await.unwrap();
        }

        for i in 1..=5 {
            let result = store.check_rate("rate:u2:ep", 10, 60, Some(5)).await.unwrap();
            assert!(result.allowed, "burst request {i} should be admitted");
            assert_eq!(result.burst_tokens, Some(5 - i));
        }

        let result = store.check_rate("rate:u2:ep", 10, 60, Some(5)).await.unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn cost_rejects_without_incrementing() {
        let store = store();

        let first = store.increment_cost("cost:u3:ep", 0.06, 3600, 0.10).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.current, 0.06);

        let second = store.increment_cost("cost:u3:ep", 0.06, 3600, 0.10).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.current, 0.06);
    }

    #[tokio::test]
    async fn peek_never_increments() {
        let store = store();

        store.check_rate("rate:u4:ep", 10, 60, None).await.unwrap();
        let first_peek = store.peek_rate("rate:u4:ep", 10, 60).await.unwrap();
        let second_peek = store.peek_rate("rate:u4:ep", 10, 60).await.unwrap();

        assert_eq!(first_peek.current, second_peek.current);
        assert_eq!(first_peek.current, 1);
    }

    #[tokio::test]
    async fn generic_kv_roundtrips_and_expires() {
        let store = store();

        store.set("generic:u5:flag", b"1".to_vec(), Some(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("generic:u5:flag").await.unwrap(), None);

        store.set("generic:u5:flag", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("generic:u5:flag").await.unwrap(), Some(b"1".to_vec()));

        store.delete("generic:u5:flag").await.unwrap();
        assert_eq!(store.get("generic:u5:flag").await.unwrap(), None);
    }
}
