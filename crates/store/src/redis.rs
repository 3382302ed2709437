//! Redis-backed counter store. Every check-and-mutate operation is a single
//! `redis::Script` so the read-decide-write sequence is atomic server-side.

use config::RedisConfig;
use redis::AsyncCommands;
use redis::Script;

use crate::error::StoreError;
use crate::redis_pool::{self, Pool};
use crate::result::{CostResult, RateResult, TokenResult};

/// `KEYS[1]` = counter key, `KEYS[2]` = burst key (ignored when `has_burst` is 0).
/// `ARGV` = [limit, window_secs, has_burst, burst_max]. TTL is anchored on
/// first use and preserved (`KEEPTTL`) on every later increment, so the fixed
/// window never gets pushed back by later requests.
/// Returns `{allowed, count, ttl, burst_remaining_or_minus_one}`.
const CHECK_RATE_SCRIPT: &str = r#"
local count = redis.call('GET', KEYS[1])
local is_new = false
if not count then
  count = 0
  is_new = true
else
  count = tonumber(count)
end

local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local has_burst = tonumber(ARGV[3])
local burst_max = tonumber(ARGV[4])

local bt = -1
local burst_is_new = is_new
if has_burst == 1 then
  if is_new then
    bt = burst_max
  else
    local v = redis.call('GET', KEYS[2])
    if v then
      bt = tonumber(v)
    else
      bt = burst_max
      burst_is_new = true
    end
  end
end

local allowed = 0
if count < limit then
  count = count + 1
  allowed = 1
elseif has_burst == 1 and bt > 0 then
  bt = bt - 1
  count = count + 1
  allowed = 1
end

if allowed == 1 then
  if is_new then
    redis.call('SET', KEYS[1], count, 'EX', window)
  else
    redis.call('SET', KEYS[1], count, 'KEEPTTL')
  end
  if has_burst == 1 then
    if burst_is_new then
      redis.call('SET', KEYS[2], bt, 'EX', window)
    else
      redis.call('SET', KEYS[2], bt, 'KEEPTTL')
    end
  end
end

local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then ttl = window end

return {allowed, count, ttl, bt}
"#;

/// `KEYS[1]` = cost key. `ARGV` = [cost, window_secs, cap]. TTL is set on
/// first use and preserved (`KEEPTTL`) on every later update.
/// Returns `{allowed, current_as_string, ttl}`.
const INCREMENT_COST_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local cost = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])

local allowed = 0
if current + cost <= cap then
  current = current + cost
  allowed = 1

  local ttl = redis.call('TTL', KEYS[1])
  if ttl < 0 then
    redis.call('SET', KEYS[1], current, 'EX', window)
  else
    redis.call('SET', KEYS[1], current, 'KEEPTTL')
  end
end

local ttl2 = redis.call('TTL', KEYS[1])
if ttl2 < 0 then ttl2 = window end

return {allowed, tostring(current), ttl2}
"#;

/// `KEYS[1]` = token key. `ARGV` = [tokens, window_secs, limit].
/// Returns `{allowed, current, ttl}`.
const INCREMENT_TOKENS_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local tokens = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

local allowed = 0
if current + tokens <= limit then
  current = current + tokens
  allowed = 1

  local ttl = redis.call('TTL', KEYS[1])
  if ttl < 0 then
    redis.call('SET', KEYS[1], current, 'EX', window)
  else
    redis.call('SET', KEYS[1], current, 'KEEPTTL')
  end
end

local ttl2 = redis.call('TTL', KEYS[1])
if ttl2 < 0 then ttl2 = window end

return {allowed, current, ttl2}
"#;

/// Redis-backed implementation of [`crate::CounterStore`].
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
    check_rate: Script,
    increment_cost: Script,
    increment_tokens: Script,
}

impl RedisStore {
    /// Connect to Redis using the given configuration.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let pool = redis_pool::create_pool(config).map_err(|e| StoreError::Config(e.to_string()))?;

        // Fail fast on a bad URL/credentials rather than at the first request.
        let mut conn = pool.get().await.map_err(|e| StoreError::Config(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            check_rate: Script::new(CHECK_RATE_SCRIPT),
            increment_cost: Script::new(INCREMENT_COST_SCRIPT),
            increment_tokens: Script::new(INCREMENT_TOKENS_SCRIPT),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<deadpool::managed::Object<redis_pool::Manager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Transient(format!("redis pool: {e}")))
    }
}

impl crate::CounterStore for RedisStore {
    async fn check_rate(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        burst: Option<u32>,
    ) -> Result<RateResult, StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.prefixed(key);
        let burst_key = self.prefixed(&format!("{key}:burst"));

        let (allowed, count, ttl, burst_remaining): (i64, u32, i64, i64) = self
            .check_rate
            .key(&counter_key)
            .key(&burst_key)
            .arg(limit)
            .arg(window_secs)
            .arg(if burst.is_some() { 1 } else { 0 })
            .arg(burst.unwrap_or(0))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Transient(format!("redis check_rate: {e}")))?;

        Ok(RateResult {
            allowed: allowed == 1,
            current: count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_in_seconds: ttl.max(0) as u64,
            burst_tokens: (burst_remaining >= 0).then_some(burst_remaining as u32),
        })
    }

    async fn peek_rate(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateResult, StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.prefixed(key);

        let count: Option<u32> = conn
            .get(&counter_key)
            .await
            .map_err(|e| StoreError::Transient(format!("redis peek_rate: {e}")))?;

        let ttl: i64 = conn
            .ttl(&counter_key)
            .await
            .map_err(|e| StoreError::Transient(format!("redis peek_rate ttl: {e}")))?;

        let current = count.unwrap_or(0);

        Ok(RateResult {
            allowed: current < limit,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_in_seconds: if ttl >= 0 { ttl as u64 } else { window_secs },
            burst_tokens: None,
        })
    }

    async fn increment_cost(&self, key: &str, cost: f64, window_secs: u64, cap: f64) -> Result<CostResult, StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.prefixed(key);

        let (allowed, current, ttl): (i64, String, i64) = self
            .increment_cost
            .key(&counter_key)
            .arg(cost)
            .arg(window_secs)
            .arg(cap)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Transient(format!("redis increment_cost: {e}")))?;

        let current: f64 = current
            .parse()
            .map_err(|e| StoreError::Fatal(format!("redis returned malformed cost value: {e}")))?;

        Ok(CostResult {
            allowed: allowed == 1,
            current,
            cap,
            reset_in_seconds: ttl.max(0) as u64,
        })
    }

    async fn increment_tokens(
        &self,
        key: &str,
        tokens: u32,
        window_secs: u64,
        limit: u32,
    ) -> Result<TokenResult, StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.prefixed(key);

        let (allowed, current, ttl): (i64, u32, i64) = self
            .increment_tokens
            .key(&counter_key)
            .arg(tokens)
            .arg(window_secs)
            .arg(limit)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Transient(format!("redis increment_tokens: {e}")))?;

        Ok(TokenResult {
            allowed: allowed == 1,
            current,
            limit,
            reset_in_seconds: ttl.max(0) as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;

        conn.get(self.prefixed(key))
            .await
            .map_err(|e| StoreError::Transient(format!("redis get: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.prefixed(key);

        match ttl_secs {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(&key, value, ttl)
                .await
                .map_err(|e| StoreError::Transient(format!("redis set: {e}")))?,
            None => conn
                .set::<_, _, ()>(&key, value)
                .await
                .map_err(|e| StoreError::Transient(format!("redis set: {e}")))?,
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        conn.del::<_, ()>(self.prefixed(key))
            .await
            .map_err(|e| StoreError::Transient(format!("redis delete: {e}")))
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };

        Ok(redis::cmd("PING").query_async::<String>(&mut *conn).await.is_ok())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
