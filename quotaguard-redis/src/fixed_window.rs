//! Redis fixed window: a hash `{count, window_start}` under
//! `fixed_window:<principal>`. The script rolls the counter when the stored
//! window start no longer matches the aligned window for `now`, and the key
//! expires one window after its last touch.

use crate::{delete_matching, parse_pair, transport, CORRUPTED};
use async_trait::async_trait;
use quotaguard::{Algorithm, Clock, Decision, Engine, Policy, RateLimitError};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const TAG: &str = "redis-fixed-window";

const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window_start = math.floor(now / window) * window
local data = redis.call('HMGET', KEYS[1], 'count', 'window_start')
local count = tonumber(data[1])
local stored_start = tonumber(data[2])
if count == nil then count = 0 end
if count < 0 or count > capacity then
  redis.call('DEL', KEYS[1])
  return {-2, window_start}
end
if stored_start ~= window_start then
  count = 0
end
local result = -1
if count < capacity then
  count = count + 1
  result = capacity - count
end
redis.call('HMSET', KEYS[1], 'count', count, 'window_start', window_start)
redis.call('PEXPIRE', KEYS[1], window)
return {result, window_start}
"#;

const PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window_start = math.floor(now / window) * window
local data = redis.call('HMGET', KEYS[1], 'count', 'window_start')
local count = tonumber(data[1])
local stored_start = tonumber(data[2])
if count == nil then count = 0 end
if stored_start ~= window_start then
  count = 0
end
local result = -1
if count < capacity then
  result = capacity - count
end
return {result, window_start}
"#;

/// Cluster-wide fixed window engine.
pub struct RedisFixedWindowEngine {
    conn: ConnectionManager,
    capacity: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    peek_script: Script,
}

impl RedisFixedWindowEngine {
    /// Create an engine allowing `capacity` requests per aligned window of
    /// `window_ms` milliseconds.
    pub fn new(
        conn: ConnectionManager,
        capacity: u64,
        window_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        Policy::fixed_window(capacity, window_ms).validate()?;
        info!(
            target: "quotaguard_redis::fixed_window",
            capacity,
            window_ms,
            "redis fixed window engine initialized"
        );
        Ok(Self {
            conn,
            capacity,
            window_ms,
            clock,
            admit_script: Script::new(ADMIT_SCRIPT),
            peek_script: Script::new(PEEK_SCRIPT),
        })
    }

    fn storage_key(principal: &str) -> String {
        format!("fixed_window:{}", principal)
    }
}

#[async_trait]
impl Engine for RedisFixedWindowEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .admit_script
            .key(Self::storage_key(key))
            .arg(self.capacity)
            .arg(self.window_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, window_start) = parse_pair(&reply)?;

        if scalar == CORRUPTED {
            debug!(target: "quotaguard_redis::fixed_window", key = %key, "corrupt state erased");
            return Ok(Decision::denied(now + 1000, 1, TAG));
        }
        let reset = window_start.max(0) as u64 + self.window_ms;
        if scalar >= 0 {
            debug!(target: "quotaguard_redis::fixed_window", key = %key, remaining = scalar, "request allowed");
            Ok(Decision::allowed(scalar as u64, reset, TAG))
        } else {
            Ok(Decision::denied_at(reset, now, TAG))
        }
    }

    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .peek_script
            .key(Self::storage_key(key))
            .arg(self.capacity)
            .arg(self.window_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, window_start) = parse_pair(&reply)?;

        let reset = window_start.max(0) as u64 + self.window_ms;
        if scalar >= 0 {
            Ok(Decision::allowed(scalar as u64, reset, TAG))
        } else {
            Ok(Decision::denied_at(reset, now, TAG))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(Self::storage_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(transport)?;
        debug!(target: "quotaguard_redis::fixed_window", key = %key, "window reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let mut conn = self.conn.clone();
        let (count, window_start): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(Self::storage_key(key))
            .arg("count")
            .arg("window_start")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        match (count, window_start) {
            (Some(count), Some(window_start)) => Ok(json!({
                "algorithm": TAG,
                "currentCount": count,
                "limit": self.capacity,
                "remainingRequests": self.capacity.saturating_sub(count),
                "windowMs": self.window_ms,
                "windowStartTime": window_start,
                "windowEndTime": window_start + self.window_ms,
            })),
            _ => Ok(json!({ "algorithm": TAG, "status": "no state" })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        delete_matching(&mut conn, "fixed_window:*").await
    }

    /// The store's expiry reclaims inactive keys; nothing to sweep here.
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
