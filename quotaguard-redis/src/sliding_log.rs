//! Redis sliding window log: a sorted set under
//! `sliding_window_log:<principal>` holding one member per admission,
//! scored by arrival time. Eviction is boundary-inclusive: an entry is
//! dropped once it is a full window old, so a retry at the reported reset
//! instant is admitted. The key expires two windows plus a minute after
//! its last touch.

use crate::{delete_matching, parse_pair, transport};
use async_trait::async_trait;
use quotaguard::{Algorithm, Clock, Decision, Engine, Policy, RateLimitError};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const TAG: &str = "redis-sliding-window-log";

const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local request_id = ARGV[4]
local boundary = now - window
if boundary >= 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, boundary)
end
local count = redis.call('ZCARD', KEYS[1])
local result = -1
if count < capacity then
  redis.call('ZADD', KEYS[1], now, request_id)
  result = capacity - count - 1
end
redis.call('EXPIRE', KEYS[1], math.ceil(window / 1000) * 2 + 60)
local oldest = now
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if first[2] ~= nil then oldest = tonumber(first[2]) end
return {result, oldest}
"#;

const PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local boundary = now - window
if boundary >= 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, boundary)
end
local count = redis.call('ZCARD', KEYS[1])
local result = -1
if count < capacity then
  result = capacity - count
end
local oldest = now
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if first[2] ~= nil then oldest = tonumber(first[2]) end
return {result, oldest}
"#;

/// Cluster-wide sliding window log engine.
pub struct RedisSlidingLogEngine {
    conn: ConnectionManager,
    capacity: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    peek_script: Script,
}

impl RedisSlidingLogEngine {
    /// Create an engine allowing `capacity` requests in any trailing window
    /// of `window_ms` milliseconds.
    pub fn new(
        conn: ConnectionManager,
        capacity: u64,
        window_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        Policy::sliding_window_log(capacity, window_ms).validate()?;
        info!(
            target: "quotaguard_redis::sliding_log",
            capacity,
            window_ms,
            "redis sliding window log engine initialized"
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
        format!("sliding_window_log:{}", principal)
    }
}

#[async_trait]
impl Engine for RedisSlidingLogEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let request_id = format!("{}_{}", now, &uuid::Uuid::new_v4().to_string()[..8]);
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .admit_script
            .key(Self::storage_key(key))
            .arg(self.capacity)
            .arg(self.window_ms)
            .arg(now)
            .arg(request_id)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, oldest) = parse_pair(&reply)?;

        let reset = oldest.max(0) as u64 + self.window_ms;
        if scalar >= 0 {
            debug!(target: "quotaguard_redis::sliding_log", key = %key, remaining = scalar, "request allowed");
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
        let (scalar, oldest) = parse_pair(&reply)?;

        let reset = oldest.max(0) as u64 + self.window_ms;
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
        debug!(target: "quotaguard_redis::sliding_log", key = %key, "log reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(Self::storage_key(key))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        if count == 0 {
            return Ok(json!({ "algorithm": TAG, "status": "no state" }));
        }
        Ok(json!({
            "algorithm": TAG,
            "currentRequests": count,
            "limit": self.capacity,
            "remainingRequests": self.capacity.saturating_sub(count),
            "windowMs": self.window_ms,
        }))
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        delete_matching(&mut conn, "sliding_window_log:*").await
    }

    /// The store's expiry reclaims inactive keys; nothing to sweep here.
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowLog
    }
}
