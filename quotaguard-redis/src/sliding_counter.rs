//! Redis sliding window counter, weighted two-window form: one counter per
//! aligned window under `sliding_window_counter:<principal>:<window_id>`.
//! The estimate blends the previous window's count, weighted by how much of
//! it the trailing window still covers, with the current count. Counters
//! expire after two windows, which is exactly long enough to serve as the
//! "previous" window once.

use crate::{delete_matching, parse_pair, transport};
use async_trait::async_trait;
use quotaguard::{Algorithm, Clock, Decision, Engine, Policy, RateLimitError};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const TAG: &str = "redis-sliding-window-counter";

const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local current_window = math.floor(now / window)
local current_key = KEYS[1] .. ':' .. current_window
local previous_key = KEYS[1] .. ':' .. (current_window - 1)
local progress = (now % window) / window
local current_count = tonumber(redis.call('GET', current_key)) or 0
local previous_count = tonumber(redis.call('GET', previous_key)) or 0
local estimated = math.floor(previous_count * (1.0 - progress) + current_count)
local result = -1
if estimated < capacity then
  redis.call('INCR', current_key)
  redis.call('PEXPIRE', current_key, window * 2)
  result = math.max(0, capacity - estimated - 1)
end
return {result, (current_window + 1) * window}
"#;

const PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local current_window = math.floor(now / window)
local current_key = KEYS[1] .. ':' .. current_window
local previous_key = KEYS[1] .. ':' .. (current_window - 1)
local progress = (now % window) / window
local current_count = tonumber(redis.call('GET', current_key)) or 0
local previous_count = tonumber(redis.call('GET', previous_key)) or 0
local estimated = math.floor(previous_count * (1.0 - progress) + current_count)
local result = -1
if estimated < capacity then
  result = math.max(0, capacity - estimated)
end
return {result, (current_window + 1) * window}
"#;

/// Cluster-wide sliding window counter engine.
pub struct RedisSlidingCounterEngine {
    conn: ConnectionManager,
    capacity: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    peek_script: Script,
}

impl RedisSlidingCounterEngine {
    /// Create an engine allowing roughly `capacity` requests per trailing
    /// `window_ms`, estimated from two adjacent window counters.
    pub fn new(
        conn: ConnectionManager,
        capacity: u64,
        window_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        // The two-window form is the sub-bucket form at resolution 2.
        Policy::sliding_window_counter(capacity, window_ms, 2).validate()?;
        info!(
            target: "quotaguard_redis::sliding_counter",
            capacity,
            window_ms,
            "redis sliding window counter engine initialized"
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

    fn base_key(principal: &str) -> String {
        format!("sliding_window_counter:{}", principal)
    }

    fn window_key(principal: &str, window_id: u64) -> String {
        format!("sliding_window_counter:{}:{}", principal, window_id)
    }
}

#[async_trait]
impl Engine for RedisSlidingCounterEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .admit_script
            .key(Self::base_key(key))
            .arg(self.capacity)
            .arg(self.window_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, next_window_start) = parse_pair(&reply)?;

        let reset = next_window_start.max(0) as u64;
        if scalar >= 0 {
            debug!(target: "quotaguard_redis::sliding_counter", key = %key, remaining = scalar, "request allowed");
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
            .key(Self::base_key(key))
            .arg(self.capacity)
            .arg(self.window_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, next_window_start) = parse_pair(&reply)?;

        let reset = next_window_start.max(0) as u64;
        if scalar >= 0 {
            Ok(Decision::allowed(scalar as u64, reset, TAG))
        } else {
            Ok(Decision::denied_at(reset, now, TAG))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let now = self.clock.now_millis();
        let current = now / self.window_ms;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(Self::window_key(key, current));
        if let Some(previous) = current.checked_sub(1) {
            cmd.arg(Self::window_key(key, previous));
        }
        cmd.query_async::<()>(&mut conn).await.map_err(transport)?;
        debug!(target: "quotaguard_redis::sliding_counter", key = %key, "counter reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        let current = now / self.window_ms;
        let mut conn = self.conn.clone();
        let current_count: Option<u64> = redis::cmd("GET")
            .arg(Self::window_key(key, current))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        let previous_count: Option<u64> = match current.checked_sub(1) {
            Some(previous) => redis::cmd("GET")
                .arg(Self::window_key(key, previous))
                .query_async(&mut conn)
                .await
                .map_err(transport)?,
            None => None,
        };
        if current_count.is_none() && previous_count.is_none() {
            return Ok(json!({ "algorithm": TAG, "status": "no state" }));
        }
        let progress = (now % self.window_ms) as f64 / self.window_ms as f64;
        let estimated = previous_count.unwrap_or(0) as f64 * (1.0 - progress)
            + current_count.unwrap_or(0) as f64;
        Ok(json!({
            "algorithm": TAG,
            "currentWindowCount": current_count.unwrap_or(0),
            "previousWindowCount": previous_count.unwrap_or(0),
            "currentWeightedRequests": estimated,
            "limit": self.capacity,
            "windowMs": self.window_ms,
        }))
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        delete_matching(&mut conn, "sliding_window_counter:*").await
    }

    /// The store's expiry reclaims inactive keys; nothing to sweep here.
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowCounter
    }
}
