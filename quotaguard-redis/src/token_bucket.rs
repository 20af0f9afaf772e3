//! Redis token bucket: state is a hash `{tokens, last_refill}` under
//! `token_bucket:<principal>`, expiring after an hour of inactivity.

use crate::{delete_matching, parse_pair, transport, CORRUPTED};
use async_trait::async_trait;
use quotaguard::{Algorithm, Clock, Decision, Engine, Policy, RateLimitError};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const TAG: &str = "redis-token-bucket";

const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local data = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])
if tokens == nil then tokens = capacity end
if last_refill == nil then last_refill = now end
if tokens < 0 or tokens > capacity then
  redis.call('DEL', KEYS[1])
  return {-2, now}
end
local elapsed = math.max(0, now - last_refill)
local refill = math.floor(elapsed / 1000) * rate
if refill > 0 then
  tokens = math.min(capacity, tokens + refill)
  last_refill = now
end
local result = -1
if tokens >= 1 then
  tokens = tokens - 1
  result = math.floor(tokens)
end
redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_refill', last_refill)
redis.call('EXPIRE', KEYS[1], 3600)
return {result, last_refill}
"#;

const PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local data = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])
if tokens == nil then tokens = capacity end
if last_refill == nil then last_refill = now end
local elapsed = math.max(0, now - last_refill)
local refill = math.floor(elapsed / 1000) * rate
if refill > 0 then
  tokens = math.min(capacity, tokens + refill)
  last_refill = now
end
return {math.floor(tokens), last_refill}
"#;

/// Cluster-wide token bucket engine.
pub struct RedisTokenBucketEngine {
    conn: ConnectionManager,
    capacity: u64,
    rate: f64,
    reset_interval_ms: u64,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    peek_script: Script,
}

impl RedisTokenBucketEngine {
    /// Create an engine with `capacity` tokens refilled at `rate` per second.
    pub fn new(
        conn: ConnectionManager,
        capacity: u64,
        rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        let policy = Policy::token_bucket(capacity, rate);
        policy.validate()?;
        info!(
            target: "quotaguard_redis::token_bucket",
            capacity,
            rate,
            "redis token bucket engine initialized"
        );
        Ok(Self {
            conn,
            capacity,
            rate,
            reset_interval_ms: policy.period_ms().max(1000),
            clock,
            admit_script: Script::new(ADMIT_SCRIPT),
            peek_script: Script::new(PEEK_SCRIPT),
        })
    }

    fn storage_key(principal: &str) -> String {
        format!("token_bucket:{}", principal)
    }
}

#[async_trait]
impl Engine for RedisTokenBucketEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .admit_script
            .key(Self::storage_key(key))
            .arg(self.capacity)
            .arg(self.rate)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, last_refill) = parse_pair(&reply)?;

        if scalar == CORRUPTED {
            debug!(target: "quotaguard_redis::token_bucket", key = %key, "corrupt state erased");
            return Ok(Decision::denied(now + 1000, 1, TAG));
        }
        let reset = last_refill.max(0) as u64 + self.reset_interval_ms;
        if scalar >= 0 {
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
            .arg(self.rate)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (tokens, last_refill) = parse_pair(&reply)?;

        let reset = last_refill.max(0) as u64 + self.reset_interval_ms;
        if tokens >= 1 {
            Ok(Decision::allowed(tokens as u64, reset, TAG))
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
        debug!(target: "quotaguard_redis::token_bucket", key = %key, "bucket reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let mut conn = self.conn.clone();
        let (tokens, last_refill): (Option<f64>, Option<u64>) = redis::cmd("HMGET")
            .arg(Self::storage_key(key))
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => Ok(json!({
                "algorithm": TAG,
                "currentTokens": tokens,
                "capacity": self.capacity,
                "refillRate": self.rate,
                "lastRefillTime": last_refill,
            })),
            _ => Ok(json!({ "algorithm": TAG, "status": "no state" })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        delete_matching(&mut conn, "token_bucket:*").await
    }

    /// The store's expiry reclaims inactive keys; nothing to sweep here.
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
