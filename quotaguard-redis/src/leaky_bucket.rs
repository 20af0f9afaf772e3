//! Redis leaky bucket: queued requests live in a sorted set under
//! `leaky_bucket:<principal>` scored by arrival time, with the last drain
//! instant in a companion string key. Whole requests drain per elapsed
//! second; both keys expire after an hour of inactivity.

use crate::{delete_matching, parse_pair, transport};
use async_trait::async_trait;
use quotaguard::{Algorithm, Clock, Decision, Engine, Policy, RateLimitError};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const TAG: &str = "redis-leaky-bucket";

const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local request_id = ARGV[4]
local last_leak = tonumber(redis.call('GET', KEYS[2]))
if last_leak == nil then last_leak = now end
local elapsed = math.max(0, now - last_leak)
local to_leak = math.floor(math.floor(elapsed / 1000) * rate)
if to_leak >= 1 then
  redis.call('ZREMRANGEBYRANK', KEYS[1], 0, to_leak - 1)
  last_leak = now
end
redis.call('SET', KEYS[2], last_leak)
redis.call('EXPIRE', KEYS[2], 3600)
local size = redis.call('ZCARD', KEYS[1])
local result = -1
if size < capacity then
  redis.call('ZADD', KEYS[1], now, request_id)
  redis.call('EXPIRE', KEYS[1], 3600)
  result = capacity - size - 1
end
return {result, last_leak}
"#;

const PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local last_leak = tonumber(redis.call('GET', KEYS[2]))
if last_leak == nil then last_leak = now end
local elapsed = math.max(0, now - last_leak)
local to_leak = math.floor(math.floor(elapsed / 1000) * rate)
local size = redis.call('ZCARD', KEYS[1])
local simulated = math.max(0, size - to_leak)
local result = -1
if simulated < capacity then
  result = capacity - simulated
end
return {result, last_leak}
"#;

/// Cluster-wide leaky bucket engine.
pub struct RedisLeakyBucketEngine {
    conn: ConnectionManager,
    capacity: u64,
    rate: f64,
    reset_interval_ms: u64,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    peek_script: Script,
}

impl RedisLeakyBucketEngine {
    /// Create an engine holding up to `capacity` requests, drained at
    /// `rate` per second.
    pub fn new(
        conn: ConnectionManager,
        capacity: u64,
        rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        let policy = Policy::leaky_bucket(capacity, rate);
        policy.validate()?;
        info!(
            target: "quotaguard_redis::leaky_bucket",
            capacity,
            rate,
            "redis leaky bucket engine initialized"
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
        format!("leaky_bucket:{}", principal)
    }

    fn last_leak_key(principal: &str) -> String {
        format!("leaky_bucket:{}:last_leak", principal)
    }

    /// Next drain estimate. The drain timestamp only advances on whole
    /// drains, so for slow rates the nominal `last_leak + interval` may
    /// already be behind `now`; the next whole second is the earliest a
    /// drain can land in that case.
    fn reset_after(&self, last_leak: i64, now: u64) -> u64 {
        (last_leak.max(0) as u64 + self.reset_interval_ms).max(now + 1000)
    }
}

#[async_trait]
impl Engine for RedisLeakyBucketEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .admit_script
            .key(Self::storage_key(key))
            .key(Self::last_leak_key(key))
            .arg(self.capacity)
            .arg(self.rate)
            .arg(now)
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, last_leak) = parse_pair(&reply)?;

        let reset = self.reset_after(last_leak, now);
        if scalar >= 0 {
            debug!(target: "quotaguard_redis::leaky_bucket", key = %key, remaining = scalar, "request queued");
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
            .key(Self::last_leak_key(key))
            .arg(self.capacity)
            .arg(self.rate)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        let (scalar, last_leak) = parse_pair(&reply)?;

        let reset = self.reset_after(last_leak, now);
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
            .arg(Self::last_leak_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(transport)?;
        debug!(target: "quotaguard_redis::leaky_bucket", key = %key, "bucket reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let mut conn = self.conn.clone();
        let size: u64 = redis::cmd("ZCARD")
            .arg(Self::storage_key(key))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        let last_leak: Option<u64> = redis::cmd("GET")
            .arg(Self::last_leak_key(key))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        match last_leak {
            Some(last_leak) => Ok(json!({
                "algorithm": TAG,
                "currentLevel": size,
                "capacity": self.capacity,
                "leakRate": self.rate,
                "availableSpace": self.capacity.saturating_sub(size),
                "lastLeakTime": last_leak,
            })),
            None => Ok(json!({ "algorithm": TAG, "status": "no state" })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        delete_matching(&mut conn, "leaky_bucket:*").await
    }

    /// The store's expiry reclaims inactive keys; nothing to sweep here.
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }
}
