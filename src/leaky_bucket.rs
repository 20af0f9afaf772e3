//! Leaky bucket engine.
//!
//! Each principal owns a bounded queue, modeled as a level counter: an
//! admission raises the level by one, and the level drains at `rate`
//! requests per second. A full bucket denies. Draining is whole-second
//! granular, mirroring the token bucket's refill.

use crate::clock::{format_epoch_ms, Clock};
use crate::decision::Decision;
use crate::engine::Engine;
use crate::error::RateLimitError;
use crate::policy::{interval_ms, Algorithm, Policy};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
struct LevelState {
    level: f64,
    last_leak_ms: u64,
}

/// In-memory leaky bucket engine.
pub struct LeakyBucketEngine {
    buckets: DashMap<String, LevelState>,
    capacity: u64,
    rate: f64,
    /// Time until one queued request drains; at least one second because
    /// draining is whole-second granular.
    reset_interval_ms: u64,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketEngine {
    /// Create an engine holding up to `capacity` requests, drained at
    /// `rate` per second.
    pub fn new(capacity: u64, rate: f64, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        Policy::leaky_bucket(capacity, rate).validate()?;
        info!(
            target: "quotaguard::leaky_bucket",
            capacity,
            rate,
            "leaky bucket engine initialized"
        );
        Ok(Self {
            buckets: DashMap::new(),
            capacity,
            rate,
            reset_interval_ms: interval_ms(rate).max(1000),
            clock,
        })
    }

    fn leak(&self, state: &mut LevelState, now: u64) {
        let elapsed = now.saturating_sub(state.last_leak_ms);
        let leaked = (elapsed / 1000) as f64 * self.rate;
        if leaked > 0.0 {
            state.level = (state.level - leaked).max(0.0);
            state.last_leak_ms = now;
        }
    }
}

#[async_trait]
impl Engine for LeakyBucketEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| LevelState { level: 0.0, last_leak_ms: now });
        let state = entry.value_mut();

        if !state.level.is_finite() || state.level < 0.0 {
            error!(
                target: "quotaguard::leaky_bucket",
                key = %key,
                level = state.level,
                "bucket state violated its invariant, resetting key"
            );
            *state = LevelState { level: 0.0, last_leak_ms: now };
            return Ok(Decision::denied(now + 1000, 1, tag));
        }

        self.leak(state, now);
        let reset = state.last_leak_ms + self.reset_interval_ms;
        if state.level < self.capacity as f64 {
            state.level += 1.0;
            let remaining = (self.capacity as f64 - state.level).floor() as u64;
            debug!(target: "quotaguard::leaky_bucket", key = %key, remaining, "request queued");
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            let decision = Decision::denied_at(reset, now, tag);
            debug!(
                target: "quotaguard::leaky_bucket",
                key = %key,
                retry_after = decision.retry_after_secs,
                "bucket full, request denied"
            );
            Ok(decision)
        }
    }

    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut snapshot = match self.buckets.get(key) {
            Some(entry) => entry.value().clone(),
            None => LevelState { level: 0.0, last_leak_ms: now },
        };
        self.leak(&mut snapshot, now);
        let reset = snapshot.last_leak_ms + self.reset_interval_ms;
        if snapshot.level < self.capacity as f64 {
            let remaining = (self.capacity as f64 - snapshot.level).floor() as u64;
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            Ok(Decision::denied_at(reset, now, tag))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.remove(key);
        debug!(target: "quotaguard::leaky_bucket", key = %key, "bucket reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        match self.buckets.get(key) {
            Some(entry) => {
                let mut snapshot = entry.value().clone();
                drop(entry);
                self.leak(&mut snapshot, now);
                Ok(json!({
                    "algorithm": self.algorithm().tag(),
                    "currentLevel": snapshot.level,
                    "capacity": self.capacity,
                    "leakRate": self.rate,
                    "availableSpace": (self.capacity as f64 - snapshot.level).max(0.0),
                    "lastLeakTime": snapshot.last_leak_ms,
                    "lastLeakTimeFormatted": format_epoch_ms(snapshot.last_leak_ms),
                }))
            }
            None => Ok(json!({
                "algorithm": self.algorithm().tag(),
                "status": "no state",
            })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        self.buckets.clear();
        debug!(target: "quotaguard::leaky_bucket", "all buckets cleared");
        Ok(())
    }

    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError> {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now.saturating_sub(state.last_leak_ms) <= threshold_ms);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            info!(target: "quotaguard::leaky_bucket", removed, "cleaned up inactive buckets");
        }
        Ok(removed)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }
}
