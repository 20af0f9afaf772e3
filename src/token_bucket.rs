//! Token bucket engine.
//!
//! Each principal owns a bucket of `capacity` tokens refilled at `rate`
//! tokens per second; an admission consumes one token. Refill is
//! integer-granular: only whole elapsed seconds add tokens, so a burst of
//! sub-second probes cannot creep the bucket upward.

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
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

/// In-memory token bucket engine. Per-key state lives in a sharded map, so
/// concurrent admissions for distinct principals never contend on a single
/// lock.
pub struct TokenBucketEngine {
    buckets: DashMap<String, BucketState>,
    capacity: u64,
    rate: f64,
    /// Time until the next whole token lands. Refill is whole-second
    /// granular, so this is never shorter than one second.
    reset_interval_ms: u64,
    clock: Arc<dyn Clock>,
}

impl TokenBucketEngine {
    /// Create an engine with `capacity` tokens refilled at `rate` per second.
    pub fn new(capacity: u64, rate: f64, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        Policy::token_bucket(capacity, rate).validate()?;
        info!(
            target: "quotaguard::token_bucket",
            capacity,
            rate,
            "token bucket engine initialized"
        );
        Ok(Self {
            buckets: DashMap::new(),
            capacity,
            rate,
            reset_interval_ms: interval_ms(rate).max(1000),
            clock,
        })
    }

    fn refill(&self, state: &mut BucketState, now: u64) {
        let elapsed = now.saturating_sub(state.last_refill_ms);
        let refill = (elapsed / 1000) as f64 * self.rate;
        if refill > 0.0 {
            state.tokens = (state.tokens + refill).min(self.capacity as f64);
            state.last_refill_ms = now;
        }
    }

    fn full_state(&self, now: u64) -> BucketState {
        BucketState { tokens: self.capacity as f64, last_refill_ms: now }
    }
}

#[async_trait]
impl Engine for TokenBucketEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| self.full_state(now));
        let state = entry.value_mut();

        if !state.tokens.is_finite() || state.tokens < 0.0 {
            error!(
                target: "quotaguard::token_bucket",
                key = %key,
                tokens = state.tokens,
                "bucket state violated its invariant, resetting key"
            );
            *state = self.full_state(now);
            return Ok(Decision::denied(now + 1000, 1, tag));
        }

        self.refill(state, now);
        let reset = state.last_refill_ms + self.reset_interval_ms;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            let remaining = state.tokens.floor() as u64;
            debug!(target: "quotaguard::token_bucket", key = %key, remaining, "request allowed");
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            let decision = Decision::denied_at(reset, now, tag);
            debug!(
                target: "quotaguard::token_bucket",
                key = %key,
                retry_after = decision.retry_after_secs,
                "request denied"
            );
            Ok(decision)
        }
    }

    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut snapshot = match self.buckets.get(key) {
            Some(entry) => entry.value().clone(),
            None => self.full_state(now),
        };
        self.refill(&mut snapshot, now);
        let reset = snapshot.last_refill_ms + self.reset_interval_ms;
        if snapshot.tokens >= 1.0 {
            Ok(Decision::allowed(snapshot.tokens.floor() as u64, reset, tag))
        } else {
            Ok(Decision::denied_at(reset, now, tag))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.remove(key);
        debug!(target: "quotaguard::token_bucket", key = %key, "bucket reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        match self.buckets.get(key) {
            Some(entry) => {
                let mut snapshot = entry.value().clone();
                drop(entry);
                self.refill(&mut snapshot, now);
                Ok(json!({
                    "algorithm": self.algorithm().tag(),
                    "currentTokens": snapshot.tokens,
                    "capacity": self.capacity,
                    "refillRate": self.rate,
                    "lastRefillTime": snapshot.last_refill_ms,
                    "lastRefillTimeFormatted": format_epoch_ms(snapshot.last_refill_ms),
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
        debug!(target: "quotaguard::token_bucket", "all buckets cleared");
        Ok(())
    }

    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError> {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now.saturating_sub(state.last_refill_ms) <= threshold_ms);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            info!(target: "quotaguard::token_bucket", removed, "cleaned up inactive buckets");
        }
        Ok(removed)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine(capacity: u64, rate: f64) -> (TokenBucketEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let engine = TokenBucketEngine::new(capacity, rate, clock.clone()).unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn single_token_bucket_denies_until_refill() {
        let (engine, clock) = engine(1, 0.1);

        let d = engine.admit("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);

        clock.set(1);
        let d = engine.admit("u").await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, 10);
        assert_eq!(d.reset_epoch_ms, 10_000);
    }

    #[tokio::test]
    async fn burst_up_to_capacity_then_refill_restores_one() {
        let (engine, clock) = engine(2, 1.0);

        assert!(engine.admit("u").await.unwrap().allowed);
        assert!(engine.admit("u").await.unwrap().allowed);
        assert!(!engine.admit("u").await.unwrap().allowed);

        clock.advance(1000);
        assert!(engine.admit("u").await.unwrap().allowed);
        assert!(!engine.admit("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn quiescence_caps_tokens_at_capacity() {
        let (engine, clock) = engine(3, 1.0);
        for _ in 0..3 {
            assert!(engine.admit("u").await.unwrap().allowed);
        }

        clock.advance(100_000);
        let d = engine.peek("u").await.unwrap();
        assert_eq!(d.remaining, 3);

        for _ in 0..3 {
            assert!(engine.admit("u").await.unwrap().allowed);
        }
        assert!(!engine.admit("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn sub_second_elapse_adds_nothing() {
        let (engine, clock) = engine(1, 10.0);
        assert!(engine.admit("u").await.unwrap().allowed);

        clock.advance(999);
        let d = engine.admit("u").await.unwrap();
        assert!(!d.allowed);
        // Whole-second refill: the next token lands at 1000, not at 100.
        assert_eq!(d.reset_epoch_ms, 1000);
        assert_eq!(d.retry_after_secs, 1);

        clock.advance(1);
        assert!(engine.admit("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn remaining_is_non_increasing_without_refill() {
        let (engine, _clock) = engine(5, 1.0);
        let mut last = u64::MAX;
        for _ in 0..5 {
            let d = engine.admit("u").await.unwrap();
            assert!(d.remaining <= last);
            last = d.remaining;
        }
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (engine, _clock) = engine(1, 0.1);
        assert!(engine.admit("a").await.unwrap().allowed);
        assert!(!engine.admit("a").await.unwrap().allowed);

        let d = engine.admit("b").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn reset_restores_full_quota() {
        let (engine, _clock) = engine(2, 0.5);
        engine.admit("u").await.unwrap();
        engine.admit("u").await.unwrap();

        engine.reset("u").await.unwrap();
        let d = engine.peek("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (engine, _clock) = engine(1, 0.5);
        assert_eq!(engine.peek("u").await.unwrap().remaining, 1);
        assert_eq!(engine.peek("u").await.unwrap().remaining, 1);
        assert!(engine.admit("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn stats_reflect_bucket_and_absence() {
        let (engine, _clock) = engine(4, 2.0);
        let absent = engine.stats("u").await.unwrap();
        assert_eq!(absent["status"], "no state");

        engine.admit("u").await.unwrap();
        let stats = engine.stats("u").await.unwrap();
        assert_eq!(stats["algorithm"], "token-bucket");
        assert_eq!(stats["capacity"], 4);
        assert_eq!(stats["currentTokens"], 3.0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_keys() {
        let (engine, clock) = engine(2, 1.0);
        engine.admit("old").await.unwrap();

        clock.advance(10_000);
        engine.admit("fresh").await.unwrap();

        let removed = engine.cleanup_inactive(5_000).await.unwrap();
        assert_eq!(removed, 1);
        // Untouched key starts over with a full bucket.
        assert_eq!(engine.peek("old").await.unwrap().remaining, 2);
        assert_eq!(engine.peek("fresh").await.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn clear_all_empties_every_bucket() {
        let (engine, _clock) = engine(1, 1.0);
        engine.admit("a").await.unwrap();
        engine.admit("b").await.unwrap();
        engine.clear_all().await.unwrap();
        assert_eq!(engine.peek("a").await.unwrap().remaining, 1);
        assert_eq!(engine.peek("b").await.unwrap().remaining, 1);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(TokenBucketEngine::new(0, 1.0, clock.clone()).is_err());
        assert!(TokenBucketEngine::new(1, 0.0, clock).is_err());
    }
}
