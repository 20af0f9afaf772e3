//! Sliding window counter engine.
//!
//! The trailing window is approximated by `sub_windows` aligned sub-buckets.
//! Each sub-bucket contributes its count weighted by how much of it overlaps
//! the trailing window, so the estimate degrades smoothly as a bucket slides
//! out instead of dropping all at once at a boundary.

use crate::clock::{format_epoch_ms, Clock};
use crate::decision::Decision;
use crate::engine::Engine;
use crate::error::RateLimitError;
use crate::policy::{Algorithm, Policy};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory sliding window counter engine.
pub struct SlidingCounterEngine {
    counters: DashMap<String, BTreeMap<u64, u64>>,
    capacity: u64,
    window_ms: u64,
    sub_window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl SlidingCounterEngine {
    /// Create an engine allowing roughly `capacity` requests per trailing
    /// `window_ms`, tracked in `sub_windows` sub-buckets.
    pub fn new(
        capacity: u64,
        window_ms: u64,
        sub_windows: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        Policy::sliding_window_counter(capacity, window_ms, sub_windows).validate()?;
        info!(
            target: "quotaguard::sliding_counter",
            capacity,
            window_ms,
            sub_windows,
            "sliding window counter engine initialized"
        );
        Ok(Self {
            counters: DashMap::new(),
            capacity,
            window_ms,
            sub_window_ms: window_ms / u64::from(sub_windows),
            clock,
        })
    }

    /// Drop sub-buckets that no longer overlap the trailing window. A bucket
    /// leaves once its whole span is a full window old, mirroring the log
    /// engine's boundary: state created at `t` stops counting at `t + window`.
    fn evict(&self, buckets: &mut BTreeMap<u64, u64>, now: u64) {
        let boundary = now.saturating_sub(self.window_ms);
        buckets.retain(|&start, _| start + self.sub_window_ms > boundary);
    }

    /// Weighted request count over the trailing window. The oldest bucket is
    /// clipped against the window start and decays linearly as it slides
    /// out; every younger bucket, the current one included, counts in full.
    fn weighted_count(&self, buckets: &BTreeMap<u64, u64>, now: u64) -> f64 {
        let window_start = now.saturating_sub(self.window_ms);
        buckets
            .iter()
            .map(|(&start, &count)| {
                let overlap = (start + self.sub_window_ms)
                    .saturating_sub(start.max(window_start))
                    .min(self.sub_window_ms);
                count as f64 * overlap as f64 / self.sub_window_ms as f64
            })
            .sum()
    }

    /// When the estimate next recovers: the oldest bucket's departure from
    /// the window, but never sooner than one sub-window out: a straddling
    /// bucket keeps partial weight past `oldest + window`, and the estimate
    /// only changes meaningfully at sub-window resolution.
    fn reset_time(&self, buckets: &BTreeMap<u64, u64>, now: u64) -> u64 {
        let candidate = match buckets.keys().next() {
            Some(&oldest) => oldest + self.window_ms,
            None => now + self.window_ms,
        };
        candidate.max(now + self.sub_window_ms)
    }

    fn sub_window_start(&self, now: u64) -> u64 {
        now / self.sub_window_ms * self.sub_window_ms
    }
}

#[async_trait]
impl Engine for SlidingCounterEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut entry = self.counters.entry(key.to_string()).or_default();
        let buckets = entry.value_mut();

        self.evict(buckets, now);
        let weighted = self.weighted_count(buckets, now);
        if weighted.floor() < self.capacity as f64 {
            *buckets.entry(self.sub_window_start(now)).or_insert(0) += 1;
            let remaining = (self.capacity as f64 - weighted - 1.0).floor().max(0.0) as u64;
            let reset = self.reset_time(buckets, now);
            debug!(
                target: "quotaguard::sliding_counter",
                key = %key,
                weighted = weighted + 1.0,
                "request allowed"
            );
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            let reset = self.reset_time(buckets, now);
            let decision = Decision::denied_at(reset, now, tag);
            debug!(
                target: "quotaguard::sliding_counter",
                key = %key,
                weighted,
                retry_after = decision.retry_after_secs,
                "window limit exceeded"
            );
            Ok(decision)
        }
    }

    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut snapshot = match self.counters.get(key) {
            Some(entry) => entry.value().clone(),
            None => BTreeMap::new(),
        };
        self.evict(&mut snapshot, now);
        let weighted = self.weighted_count(&snapshot, now);
        let reset = self.reset_time(&snapshot, now);
        if weighted.floor() < self.capacity as f64 {
            let remaining = (self.capacity as f64 - weighted).floor().max(0.0) as u64;
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            Ok(Decision::denied_at(reset, now, tag))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.counters.remove(key);
        debug!(target: "quotaguard::sliding_counter", key = %key, "counter reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        match self.counters.get(key) {
            Some(entry) => {
                let mut snapshot = entry.value().clone();
                drop(entry);
                self.evict(&mut snapshot, now);
                let weighted = self.weighted_count(&snapshot, now);
                let sub_window_counts: serde_json::Map<String, serde_json::Value> = snapshot
                    .iter()
                    .map(|(&start, &count)| (format_epoch_ms(start), count.into()))
                    .collect();
                Ok(json!({
                    "algorithm": self.algorithm().tag(),
                    "currentWeightedRequests": weighted,
                    "limit": self.capacity,
                    "remainingRequests": (self.capacity as f64 - weighted).floor().max(0.0) as u64,
                    "windowMs": self.window_ms,
                    "subWindowMs": self.sub_window_ms,
                    "activeSubWindows": snapshot.len(),
                    "subWindowCounts": sub_window_counts,
                }))
            }
            None => Ok(json!({
                "algorithm": self.algorithm().tag(),
                "status": "no state",
            })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        self.counters.clear();
        debug!(target: "quotaguard::sliding_counter", "all counters cleared");
        Ok(())
    }

    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError> {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, buckets| {
            let boundary = now.saturating_sub(self.window_ms);
            buckets.retain(|&start, _| start + self.sub_window_ms > boundary);
            match buckets.keys().next_back() {
                Some(&newest) => now.saturating_sub(newest) <= threshold_ms,
                None => false,
            }
        });
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            info!(target: "quotaguard::sliding_counter", removed, "cleaned up inactive counters");
        }
        Ok(removed)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowCounter
    }
}
