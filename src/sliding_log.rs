//! Sliding window log engine.
//!
//! Each principal owns an insertion-ordered log of admission timestamps.
//! A timestamp falls out of the window once it is a full `window_ms` old,
//! so a retry at exactly `oldest + window_ms`, the reported reset time,
//! is admitted. Equal timestamps are kept with their multiplicity.

use crate::clock::{format_epoch_ms, Clock};
use crate::decision::Decision;
use crate::engine::Engine;
use crate::error::RateLimitError;
use crate::policy::{Algorithm, Policy};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory sliding window log engine. Admission work is amortized O(1):
/// each stored timestamp is evicted exactly once.
pub struct SlidingLogEngine {
    logs: DashMap<String, VecDeque<u64>>,
    capacity: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl SlidingLogEngine {
    /// Create an engine allowing `capacity` requests in any trailing window
    /// of `window_ms` milliseconds.
    pub fn new(capacity: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        Policy::sliding_window_log(capacity, window_ms).validate()?;
        info!(
            target: "quotaguard::sliding_log",
            capacity,
            window_ms,
            "sliding window log engine initialized"
        );
        Ok(Self { logs: DashMap::new(), capacity, window_ms, clock })
    }

    fn evict(&self, log: &mut VecDeque<u64>, now: u64) {
        while let Some(&oldest) = log.front() {
            if oldest + self.window_ms <= now {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset_time(&self, log: &VecDeque<u64>, now: u64) -> u64 {
        match log.front() {
            Some(&oldest) => oldest + self.window_ms,
            None => now + self.window_ms,
        }
    }
}

#[async_trait]
impl Engine for SlidingLogEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut entry = self.logs.entry(key.to_string()).or_default();
        let log = entry.value_mut();

        self.evict(log, now);
        let count = log.len() as u64;
        if count < self.capacity {
            log.push_back(now);
            let remaining = self.capacity - count - 1;
            let reset = self.reset_time(log, now);
            debug!(
                target: "quotaguard::sliding_log",
                key = %key,
                count = count + 1,
                "request allowed"
            );
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            let reset = self.reset_time(log, now);
            let decision = Decision::denied_at(reset, now, tag);
            debug!(
                target: "quotaguard::sliding_log",
                key = %key,
                retry_after = decision.retry_after_secs,
                "window limit exceeded"
            );
            Ok(decision)
        }
    }

    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let (count, oldest_live) = match self.logs.get(key) {
            Some(entry) => {
                let live: Vec<u64> = entry
                    .value()
                    .iter()
                    .copied()
                    .filter(|&ts| ts + self.window_ms > now)
                    .collect();
                (live.len() as u64, live.first().copied())
            }
            None => (0, None),
        };
        let reset = match oldest_live {
            Some(oldest) => oldest + self.window_ms,
            None => now + self.window_ms,
        };
        if count < self.capacity {
            Ok(Decision::allowed(self.capacity - count, reset, tag))
        } else {
            Ok(Decision::denied_at(reset, now, tag))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.logs.remove(key);
        debug!(target: "quotaguard::sliding_log", key = %key, "log reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        match self.logs.get(key) {
            Some(entry) => {
                let live: Vec<u64> = entry
                    .value()
                    .iter()
                    .copied()
                    .filter(|&ts| ts + self.window_ms > now)
                    .collect();
                let formatted: Vec<String> =
                    live.iter().map(|&ts| format_epoch_ms(ts)).collect();
                Ok(json!({
                    "algorithm": self.algorithm().tag(),
                    "currentRequests": live.len(),
                    "limit": self.capacity,
                    "remainingRequests": self.capacity.saturating_sub(live.len() as u64),
                    "windowMs": self.window_ms,
                    "requestLog": formatted,
                }))
            }
            None => Ok(json!({
                "algorithm": self.algorithm().tag(),
                "status": "no state",
            })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        self.logs.clear();
        debug!(target: "quotaguard::sliding_log", "all logs cleared");
        Ok(())
    }

    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError> {
        let now = self.clock.now_millis();
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            match log.back() {
                Some(&newest) => now.saturating_sub(newest) <= threshold_ms,
                None => false,
            }
        });
        let removed = before.saturating_sub(self.logs.len());
        if removed > 0 {
            info!(target: "quotaguard::sliding_log", removed, "cleaned up inactive logs");
        }
        Ok(removed)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowLog
    }
}
