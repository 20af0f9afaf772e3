//! Fixed window engine.
//!
//! Requests are counted inside aligned windows of `window_ms` milliseconds:
//! window start is `now` rounded down to a window boundary, and the interval
//! is half-open, so a request arriving exactly at a boundary belongs to the
//! new window and sees a zero count.

use crate::clock::{format_epoch_ms, Clock};
use crate::decision::Decision;
use crate::engine::Engine;
use crate::error::RateLimitError;
use crate::policy::{Algorithm, Policy};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
struct WindowState {
    count: u64,
    window_start_ms: u64,
}

/// In-memory fixed window engine.
pub struct FixedWindowEngine {
    windows: DashMap<String, WindowState>,
    capacity: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl FixedWindowEngine {
    /// Create an engine allowing `capacity` requests per aligned window of
    /// `window_ms` milliseconds.
    pub fn new(capacity: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        Policy::fixed_window(capacity, window_ms).validate()?;
        info!(
            target: "quotaguard::fixed_window",
            capacity,
            window_ms,
            "fixed window engine initialized"
        );
        Ok(Self { windows: DashMap::new(), capacity, window_ms, clock })
    }

    fn window_start(&self, now: u64) -> u64 {
        now / self.window_ms * self.window_ms
    }

    /// Roll the window if `now` has crossed a boundary.
    fn roll(&self, state: &mut WindowState, now: u64) {
        let current = self.window_start(now);
        if state.window_start_ms != current {
            state.window_start_ms = current;
            state.count = 0;
        }
    }
}

#[async_trait]
impl Engine for FixedWindowEngine {
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError> {
        let tag = self.algorithm().tag();
        let now = self.clock.now_millis();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| WindowState {
            count: 0,
            window_start_ms: self.window_start(now),
        });
        let state = entry.value_mut();

        if state.count > self.capacity {
            error!(
                target: "quotaguard::fixed_window",
                key = %key,
                count = state.count,
                "window count exceeded capacity, resetting key"
            );
            *state = WindowState { count: 0, window_start_ms: self.window_start(now) };
            return Ok(Decision::denied(now + 1000, 1, tag));
        }

        self.roll(state, now);
        let reset = state.window_start_ms + self.window_ms;
        if state.count < self.capacity {
            state.count += 1;
            let remaining = self.capacity - state.count;
            debug!(
                target: "quotaguard::fixed_window",
                key = %key,
                count = state.count,
                "request allowed"
            );
            Ok(Decision::allowed(remaining, reset, tag))
        } else {
            let decision = Decision::denied_at(reset, now, tag);
            debug!(
                target: "quotaguard::fixed_window",
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
        let mut snapshot = match self.windows.get(key) {
            Some(entry) => entry.value().clone(),
            None => WindowState { count: 0, window_start_ms: self.window_start(now) },
        };
        self.roll(&mut snapshot, now);
        let reset = snapshot.window_start_ms + self.window_ms;
        if snapshot.count < self.capacity {
            Ok(Decision::allowed(self.capacity - snapshot.count, reset, tag))
        } else {
            Ok(Decision::denied_at(reset, now, tag))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.windows.remove(key);
        debug!(target: "quotaguard::fixed_window", key = %key, "window reset");
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError> {
        let now = self.clock.now_millis();
        match self.windows.get(key) {
            Some(entry) => {
                let mut snapshot = entry.value().clone();
                drop(entry);
                self.roll(&mut snapshot, now);
                let window_end = snapshot.window_start_ms + self.window_ms;
                Ok(json!({
                    "algorithm": self.algorithm().tag(),
                    "currentCount": snapshot.count,
                    "limit": self.capacity,
                    "remainingRequests": self.capacity.saturating_sub(snapshot.count),
                    "windowMs": self.window_ms,
                    "windowStartTime": snapshot.window_start_ms,
                    "windowStartTimeFormatted": format_epoch_ms(snapshot.window_start_ms),
                    "windowEndTime": window_end,
                    "windowEndTimeFormatted": format_epoch_ms(window_end),
                }))
            }
            None => Ok(json!({
                "algorithm": self.algorithm().tag(),
                "status": "no state",
            })),
        }
    }

    async fn clear_all(&self) -> Result<(), RateLimitError> {
        self.windows.clear();
        debug!(target: "quotaguard::fixed_window", "all windows cleared");
        Ok(())
    }

    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError> {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_sub(state.window_start_ms) <= threshold_ms);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            info!(target: "quotaguard::fixed_window", removed, "cleaned up inactive windows");
        }
        Ok(removed)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine(capacity: u64, window_ms: u64) -> (FixedWindowEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let engine = FixedWindowEngine::new(capacity, window_ms, clock.clone()).unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn rollover_resets_the_count() {
        let (engine, clock) = engine(1, 5_000);

        let d = engine.admit("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.reset_epoch_ms, 5_000);

        clock.set(1);
        let d = engine.admit("u").await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reset_epoch_ms, 5_000);

        clock.set(6_000);
        let d = engine.admit("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.reset_epoch_ms, 10_000);
    }

    #[tokio::test]
    async fn boundary_request_belongs_to_the_next_window() {
        let (engine, clock) = engine(1, 5_000);
        assert!(engine.admit("u").await.unwrap().allowed);

        clock.set(4_999);
        assert!(!engine.admit("u").await.unwrap().allowed);

        // Exactly at the boundary the new window is empty.
        clock.set(5_000);
        let d = engine.admit("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.reset_epoch_ms, 10_000);
    }

    #[tokio::test]
    async fn exactly_capacity_requests_fit_in_one_window() {
        let (engine, clock) = engine(3, 60_000);
        clock.set(60_000);
        for _ in 0..3 {
            assert!(engine.admit("u").await.unwrap().allowed);
        }
        assert!(!engine.admit("u").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let (engine, _clock) = engine(3, 60_000);
        assert_eq!(engine.admit("u").await.unwrap().remaining, 2);
        assert_eq!(engine.admit("u").await.unwrap().remaining, 1);
        assert_eq!(engine.admit("u").await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (engine, _clock) = engine(1, 60_000);
        assert!(engine.admit("a").await.unwrap().allowed);
        assert!(!engine.admit("a").await.unwrap().allowed);

        let d = engine.admit("b").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn reset_is_observable_through_peek() {
        let (engine, _clock) = engine(2, 60_000);
        engine.admit("u").await.unwrap();
        engine.admit("u").await.unwrap();
        assert!(!engine.peek("u").await.unwrap().allowed);

        engine.reset("u").await.unwrap();
        let d = engine.peek("u").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn denied_retry_targets_the_window_end() {
        let (engine, clock) = engine(1, 5_000);
        engine.admit("u").await.unwrap();
        clock.set(1_200);
        let d = engine.admit("u").await.unwrap();
        assert!(!d.allowed);
        // 3.8s left in the window rounds up to 4.
        assert_eq!(d.retry_after_secs, 4);
    }

    #[tokio::test]
    async fn stats_reflect_window_and_absence() {
        let (engine, _clock) = engine(5, 60_000);
        assert_eq!(engine.stats("u").await.unwrap()["status"], "no state");

        engine.admit("u").await.unwrap();
        let stats = engine.stats("u").await.unwrap();
        assert_eq!(stats["algorithm"], "fixed-window");
        assert_eq!(stats["currentCount"], 1);
        assert_eq!(stats["remainingRequests"], 4);
        assert_eq!(stats["windowEndTime"], 60_000);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_keys() {
        let (engine, clock) = engine(2, 1_000);
        engine.admit("old").await.unwrap();
        clock.set(10_000);
        engine.admit("fresh").await.unwrap();

        let removed = engine.cleanup_inactive(5_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(engine.peek("old").await.unwrap().remaining, 2);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(FixedWindowEngine::new(0, 1_000, clock.clone()).is_err());
        assert!(FixedWindowEngine::new(1, 0, clock).is_err());
    }
}
