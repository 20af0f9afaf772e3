//! Admission policies: which algorithm runs a principal's quota, and with
//! what parameters.

use crate::error::RateLimitError;
use crate::key::KeyStrategy;
use std::fmt;

/// The five admission algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindowLog,
    SlidingWindowCounter,
}

impl Algorithm {
    /// Every algorithm, in admin-enumeration order.
    pub const ALL: [Algorithm; 5] = [
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingWindowLog,
        Algorithm::SlidingWindowCounter,
    ];

    /// The fixed kebab-case tag carried in decisions, headers, and config.
    pub fn tag(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::LeakyBucket => "leaky-bucket",
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingWindowLog => "sliding-window-log",
            Algorithm::SlidingWindowCounter => "sliding-window-counter",
        }
    }

    /// Human description for the admin enumeration.
    pub fn description(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => {
                "Refills tokens at a fixed rate up to a burst capacity; each request consumes one token"
            }
            Algorithm::LeakyBucket => {
                "Queues requests up to a capacity and drains them at a fixed rate, smoothing traffic"
            }
            Algorithm::FixedWindow => {
                "Counts requests in aligned windows and resets the count at each window boundary"
            }
            Algorithm::SlidingWindowLog => {
                "Keeps a timestamp log of recent requests for an exact moving-window limit"
            }
            Algorithm::SlidingWindowCounter => {
                "Approximates a moving window from weighted sub-window counters"
            }
        }
    }

    /// Parse a tag back into an algorithm. Case-insensitive.
    pub fn parse(tag: &str) -> Option<Algorithm> {
        let tag = tag.trim().to_ascii_lowercase();
        Algorithm::ALL.iter().copied().find(|a| a.tag() == tag)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Immutable admission policy.
///
/// Each algorithm reads a subset of the fields; the per-algorithm
/// constructors fill the rest with inert defaults. `validate` checks the
/// fields the algorithm actually uses.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub algorithm: Algorithm,
    /// Bucket size or window limit. At least 1.
    pub capacity: u64,
    /// Tokens refilled (token bucket) or requests drained (leaky bucket)
    /// per second. Positive and finite.
    pub rate: f64,
    /// Window length for the window algorithms, in milliseconds.
    pub window_ms: u64,
    /// Sub-buckets per window (sliding counter only).
    pub sub_windows: u32,
    /// How the pipeline derives the principal key.
    pub key_strategy: KeyStrategy,
}

const DEFAULT_WINDOW_MS: u64 = 60_000;
#[allow(dead_code)]
const DEFAULT_SUB_WINDOWS: u32 = 6;

impl Policy {
    /// Token bucket: `capacity` tokens, refilled at `rate` per second.
    pub fn token_bucket(capacity: u64, rate: f64) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            capacity,
            rate,
            window_ms: DEFAULT_WINDOW_MS,
            sub_windows: 1,
            key_strategy: KeyStrategy::UserId,
        }
    }

    /// Leaky bucket: `capacity` queued requests, drained at `rate` per second.
    pub fn leaky_bucket(capacity: u64, rate: f64) -> Self {
        Self { algorithm: Algorithm::LeakyBucket, ..Self::token_bucket(capacity, rate) }
    }

    /// Fixed window: `capacity` requests per aligned `window_ms` window.
    pub fn fixed_window(capacity: u64, window_ms: u64) -> Self {
        Self {
            algorithm: Algorithm::FixedWindow,
            capacity,
            rate: 0.0,
            window_ms,
            sub_windows: 1,
            key_strategy: KeyStrategy::UserId,
        }
    }

    /// Sliding window log: `capacity` requests in any trailing `window_ms`.
    pub fn sliding_window_log(capacity: u64, window_ms: u64) -> Self {
        Self { algorithm: Algorithm::SlidingWindowLog, ..Self::fixed_window(capacity, window_ms) }
    }

    /// Sliding window counter: `capacity` requests per trailing `window_ms`,
    /// approximated over `sub_windows` sub-buckets.
    pub fn sliding_window_counter(capacity: u64, window_ms: u64, sub_windows: u32) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindowCounter,
            sub_windows,
            ..Self::fixed_window(capacity, window_ms)
        }
    }

    /// Replace the key-derivation strategy.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Check the parameters the policy's algorithm uses.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.capacity < 1 {
            return Err(RateLimitError::configuration(format!(
                "{}: capacity must be at least 1",
                self.algorithm
            )));
        }
        match self.algorithm {
            Algorithm::TokenBucket | Algorithm::LeakyBucket => {
                if !(self.rate.is_finite() && self.rate > 0.0) {
                    return Err(RateLimitError::configuration(format!(
                        "{}: rate must be a positive number of requests per second",
                        self.algorithm
                    )));
                }
            }
            Algorithm::FixedWindow | Algorithm::SlidingWindowLog => {
                if self.window_ms < 1 {
                    return Err(RateLimitError::configuration(format!(
                        "{}: window must be at least 1 ms",
                        self.algorithm
                    )));
                }
            }
            Algorithm::SlidingWindowCounter => {
                if self.window_ms < 1 {
                    return Err(RateLimitError::configuration(format!(
                        "{}: window must be at least 1 ms",
                        self.algorithm
                    )));
                }
                if self.sub_windows < 1 {
                    return Err(RateLimitError::configuration(format!(
                        "{}: at least one sub-window is required",
                        self.algorithm
                    )));
                }
                if u64::from(self.sub_windows) > self.window_ms {
                    return Err(RateLimitError::configuration(format!(
                        "{}: sub-windows must not outnumber window milliseconds",
                        self.algorithm
                    )));
                }
            }
        }
        Ok(())
    }

    /// Default inactivity threshold for the reclamation sweep: ten recovery
    /// periods, capped at one hour.
    pub fn sweep_threshold_ms(&self) -> u64 {
        self.period_ms().saturating_mul(10).min(3_600_000)
    }

    /// The refill/drain period: how long until the policy's state recovers
    /// by one unit. Used for synthetic reset times when the store is down.
    pub fn period_ms(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket | Algorithm::LeakyBucket => interval_ms(self.rate),
            Algorithm::FixedWindow
            | Algorithm::SlidingWindowLog
            | Algorithm::SlidingWindowCounter => self.window_ms,
        }
    }
}

/// Milliseconds until one token refills (or one request drains) at `rate`
/// per second, rounded up.
pub(crate) fn interval_ms(rate: f64) -> u64 {
    let ms = (1000.0 / rate).ceil();
    if ms.is_finite() && ms >= 1.0 {
        ms as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_fixed_kebab_strings() {
        assert_eq!(Algorithm::TokenBucket.tag(), "token-bucket");
        assert_eq!(Algorithm::LeakyBucket.tag(), "leaky-bucket");
        assert_eq!(Algorithm::FixedWindow.tag(), "fixed-window");
        assert_eq!(Algorithm::SlidingWindowLog.tag(), "sliding-window-log");
        assert_eq!(Algorithm::SlidingWindowCounter.tag(), "sliding-window-counter");
    }

    #[test]
    fn parse_round_trips_every_tag() {
        for algorithm in Algorithm::ALL {
            assert_eq!(Algorithm::parse(algorithm.tag()), Some(algorithm));
        }
        assert_eq!(Algorithm::parse("Token-Bucket"), Some(Algorithm::TokenBucket));
        assert_eq!(Algorithm::parse("gcra"), None);
    }

    #[test]
    fn constructors_validate() {
        assert!(Policy::token_bucket(100, 10.0).validate().is_ok());
        assert!(Policy::leaky_bucket(2, 0.1).validate().is_ok());
        assert!(Policy::fixed_window(100, 60_000).validate().is_ok());
        assert!(Policy::sliding_window_log(10, 30_000).validate().is_ok());
        assert!(Policy::sliding_window_counter(10, 60_000, 6).validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Policy::token_bucket(0, 1.0).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn non_positive_rate_is_rejected() {
        assert!(Policy::token_bucket(1, 0.0).validate().is_err());
        assert!(Policy::leaky_bucket(1, -2.0).validate().is_err());
        assert!(Policy::token_bucket(1, f64::NAN).validate().is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(Policy::fixed_window(1, 0).validate().is_err());
        assert!(Policy::sliding_window_log(1, 0).validate().is_err());
    }

    #[test]
    fn sub_window_bounds_are_enforced() {
        assert!(Policy::sliding_window_counter(1, 60_000, 0).validate().is_err());
        assert!(Policy::sliding_window_counter(1, 10, 11).validate().is_err());
        assert!(Policy::sliding_window_counter(1, 10, 10).validate().is_ok());
    }

    #[test]
    fn interval_rounds_up() {
        assert_eq!(interval_ms(10.0), 100);
        assert_eq!(interval_ms(0.1), 10_000);
        assert_eq!(interval_ms(3.0), 334);
    }

    #[test]
    fn period_follows_algorithm() {
        assert_eq!(Policy::token_bucket(1, 0.1).period_ms(), 10_000);
        assert_eq!(Policy::fixed_window(1, 5_000).period_ms(), 5_000);
    }

    #[test]
    fn sweep_threshold_is_ten_periods_capped_at_an_hour() {
        assert_eq!(Policy::fixed_window(1, 5_000).sweep_threshold_ms(), 50_000);
        assert_eq!(Policy::sliding_window_log(1, 3_600_000).sweep_threshold_ms(), 3_600_000);
    }
}
