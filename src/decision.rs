//! The admission decision returned by every engine.

/// Result of a single admission check.
///
/// Invariants: an allowed decision has `retry_after_secs == 0`; a denied
/// decision has `remaining == 0`. The constructors enforce both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left before the principal is denied.
    pub remaining: u64,
    /// When the quota next recovers, in epoch milliseconds.
    pub reset_epoch_ms: u64,
    /// Seconds the caller should wait before retrying. Zero when allowed.
    pub retry_after_secs: u64,
    /// Tag of the algorithm that produced this decision. Shared-store
    /// engines prefix it with `redis-`.
    pub algorithm: String,
}

impl Decision {
    /// An allowed decision.
    pub fn allowed(remaining: u64, reset_epoch_ms: u64, algorithm: impl Into<String>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_epoch_ms,
            retry_after_secs: 0,
            algorithm: algorithm.into(),
        }
    }

    /// A denied decision with an explicit retry delay.
    pub fn denied(
        reset_epoch_ms: u64,
        retry_after_secs: u64,
        algorithm: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_epoch_ms,
            retry_after_secs,
            algorithm: algorithm.into(),
        }
    }

    /// A denied decision whose retry delay is derived from the reset time:
    /// seconds from `now_ms` until `reset_epoch_ms`, rounded up.
    pub fn denied_at(reset_epoch_ms: u64, now_ms: u64, algorithm: impl Into<String>) -> Self {
        Self::denied(reset_epoch_ms, retry_after_secs(reset_epoch_ms, now_ms), algorithm)
    }

    /// Helper to check if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Whole seconds from `now_ms` until `reset_epoch_ms`, rounded up; zero if
/// the reset time has already passed.
pub(crate) fn retry_after_secs(reset_epoch_ms: u64, now_ms: u64) -> u64 {
    reset_epoch_ms.saturating_sub(now_ms).div_ceil(1000)
}
