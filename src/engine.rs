//! The engine contract shared by the in-memory and shared-store backends.

use crate::decision::Decision;
use crate::error::RateLimitError;
use crate::policy::Algorithm;
use async_trait::async_trait;

/// A stateful admission machine keyed by principal.
///
/// Implementations own all per-key state; callers only see the returned
/// [`Decision`]. The in-memory engines never return `Err` from `admit` (a
/// corrupted key is reset and reported as a denial), while the shared-store
/// engines surface transport failures for the pipeline's failure mode to
/// absorb.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Admit or deny one request for `key`, mutating the key's state.
    async fn admit(&self, key: &str) -> Result<Decision, RateLimitError>;

    /// Compute the current decision for `key` without consuming quota.
    async fn peek(&self, key: &str) -> Result<Decision, RateLimitError>;

    /// Erase all state for `key`. Immediately afterwards, `peek` reports a
    /// full quota.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Diagnostic snapshot of the key's state, algorithm-specific fields.
    async fn stats(&self, key: &str) -> Result<serde_json::Value, RateLimitError>;

    /// Drop every principal's state.
    async fn clear_all(&self) -> Result<(), RateLimitError>;

    /// Advisory reclamation sweep: remove state whose most recent activity
    /// is older than `threshold_ms`. Returns the number of keys removed.
    /// Correctness never depends on this; shared-store engines rely on
    /// native expiry instead and report 0.
    async fn cleanup_inactive(&self, threshold_ms: u64) -> Result<usize, RateLimitError>;

    /// The algorithm this engine runs.
    fn algorithm(&self) -> Algorithm;
}
