#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! Redis-backed engines for `quotaguard` (companion crate).
//!
//! Each algorithm's state mutation runs as a single server-evaluated Lua
//! script, so concurrent admissions for the same principal are serialized
//! by the store, the cluster-wide equivalent of the in-memory engines'
//! per-key critical section. The client supplies `now` from its
//! [`quotaguard::Clock`], which keeps time injectable and makes the
//! scripts themselves clock-free.
//!
//! Every script replies with a two-element array: the decision scalar
//! (remaining quota on allow, `-1` on deny) and a reset anchor (last refill
//! or leak time, oldest log entry, window start) from which the client
//! derives `reset_epoch_ms` without a second round trip.
//!
//! The engines implement the same [`quotaguard::Engine`] trait as the
//! in-memory backend and can be dropped into an
//! [`quotaguard::EngineRegistry`]:
//!
//! ```rust,no_run
//! use quotaguard::{EngineRegistry, Policy, SystemClock};
//! use quotaguard_redis::RedisTokenBucketEngine;
//! use std::sync::Arc;
//!
//! # async fn connect() -> Result<(), Box<dyn std::error::Error>> {
//! let client = redis::Client::open("redis://127.0.0.1/")?;
//! let conn = redis::aio::ConnectionManager::new(client).await?;
//! let clock = Arc::new(SystemClock::new());
//!
//! let policy = Policy::token_bucket(100, 10.0);
//! let engine = RedisTokenBucketEngine::new(conn, 100, 10.0, clock.clone())?;
//!
//! let registry = EngineRegistry::new(clock);
//! registry.register(&policy, Arc::new(engine));
//! # Ok(())
//! # }
//! ```
//!
//! State reclamation is the store's business: every key carries an expiry,
//! so `cleanup_inactive` on these engines reports 0.

use quotaguard::RateLimitError;
use redis::aio::ConnectionManager;

mod fixed_window;
mod leaky_bucket;
mod sliding_counter;
mod sliding_log;
mod token_bucket;

pub use fixed_window::RedisFixedWindowEngine;
pub use leaky_bucket::RedisLeakyBucketEngine;
pub use sliding_counter::RedisSlidingCounterEngine;
pub use sliding_log::RedisSlidingLogEngine;
pub use token_bucket::RedisTokenBucketEngine;

/// Scalar a script returns when stored state violated its invariant; the
/// script has already erased the key and the client denies with a
/// one-second retry.
pub(crate) const CORRUPTED: i64 = -2;

pub(crate) fn transport(error: redis::RedisError) -> RateLimitError {
    RateLimitError::transport(error.to_string())
}

/// Split the `{scalar, anchor}` script reply.
pub(crate) fn parse_pair(reply: &[i64]) -> Result<(i64, i64), RateLimitError> {
    match reply {
        [scalar, anchor] => Ok((*scalar, *anchor)),
        other => Err(RateLimitError::transport(format!(
            "script replied with {} elements, expected 2",
            other.len()
        ))),
    }
}

/// Delete every key matching `pattern`, in SCAN-sized batches.
pub(crate) async fn delete_matching(
    conn: &mut ConnectionManager,
    pattern: &str,
) -> Result<(), RateLimitError> {
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn)
            .await
            .map_err(transport)?;
        if !keys.is_empty() {
            redis::cmd("DEL")
                .arg(&keys)
                .query_async::<()>(conn)
                .await
                .map_err(transport)?;
        }
        cursor = next;
        if cursor == 0 {
            return Ok(());
        }
    }
}
