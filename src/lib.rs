#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Per-principal request admission control for HTTP services: classify the
//! caller, consult a policy, and answer ALLOW or DENY together with the
//! quota metadata that becomes `X-RateLimit-*` response headers.
//!
//! ## Features
//!
//! - **Five algorithms**: token bucket, leaky bucket, fixed window, sliding
//!   window log, and sliding window counter, all behind one [`Engine`]
//!   contract.
//! - **Per-key concurrency**: engine state lives in sharded maps; distinct
//!   principals never contend on a shared lock.
//! - **Injectable time**: engines read the clock through the [`Clock`]
//!   trait, so tests drive admission sequences deterministically.
//! - **Tower middleware**: [`RateLimitLayer`] resolves per-route policies
//!   from URL patterns, extracts the principal, sets quota headers, and
//!   short-circuits denials with a 429 JSON body.
//! - **Pluggable backends**: a companion crate runs the same algorithms as
//!   atomic scripts on a shared store for cluster-wide limits; its engines
//!   register into the same [`EngineRegistry`].
//!
//! ## Quick start
//!
//! ```rust
//! use quotaguard::{Engine, EngineRegistry, Policy, SystemClock};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), quotaguard::RateLimitError> {
//! let registry = EngineRegistry::new(Arc::new(SystemClock::new()));
//! let policy = Policy::token_bucket(100, 10.0);
//!
//! let engine = registry.engine_for(&policy)?;
//! let decision = engine.admit("42").await?;
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 99);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod fixed_window;
pub mod key;
pub mod leaky_bucket;
pub mod middleware;
pub mod pattern;
pub mod policy;
pub mod registry;
pub mod sliding_counter;
pub mod sliding_log;
pub mod token_bucket;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlgorithmSettings, FailureMode, PatternSettings, RateLimitConfig};
pub use decision::Decision;
pub use engine::Engine;
pub use error::RateLimitError;
pub use fixed_window::FixedWindowEngine;
pub use key::{bearer_user_id, principal_key, KeyStrategy};
pub use leaky_bucket::LeakyBucketEngine;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use policy::{Algorithm, Policy};
pub use registry::EngineRegistry;
pub use sliding_counter::SlidingCounterEngine;
pub use sliding_log::SlidingLogEngine;
pub use token_bucket::TokenBucketEngine;
