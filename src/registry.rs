//! Engine registry: one engine instance per distinct parameter set.
//!
//! Two policies with identical parameters share an engine, and therefore
//! per-principal state, no matter which URL pattern or route they
//! came from. Entries are write-once; the map itself is sharded, so lookups
//! on the hot path do not contend.

use crate::clock::Clock;
use crate::decision::Decision;
use crate::engine::Engine;
use crate::error::RateLimitError;
use crate::fixed_window::FixedWindowEngine;
use crate::leaky_bucket::LeakyBucketEngine;
use crate::policy::{Algorithm, Policy};
use crate::sliding_counter::SlidingCounterEngine;
use crate::sliding_log::SlidingLogEngine;
use crate::token_bucket::TokenBucketEngine;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Full parameter tuple identifying an engine instance. The rate is keyed
/// by its bit pattern, since `f64` itself cannot be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EngineKey {
    algorithm: Algorithm,
    capacity: u64,
    rate_bits: u64,
    window_ms: u64,
    sub_windows: u32,
}

impl EngineKey {
    fn from_policy(policy: &Policy) -> Self {
        Self {
            algorithm: policy.algorithm,
            capacity: policy.capacity,
            rate_bits: policy.rate.to_bits(),
            window_ms: policy.window_ms,
            sub_windows: policy.sub_windows,
        }
    }
}

/// Caches engine instances keyed by `(algorithm, parameters)`.
pub struct EngineRegistry {
    engines: DashMap<EngineKey, Arc<dyn Engine>>,
    clock: Arc<dyn Clock>,
}

impl EngineRegistry {
    /// Create a registry whose engines read time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { engines: DashMap::new(), clock }
    }

    /// The clock shared with every engine this registry builds.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Return the engine for `policy`, building and caching it on first use.
    pub fn engine_for(&self, policy: &Policy) -> Result<Arc<dyn Engine>, RateLimitError> {
        policy.validate()?;
        let key = EngineKey::from_policy(policy);
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.clone());
        }
        let built = self.build(policy)?;
        // Entry API re-checks under the shard lock, so a racing builder
        // keeps the first instance and drops its own.
        let engine = self.engines.entry(key).or_insert(built).clone();
        Ok(engine)
    }

    /// Register an externally built engine (e.g. a shared-store backend)
    /// under `policy`'s parameters. Later `engine_for` calls with the same
    /// parameters return it. The first registration wins.
    pub fn register(&self, policy: &Policy, engine: Arc<dyn Engine>) {
        self.engines.entry(EngineKey::from_policy(policy)).or_insert(engine);
    }

    /// Reset `key` on one engine per policy, recording per-algorithm
    /// outcomes. A failing engine never aborts the batch.
    pub async fn reset_all(&self, key: &str, policies: &[Policy]) -> BTreeMap<String, String> {
        let mut results = BTreeMap::new();
        for policy in policies {
            let tag = policy.algorithm.tag().to_string();
            let outcome = match self.engine_for(policy) {
                Ok(engine) => match engine.reset(key).await {
                    Ok(()) => "success".to_string(),
                    Err(e) => {
                        warn!(
                            target: "quotaguard::registry",
                            algorithm = %tag,
                            key = %key,
                            error = %e,
                            "reset failed"
                        );
                        format!("failed: {}", e)
                    }
                },
                Err(e) => {
                    warn!(
                        target: "quotaguard::registry",
                        algorithm = %tag,
                        error = %e,
                        "engine unavailable for reset"
                    );
                    format!("failed: {}", e)
                }
            };
            results.insert(tag, outcome);
        }
        results
    }

    /// Run the inactivity sweep over every cached engine. Returns the total
    /// number of keys removed.
    pub async fn cleanup_inactive(&self, threshold_ms: u64) -> usize {
        let engines: Vec<Arc<dyn Engine>> =
            self.engines.iter().map(|entry| entry.value().clone()).collect();
        let mut removed = 0;
        for engine in engines {
            removed += engine.cleanup_inactive(threshold_ms).await.unwrap_or(0);
        }
        removed
    }

    fn build(&self, policy: &Policy) -> Result<Arc<dyn Engine>, RateLimitError> {
        let clock = self.clock.clone();
        let engine: Arc<dyn Engine> = match policy.algorithm {
            Algorithm::TokenBucket => {
                Arc::new(TokenBucketEngine::new(policy.capacity, policy.rate, clock)?)
            }
            Algorithm::LeakyBucket => {
                Arc::new(LeakyBucketEngine::new(policy.capacity, policy.rate, clock)?)
            }
            Algorithm::FixedWindow => {
                Arc::new(FixedWindowEngine::new(policy.capacity, policy.window_ms, clock)?)
            }
            Algorithm::SlidingWindowLog => {
                Arc::new(SlidingLogEngine::new(policy.capacity, policy.window_ms, clock)?)
            }
            Algorithm::SlidingWindowCounter => Arc::new(SlidingCounterEngine::new(
                policy.capacity,
                policy.window_ms,
                policy.sub_windows,
                clock,
            )?),
        };
        Ok(engine)
    }
}

/// Convenience used by tests and the failure path: a decision synthesized
/// from the policy alone, as if the quota were untouched.
pub(crate) fn untouched_decision(policy: &Policy, now_ms: u64) -> Decision {
    Decision::allowed(policy.capacity, now_ms + policy.period_ms(), policy.algorithm.tag())
}
