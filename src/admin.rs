//! Admin operations: per-principal stats, batch reset, and the algorithm
//! enumeration. Each returns a JSON body; routing is the host
//! application's business.

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;
use crate::policy::Algorithm;
use crate::registry::EngineRegistry;
use serde_json::json;
use tracing::info;

/// Diagnostic snapshot for one principal on one algorithm's configured
/// engine.
pub async fn stats(
    config: &RateLimitConfig,
    registry: &EngineRegistry,
    user_id: u64,
    algorithm: &str,
) -> Result<serde_json::Value, RateLimitError> {
    let algorithm = Algorithm::parse(algorithm).ok_or_else(|| {
        RateLimitError::configuration(format!("unknown algorithm '{}'", algorithm))
    })?;
    let engine = registry.engine_for(&config.policy_for_algorithm(algorithm))?;
    let stats = engine.stats(&user_id.to_string()).await?;
    info!(
        target: "quotaguard::admin",
        user_id,
        algorithm = %algorithm,
        "stats requested"
    );
    Ok(json!({
        "algorithm": algorithm.tag(),
        "userId": user_id,
        "stats": stats,
        "timestamp": registry.clock().now_millis(),
    }))
}

/// Reset one principal across every algorithm's configured engine. Failures
/// are recorded per algorithm; the batch always completes.
pub async fn reset(
    config: &RateLimitConfig,
    registry: &EngineRegistry,
    user_id: u64,
) -> serde_json::Value {
    let key = user_id.to_string();
    let results = registry.reset_all(&key, &config.all_policies()).await;
    info!(
        target: "quotaguard::admin",
        user_id,
        ?results,
        "reset across all engines"
    );
    json!({
        "message": "All rate limiters reset attempted",
        "userId": user_id,
        "resetResults": results,
        "timestamp": registry.clock().now_millis(),
    })
}

/// Enumerate the known algorithms with their descriptions.
pub fn algorithms(registry: &EngineRegistry) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = Algorithm::ALL
        .iter()
        .map(|a| json!({ "name": a.tag(), "description": a.description() }))
        .collect();
    json!({
        "algorithms": entries,
        "count": entries.len(),
        "timestamp": registry.clock().now_millis(),
    })
}
