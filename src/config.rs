//! Static configuration surface.
//!
//! A single JSON document enables the limiter, names the default algorithm,
//! tunes each algorithm, and maps URL patterns to per-route policies. Field
//! names are camelCase, matching the property file this grew out of.

use crate::error::RateLimitError;
use crate::pattern::best_match;
use crate::policy::{Algorithm, Policy};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_RATE: f64 = 10.0;
const DEFAULT_WINDOW_MS: u64 = 60_000;
const DEFAULT_SUB_WINDOWS: u32 = 6;
const DEFAULT_PRINCIPAL: u64 = 123;

/// What the pipeline does when the backing store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request with synthetic full-quota headers.
    Open,
    /// Deny the request with a one-second retry delay.
    Closed,
}

/// Per-algorithm tuning. Every field is optional; absent fields fall back
/// to the built-in defaults. `rate` also answers to the names the refill
/// and drain rates go by.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlgorithmSettings {
    pub capacity: Option<u64>,
    /// Window limit; interchangeable with `capacity`.
    pub limit: Option<u64>,
    #[serde(alias = "refillRate", alias = "leakRate")]
    pub rate: Option<f64>,
    pub window_ms: Option<u64>,
    pub sub_windows: Option<u32>,
}

/// Per-route overrides attached to a URL pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PatternSettings {
    pub algorithm: Option<String>,
    pub capacity: Option<u64>,
    pub limit: Option<u64>,
    #[serde(alias = "refillRate", alias = "leakRate")]
    pub rate: Option<f64>,
    pub window_ms: Option<u64>,
}

/// The whole configuration surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Master switch; a disabled limiter admits everything untouched.
    pub enabled: bool,
    /// Tag of the algorithm used where no pattern matches.
    pub default_algorithm: String,
    /// Tuning per algorithm tag.
    pub algorithms: HashMap<String, AlgorithmSettings>,
    /// Per-route policies, keyed by glob pattern. Ordered so that pattern
    /// selection tie-breaks are deterministic.
    pub url_patterns: BTreeMap<String, PatternSettings>,
    /// Path prefixes that bypass admission entirely.
    pub excluded_paths: Vec<String>,
    /// Principal used when no bearer id is present.
    pub default_principal: u64,
    /// Store-failure behavior.
    pub failure_mode: FailureMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_algorithm: Algorithm::TokenBucket.tag().to_string(),
            algorithms: HashMap::new(),
            url_patterns: BTreeMap::new(),
            excluded_paths: vec![
                "/actuator/".to_string(),
                "/health".to_string(),
                "/metrics".to_string(),
            ],
            default_principal: DEFAULT_PRINCIPAL,
            failure_mode: FailureMode::Open,
        }
    }
}

impl RateLimitConfig {
    /// Parse a configuration document, rejecting malformed JSON, unknown
    /// algorithm tags, and out-of-range parameters up front.
    pub fn from_json(raw: &str) -> Result<Self, RateLimitError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RateLimitError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RateLimitError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RateLimitError::configuration(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Check every policy this configuration can produce.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        self.default_policy()?;
        for tag in self.algorithms.keys() {
            let algorithm = parse_tag(tag)?;
            self.policy_for_algorithm(algorithm).validate()?;
        }
        for (pattern, settings) in &self.url_patterns {
            if pattern.is_empty() {
                return Err(RateLimitError::configuration("empty URL pattern"));
            }
            self.pattern_policy(settings)?.validate()?;
        }
        Ok(())
    }

    /// The policy applied where no URL pattern matches.
    pub fn default_policy(&self) -> Result<Policy, RateLimitError> {
        let algorithm = parse_tag(&self.default_algorithm)?;
        let policy = self.policy_for_algorithm(algorithm);
        policy.validate()?;
        Ok(policy)
    }

    /// The configured policy for one algorithm, with defaults filled in.
    pub fn policy_for_algorithm(&self, algorithm: Algorithm) -> Policy {
        let settings = self.algorithms.get(algorithm.tag());
        let capacity = settings
            .and_then(|s| s.capacity.or(s.limit))
            .unwrap_or(DEFAULT_CAPACITY);
        let rate = settings.and_then(|s| s.rate).unwrap_or(DEFAULT_RATE);
        let window_ms = settings.and_then(|s| s.window_ms).unwrap_or(DEFAULT_WINDOW_MS);
        let sub_windows = settings.and_then(|s| s.sub_windows).unwrap_or(DEFAULT_SUB_WINDOWS);
        match algorithm {
            Algorithm::TokenBucket => Policy::token_bucket(capacity, rate),
            Algorithm::LeakyBucket => Policy::leaky_bucket(capacity, rate),
            Algorithm::FixedWindow => Policy::fixed_window(capacity, window_ms),
            Algorithm::SlidingWindowLog => Policy::sliding_window_log(capacity, window_ms),
            Algorithm::SlidingWindowCounter => {
                Policy::sliding_window_counter(capacity, window_ms, sub_windows)
            }
        }
    }

    /// Resolve the effective policy for a request path: the longest matching
    /// URL pattern wins, falling back to the default policy. Only valid on a
    /// validated configuration.
    pub fn policy_for_path(&self, path: &str) -> Result<Policy, RateLimitError> {
        let selected = best_match(self.url_patterns.keys().map(String::as_str), path);
        match selected.and_then(|pattern| self.url_patterns.get(pattern)) {
            Some(settings) => self.pattern_policy(settings),
            None => self.default_policy(),
        }
    }

    /// Should this path bypass admission entirely?
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Every algorithm's configured default policy, for admin batch resets.
    pub fn all_policies(&self) -> Vec<Policy> {
        Algorithm::ALL.iter().map(|&a| self.policy_for_algorithm(a)).collect()
    }

    fn pattern_policy(&self, settings: &PatternSettings) -> Result<Policy, RateLimitError> {
        let algorithm = match &settings.algorithm {
            Some(tag) => parse_tag(tag)?,
            None => parse_tag(&self.default_algorithm)?,
        };
        let mut policy = self.policy_for_algorithm(algorithm);
        if let Some(capacity) = settings.capacity.or(settings.limit) {
            policy.capacity = capacity;
        }
        if let Some(rate) = settings.rate {
            policy.rate = rate;
        }
        if let Some(window_ms) = settings.window_ms {
            policy.window_ms = window_ms;
        }
        Ok(policy)
    }
}

fn parse_tag(tag: &str) -> Result<Algorithm, RateLimitError> {
    Algorithm::parse(tag)
        .ok_or_else(|| RateLimitError::configuration(format!("unknown algorithm '{}'", tag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.default_algorithm, "token-bucket");
        assert_eq!(config.default_principal, 123);
        assert_eq!(config.failure_mode, FailureMode::Open);

        let policy = config.default_policy().unwrap();
        assert_eq!(policy.algorithm, Algorithm::TokenBucket);
        assert_eq!(policy.capacity, 100);
        assert_eq!(policy.rate, 10.0);
    }

    #[test]
    fn parses_a_full_document() {
        let config = RateLimitConfig::from_json(
            r#"{
                "enabled": true,
                "defaultAlgorithm": "fixed-window",
                "algorithms": {
                    "fixed-window": { "limit": 50, "windowMs": 30000 },
                    "token-bucket": { "capacity": 20, "refillRate": 2.5 }
                },
                "urlPatterns": {
                    "/api/search/**": { "algorithm": "sliding-window-log", "limit": 5, "windowMs": 10000 },
                    "/api/**": { "capacity": 10 }
                },
                "excludedPaths": ["/health"],
                "defaultPrincipal": 7,
                "failureMode": "closed"
            }"#,
        )
        .unwrap();

        let default = config.default_policy().unwrap();
        assert_eq!(default.algorithm, Algorithm::FixedWindow);
        assert_eq!(default.capacity, 50);
        assert_eq!(default.window_ms, 30_000);

        let tb = config.policy_for_algorithm(Algorithm::TokenBucket);
        assert_eq!(tb.capacity, 20);
        assert_eq!(tb.rate, 2.5);

        assert_eq!(config.failure_mode, FailureMode::Closed);
        assert_eq!(config.default_principal, 7);
    }

    #[test]
    fn pattern_resolution_prefers_the_longest_match() {
        let config = RateLimitConfig::from_json(
            r#"{
                "urlPatterns": {
                    "/api/**": { "capacity": 10 },
                    "/api/search/**": { "algorithm": "sliding-window-log", "limit": 5 }
                }
            }"#,
        )
        .unwrap();

        let search = config.policy_for_path("/api/search/users").unwrap();
        assert_eq!(search.algorithm, Algorithm::SlidingWindowLog);
        assert_eq!(search.capacity, 5);

        let api = config.policy_for_path("/api/orders").unwrap();
        assert_eq!(api.algorithm, Algorithm::TokenBucket);
        assert_eq!(api.capacity, 10);

        let other = config.policy_for_path("/public/index").unwrap();
        assert_eq!(other.capacity, 100);
    }

    #[test]
    fn unknown_default_algorithm_is_rejected() {
        let err = RateLimitConfig::from_json(r#"{ "defaultAlgorithm": "gcra" }"#).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_pattern_algorithm_is_rejected() {
        let err = RateLimitConfig::from_json(
            r#"{ "urlPatterns": { "/x/**": { "algorithm": "what" } } }"#,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        let err = RateLimitConfig::from_json(
            r#"{ "algorithms": { "token-bucket": { "capacity": 0 } } }"#,
        )
        .unwrap_err();
        assert!(err.is_configuration());

        let err = RateLimitConfig::from_json(
            r#"{ "urlPatterns": { "/x/**": { "algorithm": "fixed-window", "windowMs": 0 } } }"#,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = RateLimitConfig::from_json("{ not json").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn excluded_paths_are_prefix_matched() {
        let config = RateLimitConfig::default();
        assert!(config.is_excluded("/health"));
        assert!(config.is_excluded("/health/live"));
        assert!(config.is_excluded("/actuator/prometheus"));
        assert!(config.is_excluded("/metrics"));
        assert!(!config.is_excluded("/api/users"));
    }

    #[test]
    fn rate_aliases_are_accepted() {
        let config = RateLimitConfig::from_json(
            r#"{ "algorithms": { "leaky-bucket": { "capacity": 5, "leakRate": 0.5 } } }"#,
        )
        .unwrap();
        let policy = config.policy_for_algorithm(Algorithm::LeakyBucket);
        assert_eq!(policy.rate, 0.5);
    }

    #[test]
    fn all_policies_covers_every_algorithm() {
        let config = RateLimitConfig::default();
        let policies = config.all_policies();
        assert_eq!(policies.len(), 5);
        for policy in policies {
            assert!(policy.validate().is_ok());
        }
    }
}
