//! End-to-end middleware behavior: header reflection, the 429 body,
//! bypasses, and both store-failure modes.

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use quotaguard::{
    Algorithm, Clock, Decision, Engine, EngineRegistry, ManualClock, RateLimitConfig,
    RateLimitError, RateLimitLayer,
};
use std::convert::Infallible;
use std::sync::Arc;
use tower::{service_fn, Layer, ServiceExt};

type EchoFuture = std::future::Ready<Result<Response<String>, Infallible>>;
type EchoService = tower::util::ServiceFn<fn(Request<()>) -> EchoFuture>;

fn echo() -> EchoService {
    fn handle(_req: Request<()>) -> EchoFuture {
        std::future::ready(Ok(Response::new("ok".to_string())))
    }
    service_fn(handle as fn(Request<()>) -> EchoFuture)
}

fn layer_with(
    config: RateLimitConfig,
) -> (RateLimitLayer, Arc<EngineRegistry>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(1_000_000));
    let registry = Arc::new(EngineRegistry::new(clock.clone()));
    let layer = RateLimitLayer::with_registry(Arc::new(config), registry.clone()).unwrap();
    (layer, registry, clock)
}

fn tight_config() -> RateLimitConfig {
    RateLimitConfig::from_json(
        r#"{
            "defaultAlgorithm": "fixed-window",
            "algorithms": { "fixed-window": { "limit": 2, "windowMs": 60000 } }
        }"#,
    )
    .unwrap()
}

fn request(path: &str, bearer: Option<&str>) -> Request<()> {
    let mut builder = Request::builder().uri(path);
    if let Some(id) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", id));
    }
    builder.body(()).unwrap()
}

#[tokio::test]
async fn allowed_responses_carry_quota_headers() {
    let (layer, _registry, _clock) = layer_with(tight_config());
    let service = layer.layer(echo());

    let response = service.oneshot(request("/api/users", Some("1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "1");
    assert_eq!(headers["x-ratelimit-algorithm"], "fixed-window");
    // now = 1_000_000 sits in the window starting at 960_000.
    assert_eq!(headers["x-ratelimit-reset"], "1020");
    assert!(headers.get("retry-after").is_none());
}

#[tokio::test]
async fn denials_short_circuit_with_a_429_body() {
    let (layer, _registry, clock) = layer_with(tight_config());
    let service = layer.layer(echo());

    for _ in 0..2 {
        let response =
            service.clone().oneshot(request("/api/users", Some("1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = service.oneshot(request("/api/users", Some("1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert_eq!(headers["x-ratelimit-reset"], "1020");
    let retry: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry >= 1);
    assert_eq!(headers["content-type"], "application/json");

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["message"], "Rate limit exceeded. Please try again later.");
    assert_eq!(body["status"], 429);
    assert_eq!(body["timestamp"], clock.now_millis());
    assert_eq!(body["rateLimit"]["algorithm"], "fixed-window");
    assert_eq!(body["rateLimit"]["resetTime"], 1_020_000);
    assert_eq!(body["rateLimit"]["retryAfter"], retry);
    assert!(body["rateLimit"]["resetTimeFormatted"].as_str().unwrap().contains(":"));
}

#[tokio::test]
async fn principals_are_limited_independently() {
    let (layer, _registry, _clock) = layer_with(tight_config());
    let service = layer.layer(echo());

    for _ in 0..2 {
        let response =
            service.clone().oneshot(request("/api/users", Some("1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let denied = service.clone().oneshot(request("/api/users", Some("1"))).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = service.oneshot(request("/api/users", Some("2"))).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(other.headers()["x-ratelimit-remaining"], "1");
}

#[tokio::test]
async fn missing_or_malformed_bearer_uses_the_default_principal() {
    let (layer, _registry, _clock) = layer_with(tight_config());
    let service = layer.layer(echo());

    // Anonymous and malformed callers share the fallback principal.
    let first = service.clone().oneshot(request("/api/users", None)).await.unwrap();
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

    let second =
        service.clone().oneshot(request("/api/users", Some("not-a-number"))).await.unwrap();
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = service.oneshot(request("/api/users", None)).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn excluded_paths_bypass_admission() {
    let (layer, _registry, _clock) = layer_with(tight_config());
    let service = layer.layer(echo());

    for _ in 0..10 {
        let response = service.clone().oneshot(request("/health", Some("1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn disabled_config_admits_everything_untouched() {
    let mut config = tight_config();
    config.enabled = false;
    let (layer, _registry, _clock) = layer_with(config);
    let service = layer.layer(echo());

    for _ in 0..10 {
        let response =
            service.clone().oneshot(request("/api/users", Some("1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn url_patterns_route_to_their_algorithms() {
    let config = RateLimitConfig::from_json(
        r#"{
            "defaultAlgorithm": "token-bucket",
            "algorithms": { "token-bucket": { "capacity": 5, "refillRate": 1.0 } },
            "urlPatterns": {
                "/api/search/**": { "algorithm": "sliding-window-log", "limit": 1, "windowMs": 30000 }
            }
        }"#,
    )
    .unwrap();
    let (layer, _registry, _clock) = layer_with(config);
    let service = layer.layer(echo());

    let search = service.clone().oneshot(request("/api/search/q", Some("1"))).await.unwrap();
    assert_eq!(search.headers()["x-ratelimit-algorithm"], "sliding-window-log");
    assert_eq!(search.headers()["x-ratelimit-limit"], "1");

    let denied = service.clone().oneshot(request("/api/search/q", Some("1"))).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    // The same principal is untouched on the default route.
    let other = service.oneshot(request("/api/orders", Some("1"))).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(other.headers()["x-ratelimit-algorithm"], "token-bucket");
}

/// Engine whose store is permanently unreachable.
struct DownEngine;

#[async_trait]
impl Engine for DownEngine {
    async fn admit(&self, _key: &str) -> Result<Decision, RateLimitError> {
        Err(RateLimitError::transport("connection refused"))
    }
    async fn peek(&self, _key: &str) -> Result<Decision, RateLimitError> {
        Err(RateLimitError::transport("connection refused"))
    }
    async fn reset(&self, _key: &str) -> Result<(), RateLimitError> {
        Err(RateLimitError::transport("connection refused"))
    }
    async fn stats(&self, _key: &str) -> Result<serde_json::Value, RateLimitError> {
        Err(RateLimitError::transport("connection refused"))
    }
    async fn clear_all(&self) -> Result<(), RateLimitError> {
        Ok(())
    }
    async fn cleanup_inactive(&self, _threshold_ms: u64) -> Result<usize, RateLimitError> {
        Ok(0)
    }
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}

fn config_with_down_engine(mode: &str) -> (RateLimitLayer, Arc<ManualClock>) {
    let config = RateLimitConfig::from_json(&format!(
        r#"{{
            "defaultAlgorithm": "fixed-window",
            "algorithms": {{ "fixed-window": {{ "limit": 2, "windowMs": 60000 }} }},
            "failureMode": "{}"
        }}"#,
        mode
    ))
    .unwrap();
    let (layer, registry, clock) = layer_with(config.clone());
    registry.register(&config.policy_for_algorithm(Algorithm::FixedWindow), Arc::new(DownEngine));
    (layer, clock)
}

#[tokio::test]
async fn store_failure_fails_open_by_default() {
    let (layer, clock) = config_with_down_engine("open");
    let service = layer.layer(echo());

    let response = service.oneshot(request("/api/users", Some("1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Synthetic untouched-quota headers: limit/limit and reset = now + period.
    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "2");
    let expected_reset = (clock.now_millis() + 60_000) / 1000;
    assert_eq!(headers["x-ratelimit-reset"], expected_reset.to_string().as_str());
}

#[tokio::test]
async fn store_failure_can_fail_closed() {
    let (layer, _clock) = config_with_down_engine("closed");
    let service = layer.layer(echo());

    let response = service.oneshot(request("/api/users", Some("1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1");
}
