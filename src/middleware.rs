//! Tower middleware enforcing admission control over HTTP services.
//!
//! The layer resolves a policy for the request path, derives the principal
//! key, asks the engine registry for a decision, and annotates the response
//! with quota headers. Denials short-circuit with a 429 and a JSON body;
//! the wrapped service never sees the request.

use crate::clock::format_epoch_ms;
use crate::config::{FailureMode, RateLimitConfig};
use crate::decision::Decision;
use crate::error::RateLimitError;
use crate::key::principal_key;
use crate::policy::Policy;
use crate::registry::{untouched_decision, EngineRegistry};
use http::{HeaderValue, Request, Response, StatusCode};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

/// A layer that wraps a service with per-principal admission control.
#[derive(Clone)]
pub struct RateLimitLayer {
    config: Arc<RateLimitConfig>,
    registry: Arc<EngineRegistry>,
}

impl RateLimitLayer {
    /// Build a layer from a validated configuration, with engines reading
    /// the system clock.
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let registry = Arc::new(EngineRegistry::new(Arc::new(crate::clock::SystemClock::new())));
        Self::with_registry(Arc::new(config), registry)
    }

    /// Build a layer over an existing registry (custom clock, pre-registered
    /// shared-store engines).
    pub fn with_registry(
        config: Arc<RateLimitConfig>,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    /// The registry backing this layer.
    pub fn registry(&self) -> Arc<EngineRegistry> {
        self.registry.clone()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            config: self.config.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<RateLimitConfig>,
    registry: Arc<EngineRegistry>,
}

impl<S, B, RB> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response<RB>> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
    RB: From<String> + Send + 'static,
{
    type Response = Response<RB>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let config = self.config.clone();
        let registry = self.registry.clone();
        // The clone replaces self.inner so the polled-ready instance is the
        // one that serves this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if !config.enabled || config.is_excluded(&path) {
                return inner.call(req).await;
            }

            let policy = match config.policy_for_path(&path) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(
                        target: "quotaguard::middleware",
                        path = %path,
                        error = %e,
                        "no usable policy for path, admitting untouched"
                    );
                    return inner.call(req).await;
                }
            };
            let key = principal_key(&policy.key_strategy, &req, config.default_principal);
            let now = registry.clock().now_millis();

            let decision = match registry.engine_for(&policy) {
                Ok(engine) => match engine.admit(&key).await {
                    Ok(decision) => decision,
                    Err(e) => failure_decision(&config, &policy, now, &e),
                },
                Err(e) => failure_decision(&config, &policy, now, &e),
            };

            if decision.allowed {
                debug!(
                    target: "quotaguard::middleware",
                    key = %key,
                    path = %path,
                    remaining = decision.remaining,
                    algorithm = %decision.algorithm,
                    "request allowed"
                );
                let mut response = inner.call(req).await?;
                apply_quota_headers(&mut response, &policy, &decision);
                Ok(response)
            } else {
                warn!(
                    target: "quotaguard::middleware",
                    key = %key,
                    path = %path,
                    algorithm = %decision.algorithm,
                    retry_after = decision.retry_after_secs,
                    "request denied"
                );
                Ok(deny_response(&policy, &decision, registry.clock().now_millis()))
            }
        })
    }
}

/// Decision applied when the engine cannot answer (store down, script
/// rejected). Fail-open admits with untouched-quota headers; fail-closed
/// denies with a one-second retry.
fn failure_decision(
    config: &RateLimitConfig,
    policy: &Policy,
    now_ms: u64,
    error: &RateLimitError,
) -> Decision {
    match config.failure_mode {
        FailureMode::Open => {
            warn!(
                target: "quotaguard::middleware",
                error = %error,
                algorithm = %policy.algorithm,
                "admission engine failed, failing open"
            );
            untouched_decision(policy, now_ms)
        }
        FailureMode::Closed => {
            warn!(
                target: "quotaguard::middleware",
                error = %error,
                algorithm = %policy.algorithm,
                "admission engine failed, failing closed"
            );
            Decision::denied(now_ms + 1000, 1, policy.algorithm.tag())
        }
    }
}

fn apply_quota_headers<RB>(response: &mut Response<RB>, policy: &Policy, decision: &Decision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(policy.capacity));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_epoch_ms / 1000));
    if let Ok(tag) = HeaderValue::from_str(&decision.algorithm) {
        headers.insert("x-ratelimit-algorithm", tag);
    }
    if !decision.allowed {
        headers.insert("retry-after", HeaderValue::from(decision.retry_after_secs));
    }
}

fn deny_response<RB: From<String>>(
    policy: &Policy,
    decision: &Decision,
    now_ms: u64,
) -> Response<RB> {
    let body = json!({
        "error": "Too Many Requests",
        "message": "Rate limit exceeded. Please try again later.",
        "status": 429,
        "timestamp": now_ms,
        "rateLimit": {
            "algorithm": decision.algorithm,
            "resetTime": decision.reset_epoch_ms,
            "retryAfter": decision.retry_after_secs,
            "resetTimeFormatted": format_epoch_ms(decision.reset_epoch_ms),
        },
    });

    let mut response = Response::new(RB::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_quota_headers(&mut response, policy, decision);
    response
}
