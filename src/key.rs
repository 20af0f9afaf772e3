//! Principal-key derivation.
//!
//! Engines treat the principal key as an opaque string; this module decides
//! what that string is for a given request. The strategies mirror the usual
//! deployment choices: count against the authenticated user, the client
//! address, the endpoint, or a fixed literal.

use http::Request;
use tracing::{debug, warn};

/// How the admission pipeline derives the principal key from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The client address, taken from the first `x-forwarded-for` entry.
    /// Falls back to `"unknown"` when absent.
    ClientAddr,
    /// The authenticated user id, taken from `Authorization: Bearer <id>`
    /// where `<id>` is a decimal integer. Falls back to the configured
    /// default principal on absence or parse failure.
    UserId,
    /// The endpoint signature, `METHOD:path`.
    Endpoint,
    /// A caller-supplied literal, shared by every request.
    Literal(String),
}

/// Derive the principal key for `req` under `strategy`.
pub fn principal_key<B>(strategy: &KeyStrategy, req: &Request<B>, default_principal: u64) -> String {
    match strategy {
        KeyStrategy::ClientAddr => client_addr(req),
        KeyStrategy::UserId => bearer_user_id(req)
            .unwrap_or(default_principal)
            .to_string(),
        KeyStrategy::Endpoint => format!("{}:{}", req.method(), req.uri().path()),
        KeyStrategy::Literal(value) => value.clone(),
    }
}

/// Extract the decimal user id from the `Authorization: Bearer <id>` header.
pub fn bearer_user_id<B>(req: &Request<B>) -> Option<u64> {
    let header = req.headers().get(http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    match token.trim().parse::<u64>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(target: "quotaguard::key", token = %token, "bearer token is not a decimal user id");
            None
        }
    }
}

fn client_addr<B>(req: &Request<B>) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match forwarded {
        Some(addr) => addr.to_string(),
        None => {
            debug!(target: "quotaguard::key", "no client address on request");
            "unknown".to_string()
        }
    }
}
