//! Request-level rate limiting for axum services.
//!
//! ```ignore
//! let limited = Router::new()
//!     .route("/auth/login", post(login))
//!     .layer(axum::middleware::from_fn_with_state(
//!         RateLimitState::new(stores.rate_limiter.clone(), RateLimitPolicy::AUTH),
//!         enforce,
//!     ));
//! ```

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::stores::{RateLimitPolicy, RateLimiter};

const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Headers consulted for the caller's address, most trusted first.
const IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Best-effort caller identity.
///
/// Uses the first `x-forwarded-for` hop, then `x-real-ip`, then
/// `cf-connecting-ip`. Without any of them, falls back to a fingerprint of
/// user-agent and accept-language so anonymous callers still get a bucket.
pub fn client_identifier(headers: &HeaderMap) -> String {
    for name in IP_HEADERS {
        let ip = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = ip {
            return ip.to_string();
        }
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    let mut hasher = Sha256::new();
    hasher.update(header("user-agent").as_bytes());
    hasher.update(b"|");
    hasher.update(header("accept-language").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("anon:{}", &digest[..16])
}

/// State for [`enforce`]: which limiter and which window.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<dyn RateLimiter>,
    policy: RateLimitPolicy,
}

impl RateLimitState {
    pub fn new(limiter: Arc<dyn RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self { limiter, policy }
    }
}

/// Middleware that rejects over-limit callers with 429 and `Retry-After`.
pub async fn enforce(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identifier = client_identifier(request.headers());
    let decision = state
        .limiter
        .check(&state.policy, &identifier, Utc::now())
        .await;

    if !decision.allowed {
        return Err(AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    Ok(response)
}
