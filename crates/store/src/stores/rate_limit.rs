//! Sliding-window rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use crate::keys;
use crate::kv::{Kv, WriteOp};

/// A named window and the number of requests it admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub scope: &'static str,
    pub window: Duration,
    pub max_requests: u64,
}

impl RateLimitPolicy {
    pub const AUTH: Self = Self {
        scope: "auth",
        window: Duration::from_secs(15 * 60),
        max_requests: 5,
    };

    pub const REGISTRATION: Self = Self {
        scope: "registration",
        window: Duration::from_secs(60 * 60),
        max_requests: 3,
    };

    pub const OTP: Self = Self {
        scope: "otp",
        window: Duration::from_secs(5 * 60),
        max_requests: 3,
    };

    pub const API: Self = Self {
        scope: "api",
        window: Duration::from_secs(60),
        max_requests: 100,
    };

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    fn window_delta(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.window_millis())
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// When the oldest counted request leaves the window.
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed.
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn open(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: policy.max_requests,
            reset_at: now + policy.window_delta(),
            retry_after_secs: 0,
        }
    }
}

/// Rate limiter keyed by (scope, identifier).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check and, when allowed, record one request. Never fails: backend
    /// errors allow the request.
    async fn check(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision;
}

/// Kv implementation of RateLimiter, one sorted set of request timestamps
/// per identifier.
#[derive(Clone)]
pub struct KvRateLimiter {
    kv: Arc<dyn Kv>,
}

impl KvRateLimiter {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    async fn try_check(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RateLimitDecision> {
        let key = keys::rate_limit_key(policy.scope, identifier);
        let now_ms = now.timestamp_millis();
        let window_ms = policy.window_millis();

        self.kv
            .zremrangebyscore_below(&key, (now_ms - window_ms) as f64)
            .await?;
        let count = self.kv.zcard(&key).await?;

        if count >= policy.max_requests {
            // Limited attempts are not recorded.
            let oldest = self
                .kv
                .zmin_score(&key)
                .await?
                .map(|score| score as i64)
                .unwrap_or(now_ms);
            let reset_ms = oldest + window_ms;
            let reset_at = Utc
                .timestamp_millis_opt(reset_ms)
                .single()
                .unwrap_or(now + policy.window_delta());
            let wait_ms = (reset_ms - now_ms).max(0) as u64;

            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after_secs: wait_ms.div_ceil(1000),
            });
        }

        self.kv
            .batch(vec![
                WriteOp::ZAdd {
                    key: key.clone(),
                    member: format!("{}-{}", now_ms, Uuid::new_v4().simple()),
                    score: now_ms as f64,
                },
                WriteOp::Expire {
                    key,
                    secs: policy.window.as_secs().max(1) as i64,
                },
            ])
            .await?;

        Ok(RateLimitDecision {
            allowed: true,
            remaining: policy.max_requests - count - 1,
            reset_at: now + policy.window_delta(),
            retry_after_secs: 0,
        })
    }
}

#[async_trait]
impl RateLimiter for KvRateLimiter {
    async fn check(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        match self.try_check(policy, identifier, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::info!(
                        scope = policy.scope,
                        identifier,
                        retry_after_secs = decision.retry_after_secs,
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => {
                tracing::warn!(
                    scope = policy.scope,
                    identifier,
                    error = %err,
                    "rate limiter unavailable, allowing request"
                );
                RateLimitDecision::open(policy, now)
            }
        }
    }
}
