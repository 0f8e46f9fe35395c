//! Token-bucket rate limiting keyed by `provider::model`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Canonical limiter key: lower-cased `provider::model`.
pub fn limiter_key(provider: &str, model: &str) -> String {
    format!("{}::{}", provider.trim(), model.trim()).to_lowercase()
}

fn provider_wildcard(provider: &str) -> String {
    limiter_key(provider, "*")
}

/// Rate limit for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum burst size.
    pub capacity: u32,
    /// Refill rate. Zero disables rate limiting for the key.
    pub requests_per_minute: u32,
    /// Hard minimum gap between two grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            capacity: 10,
            requests_per_minute: 60,
            min_interval_ms: None,
        }
    }
}

impl RateLimit {
    pub fn unlimited() -> Self {
        Self {
            capacity: u32::MAX,
            requests_per_minute: 0,
            min_interval_ms: None,
        }
    }
}

/// Outcome of a non-blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Denied; a permit is expected after this long.
    Wait(Duration),
}

#[derive(Debug, Clone)]
struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
    last_grant: Option<Instant>,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            tokens: limit.capacity as f64,
            last_refill: now,
            last_grant: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        let earned = elapsed_ms * self.limit.requests_per_minute as f64 / 60_000.0;
        self.tokens = (self.tokens + earned).min(self.limit.capacity as f64);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> Acquire {
        if let (Some(min_ms), Some(last)) = (self.limit.min_interval_ms, self.last_grant) {
            let gap = Duration::from_millis(min_ms);
            let since = now.saturating_duration_since(last);
            if since < gap {
                return Acquire::Wait(gap - since);
            }
        }

        if self.limit.requests_per_minute == 0 {
            self.last_grant = Some(now);
            return Acquire::Granted;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.last_grant = Some(now);
            Acquire::Granted
        } else {
            let missing = 1.0 - self.tokens;
            let wait_ms = (missing * 60_000.0 / self.limit.requests_per_minute as f64)
                .ceil()
                .max(1.0);
            Acquire::Wait(Duration::from_millis(wait_ms as u64))
        }
    }
}

/// Per-key token buckets behind one short-held lock.
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: RateLimit,
    limits: HashMap<String, RateLimit>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            limits: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Configure the limit for one model. Use `*` as the model to cover
    /// every model of a provider.
    pub fn with_limit(mut self, provider: &str, model: &str, limit: RateLimit) -> Self {
        self.limits.insert(limiter_key(provider, model), limit);
        self
    }

    /// Limit in force for a key: exact model, then provider-wide, then default.
    pub fn limit_for(&self, provider: &str, model: &str) -> RateLimit {
        self.limits
            .get(&limiter_key(provider, model))
            .or_else(|| self.limits.get(&provider_wildcard(provider)))
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn try_acquire(&self, provider: &str, model: &str) -> Acquire {
        self.try_acquire_at(provider, model, Instant::now())
    }

    pub fn try_acquire_at(&self, provider: &str, model: &str, now: Instant) -> Acquire {
        let key = limiter_key(provider, model);
        let limit = self.limit_for(provider, model);
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(limit, now));
        bucket.try_acquire(now)
    }

    /// Wait for a permit.
    ///
    /// Returns how long the caller waited. With a `queue_timeout`, gives up
    /// with [`Error::QueueTimeout`] once the next wait would exceed it.
    pub async fn acquire(
        &self,
        provider: &str,
        model: &str,
        queue_timeout: Option<Duration>,
    ) -> Result<Duration> {
        let started = Instant::now();
        loop {
            match self.try_acquire(provider, model) {
                Acquire::Granted => return Ok(started.elapsed()),
                Acquire::Wait(wait) => {
                    let waited = started.elapsed();
                    if let Some(limit) = queue_timeout {
                        if waited + wait > limit {
                            tracing::debug!(
                                key = %limiter_key(provider, model),
                                waited_ms = waited.as_millis() as u64,
                                "admission queue timeout"
                            );
                            return Err(Error::QueueTimeout(waited));
                        }
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
