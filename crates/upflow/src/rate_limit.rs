//! Token-bucket admission control
//!
//! One bucket per caller-chosen key, refilled continuously at
//! `max_requests / window_ms` tokens per millisecond and capped at
//! `max_requests`. Buckets live in a bounded LRU map with an optional
//! idle TTL, so an attacker cycling keys cannot grow memory without bound.

use crate::lru::LruCache;

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Bucket capacity: requests admitted in a burst. Default: 100.
    pub max_requests: u32,
    /// Window over which `max_requests` refill. Default: 60 000 ms.
    pub window_ms: u64,
    /// Bound on tracked keys. Default: 10 000.
    pub max_keys: usize,
    /// Idle buckets older than this are dropped by [`cleanup`](TokenBucketRateLimiter::cleanup).
    /// Default: 10 minutes.
    pub idle_ttl_ms: Option<u64>,
    /// Suggested interval for calling `cleanup`. Default: 300 000 ms.
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
            max_keys: 10_000,
            idle_ttl_ms: Some(600_000),
            cleanup_interval_ms: 300_000,
        }
    }
}

/// Admission verdict for an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub limit: u32,
    /// Whole tokens left after this admission.
    pub remaining: u32,
    /// Milliseconds until the bucket is full again.
    pub reset_ms: u64,
}

/// Rejection carrying everything a 429 response needs.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("rate limit of {limit} per window exceeded, retry after {retry_after_ms}ms")]
pub struct RateLimitRejection {
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_ms: u64,
    /// Milliseconds until the bucket is full again.
    pub reset_ms: u64,
}

impl From<RateLimitRejection> for crate::UploadError {
    fn from(rejection: RateLimitRejection) -> Self {
        let mut err = Self::with_message(crate::UploadErrorCode::RateLimitExceeded, rejection.to_string());
        err.set_source(Box::new(rejection));
        err
    }
}

/// Derives the admission key from request headers and the peer address.
pub type KeyExtractor = Box<dyn Fn(&HeaderMap, Option<SocketAddr>) -> String + Send + Sync>;

/// First `x-forwarded-for` address when present, else the peer address.
fn default_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(value) = headers.get("x-forwarded-for")
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_owned();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_owned(),
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared, internally synchronized rate limiter.
pub struct TokenBucketRateLimiter {
    config: RateLimiterConfig,
    /// tokens per millisecond
    refill_rate: f64,
    buckets: Mutex<LruCache<String, TokenBucket>>,
    key_extractor: KeyExtractor,
}

impl TokenBucketRateLimiter {
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_key_extractor(config, Box::new(default_key))
    }

    #[must_use]
    pub fn with_key_extractor(config: RateLimiterConfig, key_extractor: KeyExtractor) -> Self {
        let ttl = config.idle_ttl_ms.map(std::time::Duration::from_millis);
        let buckets = Mutex::new(LruCache::with_ttl(config.max_keys, ttl));
        let refill_rate = f64::from(config.max_requests) / config.window_ms as f64;
        Self {
            config,
            refill_rate,
            buckets,
            key_extractor,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admits or rejects one request for `key`.
    ///
    /// # Errors
    /// [`RateLimitRejection`] with a positive `retry_after_ms` when the
    /// bucket has less than one token.
    pub fn check(&self, key: &str) -> Result<RateQuota, RateLimitRejection> {
        let capacity = f64::from(self.config.max_requests);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();

        if !buckets.contains(key) {
            buckets.insert(
                key.to_owned(),
                TokenBucket {
                    tokens: capacity,
                    last_refill: now,
                },
            );
        }
        let bucket = buckets.get_mut(key).expect("bucket exists after insert");
        let elapsed_ms = now.duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        bucket.tokens = f64::min(capacity, bucket.tokens + elapsed_ms * self.refill_rate);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let quota = RateQuota {
                limit: self.config.max_requests,
                remaining: bucket.tokens as u32,
                reset_ms: ((capacity - bucket.tokens) / self.refill_rate).ceil() as u64,
            };
            Ok(quota)
        } else {
            let retry_after_ms = ((1.0 - bucket.tokens) / self.refill_rate).ceil() as u64;
            tracing::debug!(key, retry_after_ms, "rate limit exceeded");
            Err(RateLimitRejection {
                limit: self.config.max_requests,
                remaining: 0,
                retry_after_ms,
                reset_ms: ((capacity - bucket.tokens) / self.refill_rate).ceil() as u64,
            })
        }
    }

    /// Extracts the key from the request and checks admission.
    ///
    /// # Errors
    /// See [`check`](Self::check).
    pub fn check_request(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<RateQuota, RateLimitRejection> {
        let key = (self.key_extractor)(headers, peer);
        self.check(&key)
    }

    /// Drops idle buckets past their TTL, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        self.buckets.lock().unwrap().sweep_expired()
    }

    /// Number of currently tracked keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

impl std::fmt::Debug for TokenBucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter::new(RateLimiterConfig {
            max_requests,
            window_ms,
            ..RateLimiterConfig::default()
        })
    }

    #[test]
    fn burst_up_to_capacity_then_reject() {
        let limiter = limiter(2, 1000);
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());
        let rejection = limiter.check("k").unwrap_err();
        assert!(rejection.retry_after_ms > 0);
        assert_eq!(rejection.limit, 2);
        assert_eq!(rejection.remaining, 0);
    }

    #[tokio::test]
    async fn admission_resumes_after_retry_after() {
        let limiter = limiter(2, 200);
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();
        let rejection = limiter.check("k").unwrap_err();
        tokio::time::sleep(std::time::Duration::from_millis(rejection.retry_after_ms + 20)).await;
        assert!(limiter.check("k").is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let limiter = limiter(3, 200);
        limiter.check("k").unwrap();
        // long idle: refill must cap at capacity, allowing exactly 3
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_err());
    }

    #[test]
    fn key_table_is_bounded() {
        let limiter = TokenBucketRateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window_ms: 1000,
            max_keys: 8,
            ..RateLimiterConfig::default()
        });
        for i in 0..100 {
            let _ = limiter.check(&format!("key-{i}"));
        }
        assert!(limiter.tracked_keys() <= 8);
    }

    #[test]
    fn forwarded_for_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();
        assert_eq!(default_key(&headers, Some(peer)), "203.0.113.7");
        assert_eq!(default_key(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(default_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn rejection_converts_to_429() {
        let limiter = limiter(1, 60_000);
        limiter.check("k").unwrap();
        let err: crate::UploadError = limiter.check("k").unwrap_err().into();
        assert_eq!(err.code(), crate::UploadErrorCode::RateLimitExceeded);
        assert_eq!(err.status_code(), http::StatusCode::TOO_MANY_REQUESTS);
    }
}
