//! Token-bucket admission control.
//!
//! [`RateLimiter`] is a single bucket: `acquire(n)` refills from elapsed time,
//! and if the bucket is short computes the exact wait `(n - tokens) / rate`,
//! releases the lock, sleeps, and tries again. The refill-check-debit step is
//! one critical section; the sleep happens outside it.
//!
//! [`ModelLimiters`] holds one request bucket and one token bucket per model,
//! shared by every worker of every job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scribeflow_core::QuotaConfig;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Refill arithmetic is floating point; a deficit below this is rounding.
const TOKEN_EPSILON: f64 = 1e-9;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with fixed capacity and refill rate.
pub struct RateLimiter {
    capacity: f64,
    /// Tokens per second. Non-positive means unlimited.
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Bucket that starts full.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let capacity = if capacity.is_finite() { capacity.max(0.0) } else { 0.0 };
        Self {
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket holding `limit` tokens per `window`, refilled continuously.
    pub fn per_window(limit: u32, window: Duration) -> Self {
        let secs = window.as_secs_f64().max(f64::EPSILON);
        Self::new(limit as f64, limit as f64 / secs)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn is_unlimited(&self) -> bool {
        self.refill_rate.is_nan() || self.refill_rate <= 0.0 || self.capacity == 0.0
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Debit `n` tokens now if available, or return how long to wait.
    fn try_debit(&self, n: f64) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens + TOKEN_EPSILON >= n {
            bucket.tokens = (bucket.tokens - n).max(0.0);
            return Ok(());
        }
        // A tiny refill rate can push the wait past what a Duration holds.
        let wait = Duration::try_from_secs_f64((n - bucket.tokens) / self.refill_rate)
            .unwrap_or(Duration::MAX);
        Err(wait.max(Duration::from_nanos(1)))
    }

    fn clamp_request(&self, n: f64) -> f64 {
        let n = if n.is_finite() { n.max(0.0) } else { self.capacity };
        if n > self.capacity {
            warn!(
                "Request for {:.0} tokens exceeds bucket capacity {:.0}; clamping",
                n, self.capacity
            );
            return self.capacity;
        }
        n
    }

    /// Block until `n` tokens are available, then debit them.
    ///
    /// Returns the total time spent waiting. Requests larger than the
    /// capacity are clamped to it so they can eventually be admitted.
    pub async fn acquire(&self, n: f64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let n = self.clamp_request(n);
        let started = Instant::now();
        loop {
            match self.try_debit(n) {
                Ok(()) => return started.elapsed(),
                Err(wait) => {
                    debug!("Rate limiter waiting {:?} for {:.0} tokens", wait, n);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Debit `n` tokens only if they are available right now.
    pub fn try_acquire(&self, n: f64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let n = self.clamp_request(n);
        self.try_debit(n).is_ok()
    }

    /// Tokens currently in the bucket, after refill.
    pub fn available(&self) -> f64 {
        if self.is_unlimited() {
            return f64::INFINITY;
        }
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }
}

/// Request and token buckets for one model.
pub struct ModelLimiter {
    pub requests: Option<RateLimiter>,
    pub tokens: Option<RateLimiter>,
}

/// Per-model limiters built from [`QuotaConfig`]. Models without configured
/// ceilings are admitted immediately.
pub struct ModelLimiters {
    limiters: HashMap<String, Arc<ModelLimiter>>,
}

impl ModelLimiters {
    pub fn from_config(config: &QuotaConfig) -> Self {
        let window = config.window();
        let mut models: Vec<&String> = config
            .request_limits
            .keys()
            .chain(config.token_limits.keys())
            .collect();
        models.sort();
        models.dedup();

        let limiters = models
            .into_iter()
            .map(|model| {
                let limiter = ModelLimiter {
                    requests: config
                        .request_limit(model)
                        .map(|limit| RateLimiter::per_window(limit, window)),
                    tokens: config
                        .token_limit(model)
                        .map(|limit| RateLimiter::per_window(limit, window)),
                };
                (model.clone(), Arc::new(limiter))
            })
            .collect();
        Self { limiters }
    }

    pub fn get(&self, model: &str) -> Option<Arc<ModelLimiter>> {
        self.limiters.get(model).cloned()
    }

    /// Admit one request costing `tokens` for `model`. Returns the time waited.
    pub async fn acquire(&self, model: &str, tokens: u64) -> Duration {
        let Some(limiter) = self.get(model) else {
            return Duration::ZERO;
        };
        let mut waited = Duration::ZERO;
        if let Some(requests) = &limiter.requests {
            waited += requests.acquire(1.0).await;
        }
        if let Some(bucket) = &limiter.tokens {
            waited += bucket.acquire(tokens as f64).await;
        }
        waited
    }
}
