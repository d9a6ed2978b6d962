//! Per-exchange rate limiting: minimum inter-call spacing plus a
//! concurrency cap. `acquire()` is the suspension point named in spec §5 —
//! callers block until a permit is granted rather than racing the venue's
//! limits.
//!
//! Shaped as a token bucket refilled on demand (no background task): each
//! `acquire()` refills based on elapsed time since the last refill, then
//! takes one token, blocking on the concurrency semaphore if the bucket is
//! empty. This keeps the limiter process-local and exchange-scoped, per
//! the "never shared across exchanges" design note.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

struct Bucket {
    tokens: AtomicU64,
    last_refill: Mutex<Instant>,
}

/// A guard held while a call is in flight; dropping it releases the
/// concurrency slot for the next waiter.
pub struct Permit<'a> {
    _semaphore_permit: tokio::sync::SemaphorePermit<'a>,
}

pub struct RateLimiter {
    min_interval: Duration,
    concurrency: Arc<Semaphore>,
    bucket: Bucket,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms.max(1)),
            concurrency: Arc::new(Semaphore::new(config.max_concurrent.max(1) as usize)),
            bucket: Bucket {
                tokens: AtomicU64::new(1),
                last_refill: Mutex::new(Instant::now()),
            },
        }
    }

    /// Blocks until both a concurrency slot and a spacing token are free.
    pub async fn acquire(&self) -> Permit<'_> {
        let semaphore_permit = self
            .concurrency
            .acquire()
            .await
            .expect("rate limiter semaphore never closes");

        self.wait_for_token().await;

        Permit {
            _semaphore_permit: semaphore_permit,
        }
    }

    async fn wait_for_token(&self) {
        loop {
            let mut last_refill = self.bucket.last_refill.lock().await;
            let elapsed = last_refill.elapsed();

            if elapsed >= self.min_interval {
                self.bucket.tokens.store(1, Ordering::SeqCst);
                *last_refill = Instant::now();
            }
            drop(last_refill);

            let available = self.bucket.tokens.swap(0, Ordering::SeqCst);
            if available > 0 {
                return;
            }

            let remaining = self.min_interval.saturating_sub(elapsed);
            tokio::time::sleep(remaining.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_minimum_spacing() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            min_interval_ms: 50,
            max_concurrent: 2,
        });

        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn caps_concurrency() {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            min_interval_ms: 0,
            max_concurrent: 1,
        }));

        let a = limiter.clone();
        let permit_held = tokio::spawn(async move {
            let _p = a.acquire().await;
            tokio::time::sleep(Duration::from_millis(40)).await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let start = Instant::now();
        let _second = limiter.acquire().await;
        // second acquire had to wait for the first to release its slot
        assert!(start.elapsed() >= Duration::from_millis(20));
        permit_held.await.unwrap();
    }
}
