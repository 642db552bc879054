//! Token bucket rate limiter (`spec.md` §4.A)
//!
//! One bucket per upstream provider host gates connection acquisition.
//! Grounded directly on `original_source/app/controllers/imap/connection.py::RateLimiter`:
//! continuous refill proportional to elapsed time, and on wake from a wait
//! the bucket is set to exactly zero rather than credited the requested
//! amount — the "wait-and-clear" policy `spec.md` calls out as bounding
//! expected wait and preventing starvation under contention.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Per-provider token bucket.
///
/// `acquire` is FIFO per provider because callers serialize through the
/// internal `Mutex` in arrival order — `tokio::sync::Mutex` wakes waiters in
/// the order they queued.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// `burst` defaults to `2 * rate` when `None`, per `spec.md` §4.A.
    pub fn new(rate: f64, burst: Option<f64>) -> Self {
        let burst = burst.unwrap_or(rate * 2.0);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    /// Block the caller until `tokens` tokens are available, then consume
    /// them (or, if a wait was required, drain the bucket to zero).
    pub async fn acquire(&self, tokens: f64) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
            state.last_update = now;

            if state.tokens >= tokens {
                state.tokens -= tokens;
                None
            } else {
                let deficit = tokens - state.tokens;
                Some(Duration::from_secs_f64(deficit / self.rate))
            }
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
            let mut state = self.state.lock().await;
            // The wait already accounted for the requested tokens; clearing
            // to zero (rather than crediting `tokens`) is the policy named
            // in `spec.md` §4.A, and is what prevents a burst of waiters
            // from all waking into a full bucket simultaneously.
            state.tokens = 0.0;
            state.last_update = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn burst_capacity_is_immediately_available() {
        let limiter = RateLimiter::new(9.0, Some(10.0));
        let start = StdInstant::now();
        for _ in 0..10 {
            limiter.acquire(1.0).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquirers_beyond_burst_wait_for_refill() {
        // rate=9, burst=10: 25 concurrent acquires of 1 token each must take
        // at least (25-10)/9 seconds in aggregate (`spec.md` §8 scenario 6).
        let limiter = Arc::new(RateLimiter::new(9.0, Some(10.0)));
        let start = StdInstant::now();
        let mut handles = Vec::new();
        for _ in 0..25 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(1.0).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task completes");
        }
        assert!(start.elapsed() >= Duration::from_secs_f64(15.0 / 9.0 - 0.5));
    }

    #[tokio::test]
    async fn acquire_of_n_less_than_burst_completes_in_finite_time() {
        let limiter = RateLimiter::new(5.0, Some(5.0));
        tokio::time::timeout(Duration::from_secs(5), limiter.acquire(3.0))
            .await
            .expect("acquire completes well within the timeout");
    }
}
