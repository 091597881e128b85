//! Token-bucket rate limiting for the Aleo upstream API.
//!
//! Two independent buckets (`per_second`, `per_minute`) gate every call;
//! `acquire()` waits until both can afford a token. This is conceptually the
//! same shape as `alloy_transport::layers::ThrottleLayer`, hand-rolled here
//! because two independently configured windows need to be enforced
//! together rather than just one.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::RelayerError;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate_per_sec: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let refill_rate_per_sec = capacity as f64 / window.as_secs_f64();
        TokenBucket {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate_per_sec,
            last_refill_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity);
            self.last_refill_at = now;
        }
    }

    /// Returns `Some(wait)` if a token isn't available yet, `None` if one
    /// was just consumed.
    fn try_consume(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_rate_per_sec))
        }
    }
}

/// Gate for upstream Aleo API calls: one bucket per second, one per minute.
pub struct RateLimiter {
    per_second: Mutex<TokenBucket>,
    per_minute: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(rps: u32, rpm: u32) -> Self {
        RateLimiter {
            per_second: Mutex::new(TokenBucket::new(rps.max(1), Duration::from_secs(1))),
            per_minute: Mutex::new(TokenBucket::new(rpm.max(1), Duration::from_secs(60))),
        }
    }

    /// Blocks the caller until both buckets have >=1 token, then decrements
    /// both. Cancellable via `cancellation`; returns `RateLimited` only if
    /// cancellation fires while waiting.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> Result<(), RelayerError> {
        loop {
            let now = Instant::now();
            let sec_wait = {
                let mut bucket = self.per_second.lock().await;
                bucket.try_consume(now)
            };
            let min_wait = {
                let mut bucket = self.per_minute.lock().await;
                bucket.try_consume(now)
            };

            match (sec_wait, min_wait) {
                (None, None) => return Ok(()),
                (sec, min) => {
                    // At least one bucket denied: undo any consumption from
                    // the other bucket so we don't leak tokens while waiting.
                    if sec.is_none() {
                        self.per_second.lock().await.tokens += 1.0;
                    }
                    if min.is_none() {
                        self.per_minute.lock().await.tokens += 1.0;
                    }
                    let wait = sec.into_iter().chain(min).max().unwrap_or(Duration::from_millis(10));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => continue,
                        _ = cancellation.cancelled() => return Err(RelayerError::RateLimited),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_within_capacity() {
        let limiter = RateLimiter::new(5, 100);
        let token = CancellationToken::new();
        for _ in 0..5 {
            limiter.acquire(&token).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_then_succeeds_after_refill() {
        let limiter = RateLimiter::new(1, 100);
        let token = CancellationToken::new();
        limiter.acquire(&token).await.unwrap();
        let fut = limiter.acquire(&token);
        tokio::pin!(fut);
        tokio::time::advance(Duration::from_millis(1100)).await;
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn acquire_returns_rate_limited_on_cancellation() {
        let limiter = RateLimiter::new(1, 1);
        let token = CancellationToken::new();
        limiter.acquire(&token).await.unwrap();
        limiter.acquire(&token).await.unwrap();
        token.cancel();
        let err = limiter.acquire(&token).await.unwrap_err();
        assert!(matches!(err, RelayerError::RateLimited));
    }
}
