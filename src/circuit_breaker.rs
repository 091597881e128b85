//! Three-state circuit breaker guarding the Aleo API.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::RelayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    state: CircuitState,
    failure_timestamps: Vec<Instant>,
    consecutive_half_open_successes: u32,
    reopen_not_before: Option<Instant>,
}

/// Sliding-window failure counter with a Closed/Open/HalfOpen state
/// machine.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    monitoring_window: Duration,
    failure_threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(monitoring_window: Duration, failure_threshold: usize, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_timestamps: Vec::new(),
                consecutive_half_open_successes: 0,
                reopen_not_before: None,
            }),
            monitoring_window,
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), 5, Duration::from_secs(60))
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Wraps an async operation with the breaker. Does not inspect error
    /// kinds: transient and fatal failures are counted identically.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, RelayerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, RelayerError>>,
    {
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            match inner.state {
                CircuitState::Open => {
                    if let Some(reopen_at) = inner.reopen_not_before {
                        if now >= reopen_at {
                            inner.state = CircuitState::HalfOpen;
                            inner.consecutive_half_open_successes = 0;
                        } else {
                            let retry_after_secs = (reopen_at - now).as_secs();
                            return Err(RelayerError::CircuitOpen { retry_after_secs });
                        }
                    }
                }
                CircuitState::Closed | CircuitState::HalfOpen => {}
            }
        }

        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_half_open_successes += 1;
                if inner.consecutive_half_open_successes >= 2 {
                    inner.state = CircuitState::Closed;
                    inner.failure_timestamps.clear();
                    inner.reopen_not_before = None;
                    inner.consecutive_half_open_successes = 0;
                }
            }
            CircuitState::Closed => {
                // Success in Closed state decays failure history implicitly
                // via the sliding window on the next failure check.
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.reopen_not_before = Some(now + self.reset_timeout);
                inner.consecutive_half_open_successes = 0;
            }
            CircuitState::Closed => {
                inner.failure_timestamps.push(now);
                let window_start = now - self.monitoring_window;
                inner.failure_timestamps.retain(|&t| t >= window_start);
                if inner.failure_timestamps.len() >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.reopen_not_before = Some(now + self.reset_timeout);
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail() -> Result<(), RelayerError> {
        Err(RelayerError::UpstreamUnavailable("boom".into()))
    }
    async fn succeed() -> Result<(), RelayerError> {
        Ok(())
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 3, Duration::from_secs(60));
        for _ in 0..3 {
            let _ = breaker.execute(|| fail()).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn fails_fast_while_open() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 1, Duration::from_secs(60));
        let _ = breaker.execute(|| fail()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        let err = breaker.execute(|| succeed()).await.unwrap_err();
        assert!(matches!(err, RelayerError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_requires_two_successes_to_close() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 1, Duration::from_millis(10));
        let _ = breaker.execute(|| fail()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(20)).await;
        breaker.execute(|| succeed()).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.execute(|| succeed()).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 1, Duration::from_millis(10));
        let _ = breaker.execute(|| fail()).await;
        tokio::time::advance(Duration::from_millis(20)).await;
        breaker.execute(|| succeed()).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let _ = breaker.execute(|| fail()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
