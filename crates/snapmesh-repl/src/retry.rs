//! Bounded retry with linear backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retries an operation up to `attempts` times, sleeping `attempt × stride`
/// after each failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Base of the linear backoff.
    pub stride: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            stride: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy.
    pub fn new(attempts: u32, stride: Duration) -> Self {
        Self { attempts, stride }
    }

    /// Sleep after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.stride * attempt
    }

    /// Runs `op` until it succeeds or attempts run out; the last error is
    /// returned. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(what, |_| true, op).await
    }

    /// Like [`RetryPolicy::run`], but gives up at once on errors `retryable`
    /// rejects.
    pub async fn run_if<T, E, P, F, Fut>(&self, what: &str, retryable: P, mut op: F) -> Result<T, E>
    where
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts || !retryable(&e) => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<u32, String> = policy
            .run("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("boom {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), String> = policy
            .run("op", |attempt| async move { Err(format!("boom {attempt}")) })
            .await;
        assert_eq!(result, Err("boom 5".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_retrying() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), String> = policy
            .run_if(
                "op",
                |e: &String| !e.starts_with("fatal"),
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 1 {
                            Err("flaky".to_string())
                        } else {
                            Err("fatal".to_string())
                        }
                    }
                },
            )
            .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
