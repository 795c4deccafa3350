//! Bounded retry for outbound protocol calls.
//!
//! Each attempt runs under its own timeout; the delay between attempts grows
//! linearly. There is no unbounded mode.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    attempt_timeout: Duration,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, attempt_timeout: Duration, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(attempt as u32)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. A timed-out attempt counts as
    /// a failure. The last error is returned with the attempt count attached.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut handle = self.handle();
        loop {
            let attempt = handle.attempts() + 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "timed out after {} ms",
                    self.attempt_timeout.as_millis()
                )),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match handle.next_delay() {
                Some(delay) => {
                    debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => {
                    return Err(err.context(format!(
                        "{} failed after {} attempt(s)",
                        what, attempt
                    )))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(5), Duration::from_millis(200))
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_delays_and_budget() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1), Duration::from_millis(100));
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 2);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::linear(0, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.handle().next_delay(), None);
    }

    #[tokio::test]
    async fn test_run_succeeds_after_failures() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1), Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let value = policy
            .run("flaky", move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        anyhow::bail!("attempt {} failed", attempt)
                    }
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_and_counts_timeouts() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(10), Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let err = policy
            .run("stuck", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(format!("{:#}", err).contains("after 2 attempt(s)"));
    }
}
