//! Bounded exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::AgentConfig;
use crate::error::Result;

/// Attempt budget and backoff curve for remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Wait after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PorticoError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .run("flaky", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PorticoError::Throttled { action: "Register".into() })
            })
            .await;

        assert!(matches!(result, Err(PorticoError::Throttled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .run("permanent", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PorticoError::MissingCredentials)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));
        let value = policy
            .run("eventually", |attempt| async move {
                if attempt < 3 {
                    Err(PorticoError::unavailable("down"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }
}
