//! Bounded retry with exponential backoff for a single provider.
//!
//! An attempt that fails with a retryable error is retried up to
//! `max_retries` times, waiting `min(base * 2^retry, max)` between
//! attempts. Rate limits add a fixed pause before the backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::types::Provider;
use crate::error::{Error, Result};

/// Retry policy for intra-provider retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff base delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Extra pause after a rate limit
    pub rate_limit_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            rate_limit_pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable
    /// error, or retries are exhausted.
    pub async fn run<T, F, Fut>(&self, provider: Provider, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if retry >= self.max_retries {
                warn!(%provider, attempts = retry + 1, error = %error, "retries exhausted");
                return Err(Error::MaxRetriesExceeded {
                    provider: provider.to_string(),
                    attempts: retry + 1,
                    last_error: error.to_string(),
                });
            }

            let mut delay = self.backoff(retry);
            if error.is_rate_limit() {
                delay += self.rate_limit_pause;
            }
            debug!(%provider, retry, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        // Capped at 10s
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy
            .run(Provider::OpenAI, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::connection("openai", "reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<()> = policy
            .run(Provider::Groq, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::llm_api("groq", "overloaded")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(Error::MaxRetriesExceeded {
                provider,
                attempts,
                last_error,
            }) => {
                assert_eq!(provider, "groq");
                assert_eq!(attempts, 4);
                assert!(last_error.contains("overloaded"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<()> = policy
            .run(Provider::OpenAI, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Config("no api key".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_adds_fixed_pause() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();

        let result = policy
            .run(Provider::OpenAI, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::rate_limited("openai"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        // 1s rate-limit pause + 100ms backoff
        assert!(started.elapsed() >= Duration::from_millis(1100));
    }
}
