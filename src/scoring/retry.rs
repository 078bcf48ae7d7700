//! Timeout and retry wrapper for score providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::ScoringConfig;
use crate::error::ProviderError;
use crate::scoring::{ScoreProvider, ToxicityScore};

/// Longest single backoff sleep. Rate-limit hints above this are surfaced
/// to the caller instead of waited out.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Bounds every attempt by a timeout and retries transient failures with
/// exponential backoff plus jitter.
pub struct RetryingProvider {
    inner: Arc<dyn ScoreProvider>,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn ScoreProvider>, config: &ScoringConfig) -> Self {
        Self {
            inner,
            timeout: config.timeout,
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
        }
    }

    async fn attempt(&self, text: &str) -> Result<ToxicityScore, ProviderError> {
        match tokio::time::timeout(self.timeout, self.inner.score(text)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                provider: self.inner.name().to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(retry));
        let jitter_cap = (self.base_delay.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        (exp + jitter).min(MAX_BACKOFF)
    }
}

#[async_trait]
impl ScoreProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn score(&self, text: &str) -> Result<ToxicityScore, ProviderError> {
        let mut retry = 0;
        loop {
            let err = match self.attempt(text).await {
                Ok(score) => return Ok(score),
                Err(e) => e,
            };

            if !err.is_transient() || retry >= self.max_retries {
                warn!(provider = self.name(), retries = retry, error = %err, "Scoring failed");
                return Err(err);
            }

            let mut delay = self.backoff(retry);
            if let ProviderError::RateLimited {
                retry_after: Some(hint),
                ..
            } = &err
            {
                if *hint > MAX_BACKOFF {
                    return Err(err);
                }
                delay = delay.max(*hint);
            }

            retry += 1;
            debug!(
                provider = self.name(),
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying score request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with `error`, then succeeds.
    struct FlakyProvider {
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScoreProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn score(&self, _text: &str) -> Result<ToxicityScore, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(ToxicityScore {
                value: 0.4,
                subscores: BTreeMap::new(),
                categories: vec![],
                confidence: 0.9,
                provider: "flaky".into(),
                computed_at: Utc::now(),
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl ScoreProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn score(&self, _text: &str) -> Result<ToxicityScore, ProviderError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(ProviderError::DeadlineExceeded)
        }
    }

    fn config(max_retries: u32) -> ScoringConfig {
        ScoringConfig {
            timeout: Duration::from_millis(50),
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            ..ScoringConfig::default()
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            provider: "flaky".into(),
            reason: "503".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let inner = Arc::new(FlakyProvider {
            failures: 2,
            error: unavailable(),
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(inner.clone(), &config(2));
        let score = provider.score("text").await.unwrap();
        assert_eq!(score.value, 0.4);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(FlakyProvider {
            failures: 10,
            error: unavailable(),
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(inner.clone(), &config(1));
        assert!(provider.score("text").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let inner = Arc::new(FlakyProvider {
            failures: 1,
            error: ProviderError::InvalidResponse {
                provider: "flaky".into(),
                reason: "bad json".into(),
            },
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(inner.clone(), &config(3));
        assert!(provider.score("text").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let provider = RetryingProvider::new(Arc::new(SlowProvider), &config(0));
        let err = provider.score("text").await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn long_rate_limit_hint_is_surfaced() {
        let inner = Arc::new(FlakyProvider {
            failures: 1,
            error: ProviderError::RateLimited {
                provider: "flaky".into(),
                retry_after: Some(Duration::from_secs(60)),
            },
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(inner.clone(), &config(3));
        let err = provider.score("text").await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
