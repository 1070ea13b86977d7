//! Retry logic with exponential backoff and cooperative cancellation

use crate::error::StreamError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `initial * multiplier^(retry-1)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_nanos() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            (rand::random::<f64>() - 0.5) * 2.0 * capped * self.jitter_factor
        } else {
            0.0
        };
        Duration::from_nanos((capped + jitter).max(0.0).round() as u64)
    }
}

/// Last error of a retry loop, with the number of attempts made
#[derive(Debug)]
pub struct Exhausted {
    pub error: StreamError,
    pub attempts: u32,
}

/// Retry executor
pub struct RetryExecutor {
    config: RetryConfig,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default())
    }

    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Abort attempts and backoff sleeps once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `func` until it succeeds, fails with a non-retryable error or
    /// runs out of retries
    pub async fn execute<F, Fut, T>(&self, func: F) -> Result<T, StreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StreamError>>,
    {
        self.run(func).await.map_err(|e| e.error)
    }

    /// Same as [`RetryExecutor::execute`], reporting how many attempts were made
    pub async fn run<F, Fut, T>(&self, mut func: F) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StreamError>>,
    {
        let mut attempts = 0;
        loop {
            if self.is_cancelled() {
                return Err(Exhausted {
                    error: StreamError::PoolCancelled,
                    attempts,
                });
            }

            attempts += 1;
            let outcome = match &self.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(StreamError::PoolCancelled),
                    result = func() => result,
                },
                None => func().await,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            // A failure caused by cancellation is never retried
            if self.is_cancelled() || matches!(error, StreamError::PoolCancelled) {
                return Err(Exhausted {
                    error: StreamError::PoolCancelled,
                    attempts,
                });
            }
            if !error.is_retryable() || attempts > self.config.max_retries {
                return Err(Exhausted { error, attempts });
            }

            let delay = self.config.delay_for(attempts);
            debug!("Attempt {} failed ({}), retrying in {:?}", attempts, error, delay);
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |t| t.is_cancelled())
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry configuration builder
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.config.initial_delay = initial_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.config.max_delay = max_delay;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.config.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Set jitter factor, clamped to 0.0..=1.0
    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.config.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
