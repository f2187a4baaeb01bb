//! Retry with backoff for calls to the stream and checkpoint store

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None retries until cancelled)
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

/// Runs an operation until it succeeds, attempts run out, or `cancel` fires
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl RetryHandle<ExponentialBackoff> {
    pub fn from_config(config: RetryConfig) -> Self {
        let backoff = config.backoff();
        Self::new(config, backoff)
    }
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    pub async fn retry<F, Fut, T, E>(
        &mut self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Operation interrupted by cancellation");
                    return Err(RetryError::Interrupted);
                }
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => {
                    if self.attempts > 1 {
                        debug!(attempts = self.attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let Some(max) = self.config.max_retries {
                if self.attempts >= max {
                    warn!(
                        attempts = self.attempts,
                        error = %error,
                        "Maximum retry attempts exceeded"
                    );
                    return Err(RetryError::MaxRetriesExceeded(self.attempts, error.to_string()));
                }
            }

            let delay = self.backoff.next_delay(self.attempts - 1);
            warn!(
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying after delay"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Retry interrupted by cancellation");
                    return Err(RetryError::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
