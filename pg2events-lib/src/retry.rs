//! Connection retry logic with exponential backoff
//!
//! Every connection attempt failure is treated as transient until the backoff
//! policy gives up.

use crate::config::Config;
use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::future::retry;
use backoff::{Error as BackoffError, ExponentialBackoff};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Configuration for retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_duration: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_duration: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl From<&Config> for RetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
            multiplier: config.retry_multiplier,
            max_duration: config.max_retry_duration,
            jitter: config.retry_jitter,
        }
    }
}

impl RetryConfig {
    /// Create an exponential backoff policy from retry configuration
    pub fn to_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: if self.jitter { 0.3 } else { 0.0 },
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: Some(self.max_duration),
            ..Default::default()
        };

        backoff.reset();
        backoff
    }
}

/// Runs `open` until it succeeds, the attempts run out or the backoff gives up
pub async fn connect_with_retry<T, F, Fut>(config: &RetryConfig, target: &str, mut open: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    info!("Connecting to {} with retry logic", target);

    let operation = || {
        attempt += 1;
        let current = attempt;
        let fut = open();
        async move {
            debug!("Connection attempt {} to {}", current, target);
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if current >= max_attempts => {
                    error!("Giving up on {} after {} attempts: {}", target, current, e);
                    Err(BackoffError::Permanent(e))
                }
                Err(e) => {
                    warn!("Transient connection error on {}: {}", target, e);
                    Err(BackoffError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
            }
        }
    };

    let result = retry(config.to_backoff(), operation).await;

    let elapsed = start_time.elapsed();
    match &result {
        Ok(_) => info!("Connected to {} after {:?}", target, elapsed),
        Err(e) => error!("Connection to {} failed after {:?}: {}", target, elapsed, e),
    }
    result
}
