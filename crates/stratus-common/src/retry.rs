//! Retry utilities with exponential backoff and jitter.
//!
//! Cloud APIs throttle and drop connections. Every connector call is wrapped
//! with [`retry_with_backoff`] at the connector boundary; nothing above that
//! boundary loops on failure.
//!
//! # Example
//!
//! ```ignore
//! use stratus_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let instance = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "create_instance",
//!     || async { connector.create_instance(&request).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// A config that never retries
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries up to `max_attempts` (or forever if 0) until success.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but only retries errors accepted by `should_retry`.
///
/// A rejected error is returned immediately without sleeping.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Retry only errors that [`Error::is_retryable`] accepts.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    retry_if(config, operation_name, operation, Error::is_retryable).await
}
