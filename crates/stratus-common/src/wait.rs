//! Bounded polling
//!
//! Waiting for an instance to become active or for a control plane to come
//! up never blocks forever: every wait has an interval and a ceiling, and
//! running past the ceiling is an [`Error::Timeout`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Default poll interval for cloud waits
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Default ceiling for cloud waits
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Interval and ceiling for a polling loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between checks
    pub interval: Duration,
    /// Total time allowed before giving up
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: RETRY_INTERVAL,
            timeout: RETRY_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Build a config from explicit durations
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Poll `check` until it yields `Some`, an error, or the timeout elapses.
///
/// The first check runs immediately. Errors from `check` end the wait; a
/// check that wants to tolerate a transient error should map it to `None`.
pub async fn poll_until<T, F, Fut>(config: PollConfig, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let waited = start.elapsed();
        if waited >= config.timeout {
            return Err(Error::timeout(what, waited));
        }

        debug!(waiting_for = %what, attempt, "Condition not met yet");
        let remaining = config.timeout - waited;
        tokio::time::sleep(config.interval.min(remaining)).await;
    }
}
