//! Retry logic with exponential backoff and jitter for transient errors.

use crate::config::RetryConfig;
use crate::error::{Error, ProviderError};
use rand::Rng;
use std::fmt;
use std::thread;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: fmt::Display {
    /// Whether this error is transient.
    fn is_retryable(&self) -> bool;

    /// Minimum wait the source asked for, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Provider { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    fn retry_after(&self) -> Option<Duration> {
        ProviderError::retry_after(self)
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is being retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &dyn fmt::Display, delay: Duration);
}

/// Callback that logs each retry as a warning.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &dyn fmt::Display, delay: Duration) {
        log::warn!(
            "Attempt {attempt}/{max_attempts} failed: {error}. Retrying in {}ms...",
            delay.as_millis()
        );
    }
}

/// Delay before retry number `attempt` (0-indexed), with random jitter.
///
/// The exponential delay is scaled by a uniform factor in
/// `[1 - jitter, 1 + jitter]` and then capped at `max_delay`, so processes
/// that failed together do not retry together.
pub fn jittered_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_for_attempt(attempt).as_secs_f64();
    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
    } else {
        1.0
    };
    let capped = (base * factor).min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

/// Execute an operation, retrying retryable errors with jittered backoff.
///
/// Non-retryable errors are returned immediately. At most
/// `config.max_attempts` calls are made. A `retry_after` hint from the error
/// raises the delay but never lowers it.
pub fn with_retry<T, E, F>(
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt >= max_attempts {
                    return Err(e);
                }

                let mut delay = jittered_delay(config, attempt - 1);
                if let Some(hint) = e.retry_after() {
                    delay = delay.max(hint);
                }
                if let Some(cb) = callback {
                    cb.on_retry(attempt, max_attempts, &e, delay);
                }
                thread::sleep(delay);
            }
        }
    }
}
