// src/retry/strategy.rs

use crate::config::{BackoffKind, RetryConfig};
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Delay to wait before retry number `attempt` (1-based).
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// base * 2^(attempt - 1), capped at `max`, plus up to 25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let max = self.max.as_millis() as u64;

        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(max);
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }
}

/// Attempt budget, status classification and backoff for forwarding.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_server_errors: bool,
    retryable_status_codes: Vec<u16>,
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let backoff: Arc<dyn Backoff> = match config.backoff {
            BackoffKind::Fixed => Arc::new(FixedBackoff::new(config.retry_delay())),
            BackoffKind::Exponential { max_delay_ms } => Arc::new(ExponentialBackoff::new(
                config.retry_delay(),
                Duration::from_millis(max_delay_ms),
            )),
        };

        Self {
            max_retries: config.max_retries,
            retry_server_errors: config.retry_server_errors,
            retryable_status_codes: config.retryable_status_codes.clone(),
            backoff,
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts allowed for one forwarded request.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        (self.retry_server_errors && status.is_server_error())
            || self.retryable_status_codes.contains(&status.as_u16())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_server_errors", &self.retry_server_errors)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .finish_non_exhaustive()
    }
}
