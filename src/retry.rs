//! One retry policy shared by the model client and screen capture.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{CaptureError, ModelServiceError};

/// Errors that know whether another attempt is worthwhile.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ModelServiceError {
    fn is_transient(&self) -> bool {
        ModelServiceError::is_transient(self)
    }
}

impl Transient for CaptureError {
    fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Unavailable(_) | CaptureError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 25% random spread to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Runs every operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let spread = if self.jitter {
            capped * 0.25 * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_millis((capped + spread) as u64).min(self.max_delay)
    }

    /// Retries transient failures with backoff. The last error is returned
    /// once attempts run out; permanent errors return immediately.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("[retry] {} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        "[retry] {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
