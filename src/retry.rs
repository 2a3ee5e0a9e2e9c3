//! Bounded retry with a fixed backoff for transient failures.

use std::time::Duration;
use tracing::warn;

use crate::config::WorkerConfig;
use crate::error::{DedupError, Result};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.retries, config.retry_interval())
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or has
    /// failed transiently `max_retries + 1` times.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    warn!(
                        operation,
                        attempt,
                        remaining = self.max_retries + 1 - attempt,
                        error = %e,
                        "transient failure, retrying in {:?}",
                        self.backoff
                    );
                    std::thread::sleep(self.backoff);
                }
                Err(e) if e.is_transient() => {
                    return Err(DedupError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}
