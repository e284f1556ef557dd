//! Concurrency governor: bounded, FIFO-fair lanes for remote calls.
//!
//! Each lane wraps a semaphore. A call holds one permit for the duration of
//! a single attempt; waiting callers are released in arrival order. Transient
//! failures are retried with exponential backoff, without holding a permit
//! while sleeping.

use crate::config::{ConcurrencyConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Create exponential backoff from config.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_randomization_factor(if config.jitter { 0.5 } else { 0.0 })
        .with_max_elapsed_time(Some(Duration::from_secs(300)))
        .build()
}

/// One bounded lane of remote calls.
#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    limit: usize,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl ConcurrencyGovernor {
    /// Create a lane allowing `limit` concurrent calls.
    pub fn new(name: &'static str, limit: usize, retry: RetryConfig, metrics: Arc<Metrics>) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            retry,
            metrics,
        }
    }

    /// Lane name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `call` under this lane, retrying transient failures.
    ///
    /// `call` is invoked once per attempt. Non-retryable errors are returned
    /// immediately; retryable ones are retried up to `max_retries` times and
    /// then surface as [`Error::RetryExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = create_backoff(&self.retry);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::config(format!("{} lane closed", self.name)))?;
                call().await
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt > self.retry.max_retries {
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    message: format!("{} {}", self.name, operation),
                    last_error: Some(Box::new(err)),
                });
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    message: format!("{} {} (backoff elapsed)", self.name, operation),
                    last_error: Some(Box::new(err)),
                });
            };

            warn!(
                lane = self.name,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying transient failure"
            );
            self.metrics.record_retry();
            tokio::time::sleep(delay).await;
            debug!(lane = self.name, operation, "retry attempt {}", attempt + 1);
        }
    }

    /// Run `call` once under this lane, without retrying.
    ///
    /// For writes that are not idempotent: a transient failure may hide a
    /// committed write, so a second attempt could duplicate it.
    pub async fn run_once<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::config(format!("{} lane closed", self.name)))?;
        call().await.inspect_err(|e| {
            if e.is_retryable() {
                warn!(lane = self.name, operation, error = %e, "transient failure; not retried");
            }
        })
    }
}

/// The three call-site lanes a connection uses.
#[derive(Debug, Clone)]
pub struct GovernorSet {
    /// describe / describe_global / identity
    pub describe: ConcurrencyGovernor,
    /// query / count
    pub query: ConcurrencyGovernor,
    /// upsert / insert
    pub upsert: ConcurrencyGovernor,
}

impl GovernorSet {
    /// Build lanes from config.
    pub fn new(limits: &ConcurrencyConfig, retry: &RetryConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            describe: ConcurrencyGovernor::new("describe", limits.describe, retry.clone(), metrics.clone()),
            query: ConcurrencyGovernor::new("query", limits.query, retry.clone(), metrics.clone()),
            upsert: ConcurrencyGovernor::new("upsert", limits.upsert, retry.clone(), metrics),
        }
    }
}
