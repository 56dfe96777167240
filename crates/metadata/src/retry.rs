//! Retry executor for serializable units of work.
//!
//! A unit of work opens, uses and commits its own transaction. When the store
//! reports a serialization failure the attempt's transaction has already been
//! rolled back, so the executor simply runs the closure again. Blob store
//! calls never belong inside a unit of work: they would repeat per attempt.

use crate::error::{MetadataError, MetadataResult};
use cabinet_core::config::EngineConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Base pause between attempts; attempt `n` waits `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Hook for counting retries (metrics live outside this crate).
pub trait RetryObserver: Send + Sync {
    /// An attempt failed with a serialization conflict and will be re-run.
    fn on_retry(&self, _operation: &'static str, _attempt: u32) {}

    /// The final attempt failed with a serialization conflict.
    fn on_exhausted(&self, _operation: &'static str, _attempts: u32) {}
}

/// Re-runs units of work on serialization failure, up to a fixed bound.
#[derive(Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    attempt_timeout: Duration,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            observer: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry_max_attempts, config.metadata_timeout())
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `work` until it succeeds, fails with a non-retryable error, or
    /// exhausts the attempt bound.
    ///
    /// Each attempt is bounded by the attempt timeout. A timeout is not
    /// retried: the caller learns of it as [`MetadataError::Timeout`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut work: F) -> MetadataResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MetadataResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, work()).await {
                Ok(result) => result,
                Err(_) => Err(MetadataError::Timeout(format!(
                    "{operation} attempt {attempt} exceeded {}ms",
                    self.attempt_timeout.as_millis()
                ))),
            };

            match result {
                Err(err) if err.is_serialization_failure() => {
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "serializable transaction retries exhausted"
                        );
                        if let Some(observer) = &self.observer {
                            observer.on_exhausted(operation, attempt);
                        }
                        return Err(MetadataError::RetriesExhausted {
                            operation,
                            attempts: attempt,
                        });
                    }

                    tracing::warn!(
                        operation,
                        attempt,
                        error = %err,
                        "serialization failure, retrying transaction"
                    );
                    if let Some(observer) = &self.observer {
                        observer.on_retry(operation, attempt);
                    }
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }
    }
}
