//! Exponential backoff for storage calls.

use std::future::Future;
use std::time::Duration;
use tarlift_core::config::UploadConfig;
use tarlift_storage::StorageError;
use tokio_util::sync::CancellationToken;

/// How often and how patiently a storage call is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retry permanent errors too (used for the commit step).
    pub retry_all_errors: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            retry_all_errors: false,
        }
    }

    /// Policy for the final commit: `commit_retries` extra attempts on any error.
    pub fn for_commit(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.commit_retries,
            retry_all_errors: true,
            ..Self::from_config(config)
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    fn should_retry(&self, err: &StorageError) -> bool {
        self.retry_all_errors || err.is_transient()
    }
}

/// Terminal outcome of a retried call.
#[derive(Debug)]
pub enum RetryError {
    /// Every permitted attempt failed with a retryable error.
    Exhausted { attempts: u32, source: StorageError },
    /// The call failed with an error that is not worth retrying.
    Permanent { attempts: u32, source: StorageError },
    /// Cancellation was observed before an attempt or during a backoff sleep.
    Cancelled,
}

impl RetryError {
    /// Attempts made and the last error, unless the call was cancelled.
    pub fn into_parts(self) -> Option<(u32, StorageError)> {
        match self {
            Self::Exhausted { attempts, source } | Self::Permanent { attempts, source } => {
                Some((attempts, source))
            }
            Self::Cancelled => None,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of retries or is
/// cancelled. `on_retry` sees the retry number, the error and the delay.
pub async fn with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: R,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
    R: FnMut(u32, &StorageError, Duration),
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            return Err(RetryError::Permanent {
                attempts: attempt,
                source: err,
            });
        }
        if attempt > policy.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.delay_for(attempt);
        on_retry(attempt, &err, delay);

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
