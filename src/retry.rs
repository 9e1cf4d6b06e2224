//! Backoff for throttled provider calls.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub min_delay: Duration,
  pub max_delay: Duration,
  /// Retries after the first attempt.
  pub max_retries: usize,
  pub with_jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      min_delay: Duration::from_millis(1_000),
      max_delay: Duration::from_millis(60_000),
      max_retries: 5,
      with_jitter: true,
    }
  }
}

impl RetryConfig {
  pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
    Self {
      min_delay,
      max_delay: max_delay.max(min_delay),
      max_retries,
      with_jitter: true,
    }
  }

  #[must_use]
  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.with_jitter = jitter;
    self
  }

  pub fn into_backoff(self) -> ExponentialBuilder {
    let mut builder = ExponentialBuilder::default()
      .with_min_delay(self.min_delay)
      .with_max_delay(self.max_delay)
      .with_max_times(self.max_retries);

    if self.with_jitter {
      builder = builder.with_jitter();
    }

    builder
  }
}

/// Runs `operation`, retrying only while it reports `ApiError::RateLimited`.
///
/// The final `RateLimited` error carries the total number of attempts made.
/// `Unauthorized` and `Provider` errors are returned immediately.
pub async fn retry_rate_limited<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, ApiError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ApiError>>,
{
  let attempts = AtomicUsize::new(0);

  let result = (|| {
    attempts.fetch_add(1, Ordering::Relaxed);
    operation()
  })
  .retry(config.clone().into_backoff())
  .when(|err: &ApiError| matches!(err, ApiError::RateLimited { .. }))
  .notify(|err: &ApiError, delay: Duration| {
    tracing::warn!(
      call = label,
      attempt = attempts.load(Ordering::Relaxed),
      delay_ms = delay.as_millis() as u64,
      error = %err,
      "provider throttled request, backing off"
    );
  })
  .await;

  match result {
    Err(ApiError::RateLimited { message, .. }) => Err(ApiError::RateLimited {
      attempts: attempts.load(Ordering::Relaxed),
      message,
    }),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  fn fast() -> RetryConfig {
    RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 3).with_jitter(false)
  }

  #[tokio::test]
  async fn retries_throttled_calls_until_success() {
    let calls = AtomicU32::new(0);
    let out = retry_rate_limited(&fast(), "test", || async {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      if n < 2 {
        Err(ApiError::RateLimited {
          attempts: 1,
          message: "slow down".to_string(),
        })
      } else {
        Ok(42)
      }
    })
    .await
    .unwrap();

    assert_eq!(out, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_after_bounded_attempts() {
    let calls = AtomicU32::new(0);
    let err = retry_rate_limited(&fast(), "test", || async {
      calls.fetch_add(1, Ordering::SeqCst);
      Err::<(), _>(ApiError::RateLimited {
        attempts: 1,
        message: "slow down".to_string(),
      })
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match err {
      ApiError::RateLimited { attempts, .. } => assert_eq!(attempts, 4),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn does_not_retry_unauthorized() {
    let calls = AtomicU32::new(0);
    let err = retry_rate_limited(&fast(), "test", || async {
      calls.fetch_add(1, Ordering::SeqCst);
      Err::<(), _>(ApiError::Unauthorized("expired".to_string()))
    })
    .await
    .unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
