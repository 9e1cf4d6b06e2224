use std::time::Duration;

use thiserror::Error;

/// Failure from an upstream provider call, after local retries.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("rate limited after {attempts} attempts: {message}")]
  RateLimited { attempts: usize, message: String },

  #[error("unauthorized: {0}")]
  Unauthorized(String),

  #[error("provider error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
  Provider { status: Option<u16>, message: String },
}

impl ApiError {
  pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
    ApiError::Provider {
      status,
      message: message.into(),
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, ApiError::Unauthorized(_))
  }
}

#[derive(Debug, Error)]
pub enum TokenError {
  /// Refresh is impossible; a human has to reconnect the account.
  #[error("reauthorization required: {0}")]
  ReauthRequired(String),

  #[error("token refresh failed: {0}")]
  RefreshFailed(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("constraint violation: {0}")]
  ConstraintViolation(String),

  #[error("database error: {0}")]
  Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
  fn from(err: sqlx::Error) -> Self {
    let is_constraint = err.as_database_error().is_some_and(|e| {
      e.is_unique_violation()
        || e.is_check_violation()
        || e.is_foreign_key_violation()
        // SQLSTATE class 23: integrity constraint (NOT NULL included)
        || e.code().is_some_and(|code| code.starts_with("23"))
    });
    if is_constraint {
      return StoreError::ConstraintViolation(err.to_string());
    }
    StoreError::Database(err)
  }
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache backend error: {0}")]
  Backend(#[from] redis::RedisError),

  #[error("cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Account- or run-level failure.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Token(#[from] TokenError),

  #[error(transparent)]
  Api(#[from] ApiError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("account sync exceeded deadline of {0:?}")]
  Timeout(Duration),

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// Stable label used in run reports.
  pub fn kind(&self) -> &'static str {
    match self {
      SyncError::Token(TokenError::ReauthRequired(_)) => "reauth_required",
      SyncError::Token(TokenError::RefreshFailed(_)) => "refresh_failed",
      SyncError::Token(TokenError::Store(_)) => "store_error",
      SyncError::Api(ApiError::RateLimited { .. }) => "rate_limited",
      SyncError::Api(ApiError::Unauthorized(_)) => "unauthorized",
      SyncError::Api(ApiError::Provider { .. }) => "provider_error",
      SyncError::Store(StoreError::ConstraintViolation(_)) => "constraint_violation",
      SyncError::Store(StoreError::Database(_)) => "store_error",
      SyncError::Timeout(_) => "timeout",
      SyncError::Config(_) => "config_error",
    }
  }

  /// Whether the failure must stop the whole account pipeline instead of
  /// being recorded against a single entity.
  pub fn is_account_fatal(&self) -> bool {
    match self {
      SyncError::Token(_) => true,
      SyncError::Api(ApiError::RateLimited { .. }) | SyncError::Api(ApiError::Unauthorized(_)) => true,
      SyncError::Api(ApiError::Provider { .. }) => false,
      SyncError::Store(StoreError::Database(_)) => true,
      SyncError::Store(StoreError::ConstraintViolation(_)) => false,
      SyncError::Timeout(_) | SyncError::Config(_) => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn entity_level_errors_are_not_account_fatal() {
    let provider = SyncError::from(ApiError::provider(Some(500), "boom"));
    assert!(!provider.is_account_fatal());
    assert_eq!(provider.kind(), "provider_error");

    let constraint = SyncError::from(StoreError::ConstraintViolation("empty id".to_string()));
    assert!(!constraint.is_account_fatal());
  }

  #[test]
  fn token_and_throttle_errors_abort_the_account() {
    let reauth = SyncError::from(TokenError::ReauthRequired("revoked".to_string()));
    assert!(reauth.is_account_fatal());
    assert_eq!(reauth.kind(), "reauth_required");

    let throttled = SyncError::from(ApiError::RateLimited {
      attempts: 5,
      message: "slow down".to_string(),
    });
    assert!(throttled.is_account_fatal());
    assert_eq!(throttled.kind(), "rate_limited");
  }

  #[test]
  fn provider_error_display_includes_status() {
    let err = ApiError::provider(Some(503), "unavailable");
    assert_eq!(err.to_string(), "provider error (status 503): unavailable");
    let err = ApiError::provider(None, "bad json");
    assert_eq!(err.to_string(), "provider error: bad json");
  }
}
