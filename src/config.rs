use std::time::Duration;

use crate::cache::CacheTtls;
use crate::retry::RetryConfig;

pub const DEFAULT_META_GRAPH_BASE_URL: &str = "https://graph.facebook.com/";
pub const DEFAULT_META_GRAPH_VERSION: &str = "v19.0";
pub const DEFAULT_GA_DATA_BASE_URL: &str = "https://analyticsdata.googleapis.com/";
pub const DEFAULT_GA_ADMIN_BASE_URL: &str = "https://analyticsadmin.googleapis.com/";
pub const DEFAULT_GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
  pub client_id: String,
  pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub lookback_days: i64,
  pub chunk_days: i64,
  pub max_concurrency: usize,
  pub account_timeout: Duration,
  pub token_refresh_leeway: chrono::Duration,
  pub max_pages: usize,
  pub retry: RetryConfig,
  pub meta_graph_base_url: String,
  pub meta_graph_version: String,
  pub meta_app: Option<ProviderCredentials>,
  pub ga_data_base_url: String,
  pub ga_admin_base_url: String,
  pub google_token_url: String,
  pub google_app: Option<ProviderCredentials>,
  pub redis_url: Option<String>,
  pub cache_ttls: CacheTtls,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      lookback_days: 30,
      chunk_days: 30,
      max_concurrency: 4,
      account_timeout: Duration::from_secs(900),
      token_refresh_leeway: chrono::Duration::seconds(60),
      max_pages: 500,
      retry: RetryConfig::default(),
      meta_graph_base_url: DEFAULT_META_GRAPH_BASE_URL.to_string(),
      meta_graph_version: DEFAULT_META_GRAPH_VERSION.to_string(),
      meta_app: None,
      ga_data_base_url: DEFAULT_GA_DATA_BASE_URL.to_string(),
      ga_admin_base_url: DEFAULT_GA_ADMIN_BASE_URL.to_string(),
      google_token_url: DEFAULT_GOOGLE_TOKEN_URL.to_string(),
      google_app: None,
      redis_url: None,
      cache_ttls: CacheTtls::default(),
    }
  }
}

fn env_string(key: &str) -> Option<String> {
  std::env::var(key)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}

fn env_i64(key: &str, default: i64, min: i64, max: i64) -> i64 {
  env_string(key)
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
    .clamp(min, max)
}

fn credentials(id_key: &str, secret_key: &str) -> Option<ProviderCredentials> {
  Some(ProviderCredentials {
    client_id: env_string(id_key)?,
    client_secret: env_string(secret_key)?,
  })
}

impl SyncConfig {
  pub fn from_env() -> Self {
    let defaults = SyncConfig::default();

    let retry = RetryConfig::new(
      Duration::from_millis(env_i64("SYNC_RETRY_MIN_DELAY_MS", 1_000, 10, 60_000) as u64),
      Duration::from_millis(env_i64("SYNC_RETRY_MAX_DELAY_MS", 60_000, 100, 600_000) as u64),
      env_i64("SYNC_RETRY_MAX_ATTEMPTS", 5, 1, 20) as usize,
    );

    Self {
      lookback_days: env_i64("SYNC_LOOKBACK_DAYS", defaults.lookback_days, 1, 365),
      chunk_days: env_i64("SYNC_CHUNK_DAYS", defaults.chunk_days, 1, 90),
      max_concurrency: env_i64("SYNC_MAX_CONCURRENCY", 4, 1, 64) as usize,
      account_timeout: Duration::from_secs(env_i64("SYNC_ACCOUNT_TIMEOUT_SECS", 900, 30, 7_200) as u64),
      token_refresh_leeway: chrono::Duration::seconds(env_i64(
        "SYNC_TOKEN_REFRESH_LEEWAY_SECS",
        60,
        0,
        3_600,
      )),
      max_pages: env_i64("SYNC_MAX_PAGES", 500, 1, 10_000) as usize,
      retry,
      meta_graph_base_url: env_string("META_GRAPH_BASE_URL").unwrap_or(defaults.meta_graph_base_url),
      meta_graph_version: env_string("META_GRAPH_VERSION").unwrap_or(defaults.meta_graph_version),
      meta_app: credentials("META_APP_ID", "META_APP_SECRET"),
      ga_data_base_url: env_string("GA_DATA_BASE_URL").unwrap_or(defaults.ga_data_base_url),
      ga_admin_base_url: env_string("GA_ADMIN_BASE_URL").unwrap_or(defaults.ga_admin_base_url),
      google_token_url: env_string("GOOGLE_TOKEN_URL").unwrap_or(defaults.google_token_url),
      google_app: credentials("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET"),
      redis_url: env_string("REDIS_URL"),
      cache_ttls: CacheTtls::from_env(),
    }
  }
}

pub fn has_database_url() -> bool {
  env_string("TIDB_DATABASE_URL")
    .or_else(|| env_string("DATABASE_URL"))
    .is_some()
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
  env_string(key)
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let cfg = SyncConfig::default();
    assert_eq!(cfg.lookback_days, 30);
    assert_eq!(cfg.max_concurrency, 4);
    assert_eq!(cfg.account_timeout, Duration::from_secs(900));
    assert_eq!(cfg.retry.max_retries, 5);
    assert!(cfg.meta_app.is_none());
  }

  #[test]
  fn env_values_are_clamped() {
    std::env::set_var("SYNC_TEST_CLAMP", "100000");
    assert_eq!(env_i64("SYNC_TEST_CLAMP", 5, 1, 10), 10);
    std::env::set_var("SYNC_TEST_CLAMP", "nope");
    assert_eq!(env_i64("SYNC_TEST_CLAMP", 5, 1, 10), 5);
    std::env::remove_var("SYNC_TEST_CLAMP");
  }

  #[test]
  fn credentials_require_both_halves() {
    std::env::set_var("SYNC_TEST_ID", "id");
    std::env::remove_var("SYNC_TEST_SECRET");
    assert!(credentials("SYNC_TEST_ID", "SYNC_TEST_SECRET").is_none());
    std::env::set_var("SYNC_TEST_SECRET", "secret");
    let creds = credentials("SYNC_TEST_ID", "SYNC_TEST_SECRET").unwrap();
    assert_eq!(creds.client_id, "id");
    std::env::remove_var("SYNC_TEST_ID");
    std::env::remove_var("SYNC_TEST_SECRET");
  }
}
