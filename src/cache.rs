//! Response cache for dashboard read paths. Ingestion never reads from it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{env_u64, SyncConfig};
use crate::error::CacheError;
use crate::models::{DateRange, Provider};

const KEY_PREFIX: &str = "adpulse";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheCategory {
  Summary,
  Performance,
  CampaignList,
  AdGroupList,
  AdList,
}

impl CacheCategory {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheCategory::Summary => "summary",
      CacheCategory::Performance => "performance",
      CacheCategory::CampaignList => "campaigns",
      CacheCategory::AdGroupList => "adgroups",
      CacheCategory::AdList => "ads",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtls {
  pub summary: Duration,
  pub performance: Duration,
  pub campaign_list: Duration,
  pub ad_group_list: Duration,
  pub ad_list: Duration,
}

impl Default for CacheTtls {
  fn default() -> Self {
    Self {
      summary: Duration::from_secs(3_600),
      performance: Duration::from_secs(3_600),
      campaign_list: Duration::from_secs(7_200),
      ad_group_list: Duration::from_secs(7_200),
      ad_list: Duration::from_secs(7_200),
    }
  }
}

impl CacheTtls {
  pub fn from_env() -> Self {
    let d = CacheTtls::default();
    let secs = |key: &str, default: Duration| Duration::from_secs(env_u64(key, default.as_secs()).max(1));
    Self {
      summary: secs("CACHE_TTL_SUMMARY_SECS", d.summary),
      performance: secs("CACHE_TTL_PERFORMANCE_SECS", d.performance),
      campaign_list: secs("CACHE_TTL_CAMPAIGNS_SECS", d.campaign_list),
      ad_group_list: secs("CACHE_TTL_ADGROUPS_SECS", d.ad_group_list),
      ad_list: secs("CACHE_TTL_ADS_SECS", d.ad_list),
    }
  }

  pub fn ttl(&self, category: CacheCategory) -> Duration {
    match category {
      CacheCategory::Summary => self.summary,
      CacheCategory::Performance => self.performance,
      CacheCategory::CampaignList => self.campaign_list,
      CacheCategory::AdGroupList => self.ad_group_list,
      CacheCategory::AdList => self.ad_list,
    }
  }
}

/// Deterministic, scope-qualified key:
/// `adpulse:{category}:{user}:{provider}:{scope}:{since}:{until}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(
    category: CacheCategory,
    user_id: &str,
    provider: Provider,
    scope_id: &str,
    range: Option<DateRange>,
  ) -> Self {
    let (since, until) = match range {
      Some(r) => (r.since.to_string(), r.until.to_string()),
      None => ("all".to_string(), "all".to_string()),
    };
    Self(format!(
      "{KEY_PREFIX}:{}:{}:{}:{}:{since}:{until}",
      category.as_str(),
      sanitize(user_id),
      provider.as_str(),
      sanitize(scope_id),
    ))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

fn sanitize(part: &str) -> String {
  part.trim().replace(':', "_")
}

/// Stored value with its write time. Freshness is re-checked on read so a
/// backend that keeps entries past their TTL still never serves stale data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
  pub stored_at_ms: i64,
  pub ttl_secs: u64,
  pub value: T,
}

impl<T> CacheEnvelope<T> {
  pub fn is_fresh(&self, now_ms: i64) -> bool {
    let age_ms = now_ms.saturating_sub(self.stored_at_ms);
    age_ms >= 0 && (age_ms as u64) < self.ttl_secs.saturating_mul(1_000)
  }
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
  async fn get_raw(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

  async fn set_raw(&self, key: &CacheKey, value: String, ttl: Duration) -> Result<(), CacheError>;

  fn backend_name(&self) -> &'static str;
}

#[derive(Clone)]
pub struct RedisCache {
  conn: ConnectionManager,
}

impl RedisCache {
  pub async fn connect(url: &str) -> Result<Self, CacheError> {
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(Self { conn: manager })
  }
}

#[async_trait]
impl ResponseCache for RedisCache {
  async fn get_raw(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
    let mut conn = self.conn.clone();
    let value: Option<String> = redis::cmd("GET").arg(key.as_str()).query_async(&mut conn).await?;
    Ok(value)
  }

  async fn set_raw(&self, key: &CacheKey, value: String, ttl: Duration) -> Result<(), CacheError> {
    let mut conn = self.conn.clone();
    let () = redis::cmd("SET")
      .arg(key.as_str())
      .arg(value)
      .arg("EX")
      .arg(ttl.as_secs().max(1))
      .query_async(&mut conn)
      .await?;
    Ok(())
  }

  fn backend_name(&self) -> &'static str {
    "redis"
  }
}

/// Used when no cache backend is configured or reachable: every read misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
  async fn get_raw(&self, _key: &CacheKey) -> Result<Option<String>, CacheError> {
    Ok(None)
  }

  async fn set_raw(&self, _key: &CacheKey, _value: String, _ttl: Duration) -> Result<(), CacheError> {
    Ok(())
  }

  fn backend_name(&self) -> &'static str {
    "noop"
  }
}

/// Picks the backend once at startup. An unreachable Redis degrades to `NoopCache`.
pub async fn connect_cache(config: &SyncConfig) -> Arc<dyn ResponseCache> {
  let Some(url) = config.redis_url.as_deref() else {
    return Arc::new(NoopCache);
  };

  match tokio::time::timeout(CONNECT_TIMEOUT, RedisCache::connect(url)).await {
    Ok(Ok(cache)) => {
      tracing::info!(backend = "redis", "response cache connected");
      Arc::new(cache)
    }
    Ok(Err(err)) => {
      tracing::warn!(error = %err, "response cache unavailable, continuing without cache");
      Arc::new(NoopCache)
    }
    Err(_) => {
      tracing::warn!(timeout_ms = CONNECT_TIMEOUT.as_millis() as u64, "response cache connect timed out");
      Arc::new(NoopCache)
    }
  }
}

/// Read-through cache with per-category TTLs.
#[derive(Clone)]
pub struct ResponseCacheLayer {
  backend: Arc<dyn ResponseCache>,
  ttls: CacheTtls,
}

impl ResponseCacheLayer {
  pub fn new(backend: Arc<dyn ResponseCache>, ttls: CacheTtls) -> Self {
    Self { backend, ttls }
  }

  async fn read<T: DeserializeOwned>(&self, key: &CacheKey, now_ms: i64) -> Option<T> {
    let raw = match self.backend.get_raw(key).await {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(err) => {
        tracing::warn!(key = key.as_str(), backend = self.backend.backend_name(), error = %err, "cache read failed");
        return None;
      }
    };

    match serde_json::from_str::<CacheEnvelope<T>>(&raw) {
      Ok(envelope) if envelope.is_fresh(now_ms) => Some(envelope.value),
      Ok(_) => {
        tracing::debug!(key = key.as_str(), "cache entry stale");
        None
      }
      Err(err) => {
        tracing::warn!(key = key.as_str(), error = %err, "cache entry undecodable");
        None
      }
    }
  }

  async fn write<T: Serialize>(&self, key: &CacheKey, category: CacheCategory, value: &T, now_ms: i64) {
    let ttl = self.ttls.ttl(category);
    let envelope = CacheEnvelope {
      stored_at_ms: now_ms,
      ttl_secs: ttl.as_secs(),
      value,
    };
    let raw = match serde_json::to_string(&envelope) {
      Ok(raw) => raw,
      Err(err) => {
        tracing::warn!(key = key.as_str(), error = %CacheError::from(err), "cache entry not serializable");
        return;
      }
    };
    if let Err(err) = self.backend.set_raw(key, raw, ttl).await {
      tracing::warn!(key = key.as_str(), backend = self.backend.backend_name(), error = %err, "cache write failed");
    }
  }

  /// Returns the cached value when fresh, otherwise runs `load` and caches its
  /// result. Cache failures never fail the read.
  pub async fn cached_json<T, E, F, Fut>(
    &self,
    category: CacheCategory,
    key: &CacheKey,
    now_ms: i64,
    load: F,
  ) -> Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    if let Some(hit) = self.read::<T>(key, now_ms).await {
      return Ok(hit);
    }
    let value = load().await?;
    self.write(key, category, &value, now_ms).await;
    Ok(value)
  }
}
