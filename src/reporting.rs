//! Cached read paths over synced data, for the dashboard query layer.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheCategory, CacheKey, ResponseCacheLayer};
use crate::error::StoreError;
use crate::models::{Ad, AdGroup, Campaign, ConnectedAccount, DateRange, Metrics, PerformanceRecord, Provider, ScopeLevel};
use crate::store::SyncStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
  pub account_id: i64,
  pub provider: Provider,
  pub range: DateRange,
  pub days_with_data: usize,
  pub totals: Metrics,
}

/// Sums account-level (or site-level) daily rows and derives ratios from the sums.
pub fn summarize(account: &ConnectedAccount, range: DateRange, rows: &[PerformanceRecord]) -> AccountSummary {
  fn add_i(acc: &mut Option<i64>, v: Option<i64>) {
    if let Some(v) = v {
      *acc = Some(acc.unwrap_or(0) + v);
    }
  }
  fn add_f(acc: &mut Option<f64>, v: Option<f64>) {
    if let Some(v) = v {
      *acc = Some(acc.unwrap_or(0.0) + v);
    }
  }

  let mut totals = Metrics::default();
  let mut bounce_weighted = 0.0;
  let mut duration_weighted = 0.0;

  for row in rows {
    let m = &row.metrics;
    add_i(&mut totals.impressions, m.impressions);
    add_i(&mut totals.clicks, m.clicks);
    add_f(&mut totals.spend, m.spend);
    add_i(&mut totals.reach, m.reach);
    add_f(&mut totals.conversions, m.conversions);
    add_i(&mut totals.sessions, m.sessions);
    add_i(&mut totals.users, m.users);
    add_i(&mut totals.new_users, m.new_users);
    add_i(&mut totals.page_views, m.page_views);

    let sessions = m.sessions.unwrap_or(0) as f64;
    bounce_weighted += m.bounce_rate.unwrap_or(0.0) * sessions;
    duration_weighted += m.avg_session_duration_secs.unwrap_or(0.0) * sessions;
  }

  if let (Some(clicks), Some(impressions)) = (totals.clicks, totals.impressions) {
    if impressions > 0 {
      totals.ctr = Some(clicks as f64 / impressions as f64);
    }
  }
  if let (Some(spend), Some(clicks)) = (totals.spend, totals.clicks) {
    if clicks > 0 {
      totals.cpc = Some(spend / clicks as f64);
    }
  }
  if let Some(sessions) = totals.sessions.filter(|s| *s > 0) {
    totals.bounce_rate = Some(bounce_weighted / sessions as f64);
    totals.avg_session_duration_secs = Some(duration_weighted / sessions as f64);
  }

  AccountSummary {
    account_id: account.id,
    provider: account.provider,
    range,
    days_with_data: rows.iter().map(|r| r.dt).collect::<BTreeSet<_>>().len(),
    totals,
  }
}

/// Read-through access to stored hierarchy and performance data. Entries are
/// keyed per user, provider and connected account.
pub struct ReportingService {
  store: Arc<dyn SyncStore>,
  cache: ResponseCacheLayer,
}

impl ReportingService {
  pub fn new(store: Arc<dyn SyncStore>, cache: ResponseCacheLayer) -> Self {
    Self { store, cache }
  }

  fn key(
    category: CacheCategory,
    account: &ConnectedAccount,
    scope: &str,
    range: Option<DateRange>,
  ) -> CacheKey {
    CacheKey::new(
      category,
      &account.user_id,
      account.provider,
      &format!("{}/{scope}", account.id),
      range,
    )
  }

  pub async fn account_summary(
    &self,
    account: &ConnectedAccount,
    range: DateRange,
    now_ms: i64,
  ) -> Result<AccountSummary, StoreError> {
    let level = match account.provider {
      Provider::AdsPlatform => ScopeLevel::Account,
      Provider::AnalyticsPlatform => ScopeLevel::Site,
    };
    let key = Self::key(CacheCategory::Summary, account, level.as_str(), Some(range));
    self
      .cache
      .cached_json(CacheCategory::Summary, &key, now_ms, || async {
        let rows = self.store.list_performance(account.id, level, None, range).await?;
        Ok::<_, StoreError>(summarize(account, range, &rows))
      })
      .await
  }

  pub async fn performance(
    &self,
    account: &ConnectedAccount,
    level: ScopeLevel,
    scope_id: Option<&str>,
    range: DateRange,
    now_ms: i64,
  ) -> Result<Vec<PerformanceRecord>, StoreError> {
    let scope = format!("{}/{}", level.as_str(), scope_id.unwrap_or("*"));
    let key = Self::key(CacheCategory::Performance, account, &scope, Some(range));
    self
      .cache
      .cached_json(CacheCategory::Performance, &key, now_ms, || {
        self.store.list_performance(account.id, level, scope_id, range)
      })
      .await
  }

  pub async fn campaigns(&self, account: &ConnectedAccount, now_ms: i64) -> Result<Vec<Campaign>, StoreError> {
    let key = Self::key(CacheCategory::CampaignList, account, "campaigns", None);
    self
      .cache
      .cached_json(CacheCategory::CampaignList, &key, now_ms, || {
        self.store.list_campaigns(account.id)
      })
      .await
  }

  pub async fn ad_groups(
    &self,
    account: &ConnectedAccount,
    campaign_id: &str,
    now_ms: i64,
  ) -> Result<Vec<AdGroup>, StoreError> {
    let key = Self::key(CacheCategory::AdGroupList, account, campaign_id, None);
    self
      .cache
      .cached_json(CacheCategory::AdGroupList, &key, now_ms, || {
        self.store.list_ad_groups(account.id, campaign_id)
      })
      .await
  }

  pub async fn ads(&self, account: &ConnectedAccount, ad_group_id: &str, now_ms: i64) -> Result<Vec<Ad>, StoreError> {
    let key = Self::key(CacheCategory::AdList, account, ad_group_id, None);
    self
      .cache
      .cached_json(CacheCategory::AdList, &key, now_ms, || {
        self.store.list_ads(account.id, ad_group_id)
      })
      .await
  }
}
