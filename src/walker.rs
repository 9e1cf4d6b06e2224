//! Top-down extraction of one connected account.
//!
//! Ads: ad account → campaigns → ad groups → ads, with daily insights at every
//! level. Analytics: property → aggregate daily report → per-dimension
//! breakdowns merged into the same daily row.
//!
//! A child is only walked after its parent has been persisted. Failures below
//! an entity are recorded in the summary and its siblings continue; only
//! account-fatal errors (see [`SyncError::is_account_fatal`]) end the walk.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{ApiError, SyncError};
use crate::models::{
  AccessToken, Ad, AdGroup, Campaign, ConnectedAccount, DateRange, PerformanceRecord, Provider, ScopeLevel, Site,
};
use crate::persister::{Persister, UpsertCounts};
use crate::providers::{
  AdsPlatformApi, AnalyticsPlatformApi, Breakdown, Cursor, DailyMetricsRecord, EntityRecord, Page,
};
use crate::store::SyncStore;
use crate::token_manager::TokenManager;

pub struct SyncContext {
  pub store: Arc<dyn SyncStore>,
  pub ads: Arc<dyn AdsPlatformApi>,
  pub analytics: Arc<dyn AnalyticsPlatformApi>,
  pub tokens: Arc<TokenManager>,
  pub max_pages: usize,
  pub chunk_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRef {
  pub level: ScopeLevel,
  pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
  pub level: ScopeLevel,
  pub external_id: String,
  pub kind: &'static str,
  pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
  pub account_id: i64,
  pub provider: Provider,
  pub range: DateRange,
  pub ad_accounts: usize,
  pub entities: UpsertCounts,
  pub performance: UpsertCounts,
  /// Top-level entities (campaigns, sites) whose whole subtree synced.
  pub synced: Vec<EntityRef>,
  pub failures: Vec<EntityFailure>,
}

impl SyncSummary {
  fn new(account: &ConnectedAccount, range: DateRange) -> Self {
    Self {
      account_id: account.id,
      provider: account.provider,
      range,
      ad_accounts: 0,
      entities: UpsertCounts::default(),
      performance: UpsertCounts::default(),
      synced: Vec::new(),
      failures: Vec::new(),
    }
  }

  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }
}

/// API access for one account with a single refresh-and-retry on `Unauthorized`.
struct AccountSession<'a> {
  ctx: &'a SyncContext,
  account: &'a ConnectedAccount,
  token: AccessToken,
}

impl<'a> AccountSession<'a> {
  async fn call<T, F, Fut>(&mut self, op: F) -> Result<T, SyncError>
  where
    F: Fn(AccessToken) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    match op(self.token.clone()).await {
      Err(ApiError::Unauthorized(message)) => {
        tracing::warn!(
          account_id = self.account.id,
          provider = %self.account.provider,
          %message,
          "provider rejected access token, refreshing once"
        );
        self.token = self.ctx.tokens.force_refresh(self.account, &self.token).await?;
        Ok(op(self.token.clone()).await?)
      }
      other => Ok(other?),
    }
  }

  /// Follows cursors until the provider reports no further page.
  async fn collect_all<T, F, Fut>(&mut self, what: &str, fetch: F) -> Result<Vec<T>, SyncError>
  where
    F: Fn(AccessToken, Option<Cursor>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
  {
    let mut out = Vec::new();
    let mut cursor: Option<Cursor> = None;

    for _ in 0..self.ctx.max_pages {
      let current = cursor.clone();
      let page = self.call(|token| fetch(token, current.clone())).await?;
      out.extend(page.records);
      match page.next {
        None => return Ok(out),
        Some(next) if cursor.as_ref() == Some(&next) => {
          return Err(ApiError::provider(None, format!("{what}: pagination cursor did not advance")).into());
        }
        Some(next) => cursor = Some(next),
      }
    }

    Err(ApiError::provider(None, format!("{what}: more than {} pages", self.ctx.max_pages)).into())
  }
}

/// One level of the ads hierarchy that is listed from the provider.
#[derive(Clone, Copy, Debug)]
enum Listing {
  AdAccounts,
  Campaigns,
  AdGroups,
  Ads,
}

impl Listing {
  fn label(self) -> &'static str {
    match self {
      Listing::AdAccounts => "ad_accounts",
      Listing::Campaigns => "campaigns",
      Listing::AdGroups => "ad_groups",
      Listing::Ads => "ads",
    }
  }
}

struct Walk<'a> {
  session: AccountSession<'a>,
  persister: Persister,
  summary: SyncSummary,
  range: DateRange,
}

fn performance_record(
  level: ScopeLevel,
  scope_id: &str,
  source: Provider,
  row: DailyMetricsRecord,
) -> PerformanceRecord {
  PerformanceRecord {
    dt: row.dt,
    scope_level: level,
    scope_id: scope_id.to_string(),
    metrics: row.metrics,
    breakdowns: json!({}),
    raw: json!({ source.as_str(): row.raw }),
  }
}

impl<'a> Walk<'a> {
  fn account(&self) -> &'a ConnectedAccount {
    self.session.account
  }

  /// Records an entity-level failure, or hands back an account-fatal one.
  fn absorb(&mut self, level: ScopeLevel, external_id: &str, err: SyncError) -> Result<(), SyncError> {
    if err.is_account_fatal() {
      return Err(err);
    }
    tracing::warn!(
      account_id = self.account().id,
      provider = %self.account().provider,
      level = %level,
      external_id,
      kind = err.kind(),
      error = %err,
      "entity sync failed, continuing with siblings"
    );
    self.summary.failures.push(EntityFailure {
      level,
      external_id: external_id.to_string(),
      kind: err.kind(),
      error: err.to_string(),
    });
    Ok(())
  }

  async fn sync_ad_insights(&mut self, level: ScopeLevel, scope_id: &str) -> Result<(), SyncError> {
    let api = self.session.ctx.ads.clone();
    let api = api.as_ref();

    for chunk in self.range.chunks(self.session.ctx.chunk_days) {
      let rows = self
        .session
        .collect_all("insights", |token, cursor| async move {
          api.fetch_insights(&token, level, scope_id, chunk, cursor.as_ref()).await
        })
        .await?;

      for row in rows {
        let record = performance_record(level, scope_id, Provider::AdsPlatform, row);
        self.persister.upsert_performance(&record).await?;
      }
    }
    Ok(())
  }

  async fn list_entities(&mut self, listing: Listing, parent_id: &str) -> Result<Vec<EntityRecord>, SyncError> {
    let api = self.session.ctx.ads.clone();
    let api = api.as_ref();

    self
      .session
      .collect_all(listing.label(), |token, cursor| async move {
        match listing {
          Listing::AdAccounts => api.list_ad_accounts(&token, parent_id, cursor.as_ref()).await,
          Listing::Campaigns => api.list_campaigns(&token, parent_id, cursor.as_ref()).await,
          Listing::AdGroups => api.list_ad_groups(&token, parent_id, cursor.as_ref()).await,
          Listing::Ads => api.list_ads(&token, parent_id, cursor.as_ref()).await,
        }
      })
      .await
  }

  async fn walk_ads(&mut self) -> Result<(), SyncError> {
    let mut ad_account_ids = self.account().ad_account_ids();
    if ad_account_ids.is_empty() {
      let business_id = self.account().external_business_id.clone();
      match self.list_entities(Listing::AdAccounts, &business_id).await {
        Ok(found) => ad_account_ids = found.into_iter().map(|r| r.external_id).collect(),
        Err(err) => return self.absorb(ScopeLevel::Account, &business_id, err),
      }
    }

    self.summary.ad_accounts = ad_account_ids.len();
    for ad_account_id in &ad_account_ids {
      self.walk_ad_account(ad_account_id).await?;
    }
    Ok(())
  }

  async fn walk_ad_account(&mut self, ad_account_id: &str) -> Result<(), SyncError> {
    if let Err(err) = self.sync_ad_insights(ScopeLevel::Account, ad_account_id).await {
      self.absorb(ScopeLevel::Account, ad_account_id, err)?;
    }

    let campaigns = match self.list_entities(Listing::Campaigns, ad_account_id).await {
      Ok(campaigns) => campaigns,
      Err(err) => return self.absorb(ScopeLevel::Account, ad_account_id, err),
    };

    tracing::debug!(account_id = self.account().id, ad_account_id, campaigns = campaigns.len(), "campaigns listed");
    for record in campaigns {
      self.walk_campaign(ad_account_id, record).await?;
    }
    Ok(())
  }

  async fn walk_campaign(&mut self, ad_account_id: &str, record: EntityRecord) -> Result<(), SyncError> {
    let failures_before = self.summary.failures.len();
    let campaign = Campaign {
      external_id: record.external_id,
      ad_account_id: ad_account_id.to_string(),
      name: record.name,
      status: record.status,
      raw: record.raw,
    };
    let id = campaign.external_id.clone();

    if let Err(err) = self.persister.upsert_campaign(&campaign).await {
      return self.absorb(ScopeLevel::Campaign, &id, err.into());
    }
    if let Err(err) = self.sync_ad_insights(ScopeLevel::Campaign, &id).await {
      self.absorb(ScopeLevel::Campaign, &id, err)?;
    }

    match self.list_entities(Listing::AdGroups, &id).await {
      Ok(groups) => {
        for group in groups {
          self.walk_ad_group(&id, group).await?;
        }
      }
      Err(err) => self.absorb(ScopeLevel::Campaign, &id, err)?,
    }

    if self.summary.failures.len() == failures_before {
      self.summary.synced.push(EntityRef {
        level: ScopeLevel::Campaign,
        external_id: id,
      });
    }
    Ok(())
  }

  async fn walk_ad_group(&mut self, campaign_id: &str, record: EntityRecord) -> Result<(), SyncError> {
    let ad_group = AdGroup {
      external_id: record.external_id,
      campaign_external_id: campaign_id.to_string(),
      name: record.name,
      status: record.status,
      raw: record.raw,
    };
    let id = ad_group.external_id.clone();

    if let Err(err) = self.persister.upsert_ad_group(&ad_group).await {
      return self.absorb(ScopeLevel::AdGroup, &id, err.into());
    }
    if let Err(err) = self.sync_ad_insights(ScopeLevel::AdGroup, &id).await {
      self.absorb(ScopeLevel::AdGroup, &id, err)?;
    }

    let ads = match self.list_entities(Listing::Ads, &id).await {
      Ok(ads) => ads,
      Err(err) => return self.absorb(ScopeLevel::AdGroup, &id, err),
    };

    for record in ads {
      let ad = Ad {
        external_id: record.external_id,
        ad_group_external_id: id.clone(),
        name: record.name,
        status: record.status,
        raw: record.raw,
      };
      if let Err(err) = self.persister.upsert_ad(&ad).await {
        self.absorb(ScopeLevel::Ad, &ad.external_id, err.into())?;
        continue;
      }
      if let Err(err) = self.sync_ad_insights(ScopeLevel::Ad, &ad.external_id).await {
        self.absorb(ScopeLevel::Ad, &ad.external_id, err)?;
      }
    }
    Ok(())
  }

  async fn resolve_property(&mut self) -> Result<Option<String>, SyncError> {
    if let Some(id) = self.account().configured_property_id() {
      return Ok(Some(id));
    }
    let api = self.session.ctx.analytics.clone();
    let api = api.as_ref();
    let properties = self
      .session
      .collect_all("properties", |token, cursor| async move {
        api.list_properties(&token, cursor.as_ref()).await
      })
      .await?;
    Ok(properties.into_iter().next().map(|p| p.property_id))
  }

  async fn walk_analytics(&mut self) -> Result<(), SyncError> {
    let business_id = self.account().external_business_id.clone();
    let property_id = match self.resolve_property().await {
      Ok(Some(id)) => id,
      Ok(None) => {
        tracing::info!(account_id = self.account().id, "no analytics property available");
        return Ok(());
      }
      Err(err) => return self.absorb(ScopeLevel::Site, &business_id, err),
    };

    let api = self.session.ctx.analytics.clone();
    let api = api.as_ref();
    let pid = property_id.as_str();

    let property = match self
      .session
      .call(|token| async move { api.fetch_property(&token, pid).await })
      .await
    {
      Ok(p) => p,
      Err(err) => return self.absorb(ScopeLevel::Site, pid, err),
    };

    let site = Site {
      property_id: property.property_id.clone(),
      name: property.name,
      url: property.url,
      timezone: property.timezone,
    };
    if let Err(err) = self.persister.upsert_site(&site).await {
      return self.absorb(ScopeLevel::Site, pid, err.into());
    }

    let failures_before = self.summary.failures.len();
    if let Err(err) = self.sync_site_report(pid).await {
      self.absorb(ScopeLevel::Site, pid, err)?;
    }
    for breakdown in Breakdown::ALL {
      if let Err(err) = self.sync_site_breakdown(pid, breakdown).await {
        self.absorb(ScopeLevel::Site, &format!("{pid}:{}", breakdown.key()), err)?;
      }
    }

    if self.summary.failures.len() == failures_before {
      self.summary.synced.push(EntityRef {
        level: ScopeLevel::Site,
        external_id: property_id.clone(),
      });
    }
    Ok(())
  }

  async fn sync_site_report(&mut self, property_id: &str) -> Result<(), SyncError> {
    let api = self.session.ctx.analytics.clone();
    let api = api.as_ref();

    for chunk in self.range.chunks(self.session.ctx.chunk_days) {
      let rows = self
        .session
        .collect_all("report", |token, cursor| async move {
          api.run_report(&token, property_id, None, chunk, cursor.as_ref()).await
        })
        .await?;

      for row in rows {
        let record = PerformanceRecord {
          dt: row.dt,
          scope_level: ScopeLevel::Site,
          scope_id: property_id.to_string(),
          metrics: row.metrics,
          breakdowns: json!({}),
          raw: json!({ Provider::AnalyticsPlatform.as_str(): row.raw }),
        };
        self.persister.upsert_performance(&record).await?;
      }
    }
    Ok(())
  }

  /// Replaces this dimension's breakdown in each date's site row.
  async fn sync_site_breakdown(&mut self, property_id: &str, breakdown: Breakdown) -> Result<(), SyncError> {
    let api = self.session.ctx.analytics.clone();
    let api = api.as_ref();

    for chunk in self.range.chunks(self.session.ctx.chunk_days) {
      let rows = self
        .session
        .collect_all(breakdown.key(), |token, cursor| async move {
          api
            .run_report(&token, property_id, Some(breakdown), chunk, cursor.as_ref())
            .await
        })
        .await?;

      let mut by_date: BTreeMap<_, Map<String, Value>> = BTreeMap::new();
      for row in rows {
        let dimension = row.dimension.unwrap_or_else(|| "(not set)".to_string());
        let metrics = serde_json::to_value(&row.metrics).unwrap_or_else(|_| json!({}));
        by_date.entry(row.dt).or_default().insert(dimension, metrics);
      }

      for (dt, values) in by_date {
        let record = PerformanceRecord {
          dt,
          scope_level: ScopeLevel::Site,
          scope_id: property_id.to_string(),
          metrics: Default::default(),
          breakdowns: json!({ breakdown.key(): Value::Object(values) }),
          raw: json!({}),
        };
        self.persister.merge_site_breakdowns(&record).await?;
      }
    }
    Ok(())
  }
}

/// Walks one account over `range`. Returns `Err` only for account-fatal
/// failures; everything else is reported in the summary.
pub async fn sync_account(
  ctx: &SyncContext,
  account: &ConnectedAccount,
  range: DateRange,
) -> Result<SyncSummary, SyncError> {
  let token = ctx.tokens.ensure_valid_token(account).await?;

  let mut walk = Walk {
    session: AccountSession { ctx, account, token },
    persister: Persister::new(ctx.store.clone(), account.id),
    summary: SyncSummary::new(account, range),
    range,
  };

  tracing::info!(account_id = account.id, provider = %account.provider, %range, "account sync started");

  match account.provider {
    Provider::AdsPlatform => walk.walk_ads().await?,
    Provider::AnalyticsPlatform => walk.walk_analytics().await?,
  }

  let Walk {
    persister, mut summary, ..
  } = walk;
  summary.entities = persister.entities;
  summary.performance = persister.performance;

  tracing::info!(
    account_id = account.id,
    provider = %account.provider,
    inserted = summary.entities.inserted + summary.performance.inserted,
    updated = summary.entities.updated + summary.performance.updated,
    unchanged = summary.entities.unchanged + summary.performance.unchanged,
    failures = summary.failures.len(),
    "account sync finished"
  );
  Ok(summary)
}

#[cfg(test)]
pub(crate) mod testing {
  use std::collections::{HashMap, HashSet};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  use async_trait::async_trait;
  use serde_json::json;

  use crate::error::ApiError;
  use crate::models::{AccessToken, DateRange, Metrics, ScopeLevel};
  use crate::providers::{
    AdsPlatformApi, AnalyticsPlatformApi, AnalyticsRow, Breakdown, Cursor, DailyMetricsRecord, EntityRecord, Page,
    PropertyRecord,
  };

  /// Ads platform with a fixed hierarchy, served one child per page.
  #[derive(Default)]
  pub struct FakeAds {
    pub discovered_ad_accounts: Vec<String>,
    pub children: HashMap<String, Vec<String>>,
    pub fail_children_of: HashSet<String>,
    pub throttle_children_of: HashSet<String>,
    pub panic_children_of: HashSet<String>,
    pub reject_token: Mutex<Option<String>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
  }

  impl FakeAds {
    pub fn with_tree(edges: &[(&str, &[&str])]) -> Self {
      let mut children = HashMap::new();
      for (parent, kids) in edges {
        children.insert(parent.to_string(), kids.iter().map(|k| k.to_string()).collect());
      }
      Self {
        children,
        ..Default::default()
      }
    }

    async fn enter(&self, token: &AccessToken) -> Result<(), ApiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let rejected = self.reject_token.lock().unwrap().clone();
      if rejected.as_deref() == Some(token.secret()) {
        return Err(ApiError::Unauthorized("Error validating access token".to_string()));
      }
      Ok(())
    }

    async fn page_of(
      &self,
      token: &AccessToken,
      parent: &str,
      cursor: Option<&Cursor>,
    ) -> Result<Page<EntityRecord>, ApiError> {
      self.enter(token).await?;
      if self.fail_children_of.contains(parent) {
        return Err(ApiError::provider(Some(500), format!("children of {parent} unavailable")));
      }
      if self.panic_children_of.contains(parent) {
        panic!("malformed listing for {parent}");
      }
      if self.throttle_children_of.contains(parent) {
        return Err(ApiError::RateLimited {
          attempts: 5,
          message: "User request limit reached".to_string(),
        });
      }
      let kids = self.children.get(parent).cloned().unwrap_or_default();
      let idx = match cursor {
        Some(Cursor::Offset(n)) => *n as usize,
        _ => 0,
      };
      let records = kids
        .get(idx)
        .map(|id| {
          vec![EntityRecord {
            external_id: id.clone(),
            parent_external_id: parent.to_string(),
            name: format!("{id} name"),
            status: "active".to_string(),
            raw: json!({"id": id}),
          }]
        })
        .unwrap_or_default();
      let next = (idx + 1 < kids.len()).then(|| Cursor::Offset(idx as u64 + 1));
      Ok(Page { records, next })
    }
  }

  #[async_trait]
  impl AdsPlatformApi for FakeAds {
    async fn list_ad_accounts(
      &self,
      token: &AccessToken,
      _business_id: &str,
      _cursor: Option<&Cursor>,
    ) -> Result<Page<EntityRecord>, ApiError> {
      self.enter(token).await?;
      Ok(Page::last(
        self
          .discovered_ad_accounts
          .iter()
          .map(|id| EntityRecord {
            external_id: id.clone(),
            parent_external_id: String::new(),
            name: id.clone(),
            status: "active".to_string(),
            raw: json!({}),
          })
          .collect(),
      ))
    }

    async fn list_campaigns(
      &self,
      token: &AccessToken,
      ad_account_id: &str,
      cursor: Option<&Cursor>,
    ) -> Result<Page<EntityRecord>, ApiError> {
      self.page_of(token, ad_account_id, cursor).await
    }

    async fn list_ad_groups(
      &self,
      token: &AccessToken,
      campaign_id: &str,
      cursor: Option<&Cursor>,
    ) -> Result<Page<EntityRecord>, ApiError> {
      self.page_of(token, campaign_id, cursor).await
    }

    async fn list_ads(
      &self,
      token: &AccessToken,
      ad_group_id: &str,
      cursor: Option<&Cursor>,
    ) -> Result<Page<EntityRecord>, ApiError> {
      self.page_of(token, ad_group_id, cursor).await
    }

    async fn fetch_insights(
      &self,
      token: &AccessToken,
      level: ScopeLevel,
      scope_id: &str,
      range: DateRange,
      _cursor: Option<&Cursor>,
    ) -> Result<Page<DailyMetricsRecord>, ApiError> {
      self.enter(token).await?;
      Ok(Page::last(
        range
          .days()
          .map(|dt| DailyMetricsRecord {
            dt,
            metrics: Metrics {
              impressions: Some(1_000),
              clicks: Some(25),
              spend: Some(12.5),
              ctr: Some(0.025),
              ..Default::default()
            },
            raw: json!({"level": level.as_str(), "id": scope_id, "date_start": dt.to_string()}),
          })
          .collect(),
      ))
    }
  }

  #[derive(Default)]
  pub struct FakeAnalytics {
    pub properties: Vec<PropertyRecord>,
    pub fail_breakdown: Option<Breakdown>,
    pub calls: AtomicUsize,
  }

  #[async_trait]
  impl AnalyticsPlatformApi for FakeAnalytics {
    async fn list_properties(
      &self,
      _token: &AccessToken,
      _cursor: Option<&Cursor>,
    ) -> Result<Page<PropertyRecord>, ApiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(Page::last(self.properties.clone()))
    }

    async fn fetch_property(&self, _token: &AccessToken, property_id: &str) -> Result<PropertyRecord, ApiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(PropertyRecord {
        property_id: property_id.to_string(),
        name: format!("Property {property_id}"),
        url: Some("https://shop.example".to_string()),
        timezone: Some("UTC".to_string()),
      })
    }

    async fn run_report(
      &self,
      _token: &AccessToken,
      _property_id: &str,
      breakdown: Option<Breakdown>,
      range: DateRange,
      _cursor: Option<&Cursor>,
    ) -> Result<Page<AnalyticsRow>, ApiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if breakdown.is_some() && breakdown == self.fail_breakdown {
        return Err(ApiError::provider(Some(400), "dimension not available"));
      }
      let dims: &[&str] = match breakdown {
        None => &[""],
        Some(Breakdown::TrafficSource) => &["google", "newsletter"],
        Some(Breakdown::Device) => &["mobile", "desktop"],
        Some(Breakdown::Geography) => &["DE", "US"],
      };
      let mut rows = Vec::new();
      for dt in range.days() {
        for dim in dims {
          rows.push(AnalyticsRow {
            dt,
            dimension: breakdown.map(|_| dim.to_string()),
            metrics: Metrics {
              sessions: Some(if breakdown.is_some() { 5 } else { 10 }),
              users: Some(if breakdown.is_some() { 3 } else { 7 }),
              bounce_rate: breakdown.is_none().then_some(0.4),
              ..Default::default()
            },
            raw: json!({"date": dt.format("%Y%m%d").to_string(), "dimension": dim}),
          });
        }
      }
      Ok(Page::last(rows))
    }
  }
}
