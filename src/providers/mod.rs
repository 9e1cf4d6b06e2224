//! Provider API clients and the provider-agnostic records they emit.

pub mod google_analytics;
pub mod meta_ads;
pub mod oauth;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::error::ApiError;
use crate::models::{AccessToken, DateRange, Metrics, ScopeLevel};

/// Continuation for a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
  Offset(u64),
  Token(String),
}

#[derive(Debug, Clone)]
pub struct Page<T> {
  pub records: Vec<T>,
  pub next: Option<Cursor>,
}

impl<T> Page<T> {
  pub fn last(records: Vec<T>) -> Self {
    Self { records, next: None }
  }

  pub fn has_more(&self) -> bool {
    self.next.is_some()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
  pub external_id: String,
  pub parent_external_id: String,
  pub name: String,
  pub status: String,
  pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyMetricsRecord {
  pub dt: NaiveDate,
  pub metrics: Metrics,
  pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
  pub property_id: String,
  pub name: String,
  pub url: Option<String>,
  pub timezone: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Breakdown {
  TrafficSource,
  Device,
  Geography,
}

impl Breakdown {
  pub const ALL: [Breakdown; 3] = [Breakdown::TrafficSource, Breakdown::Device, Breakdown::Geography];

  pub fn key(&self) -> &'static str {
    match self {
      Breakdown::TrafficSource => "traffic_source",
      Breakdown::Device => "device",
      Breakdown::Geography => "geography",
    }
  }
}

/// One analytics report row. `dimension` is set for breakdown reports; `raw`
/// is the provider's row as returned.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsRow {
  pub dt: NaiveDate,
  pub dimension: Option<String>,
  pub metrics: Metrics,
  pub raw: Value,
}

/// Paid-ads platform: business → ad accounts → campaigns → ad groups → ads.
#[async_trait]
pub trait AdsPlatformApi: Send + Sync {
  async fn list_ad_accounts(
    &self,
    token: &AccessToken,
    business_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError>;

  async fn list_campaigns(
    &self,
    token: &AccessToken,
    ad_account_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError>;

  async fn list_ad_groups(
    &self,
    token: &AccessToken,
    campaign_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError>;

  async fn list_ads(
    &self,
    token: &AccessToken,
    ad_group_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError>;

  async fn fetch_insights(
    &self,
    token: &AccessToken,
    level: ScopeLevel,
    scope_id: &str,
    range: DateRange,
    cursor: Option<&Cursor>,
  ) -> Result<Page<DailyMetricsRecord>, ApiError>;
}

/// Web-analytics platform: properties and daily reports.
#[async_trait]
pub trait AnalyticsPlatformApi: Send + Sync {
  async fn list_properties(
    &self,
    token: &AccessToken,
    cursor: Option<&Cursor>,
  ) -> Result<Page<PropertyRecord>, ApiError>;

  async fn fetch_property(&self, token: &AccessToken, property_id: &str) -> Result<PropertyRecord, ApiError>;

  async fn run_report(
    &self,
    token: &AccessToken,
    property_id: &str,
    breakdown: Option<Breakdown>,
    range: DateRange,
    cursor: Option<&Cursor>,
  ) -> Result<Page<AnalyticsRow>, ApiError>;
}

/// Parses a provider number that may arrive as a JSON number or a string.
pub(crate) fn value_f64(v: &Value) -> Option<f64> {
  v.as_f64()
    .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
    .filter(|n| n.is_finite())
}

pub(crate) fn value_i64(v: &Value) -> Option<i64> {
  v.as_i64()
    .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
    .or_else(|| value_f64(v).map(|n| n.round() as i64))
}
