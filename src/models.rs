use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
  AdsPlatform,
  AnalyticsPlatform,
}

impl Provider {
  pub fn as_str(&self) -> &'static str {
    match self {
      Provider::AdsPlatform => "ads_platform",
      Provider::AnalyticsPlatform => "analytics_platform",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim() {
      "ads_platform" | "ads" | "meta" => Some(Provider::AdsPlatform),
      "analytics_platform" | "analytics" | "ga4" => Some(Provider::AnalyticsPlatform),
      _ => None,
    }
  }
}

impl fmt::Display for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Bearer token for outbound API calls. Formatting never reveals the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  pub fn secret(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for AccessToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("AccessToken([redacted])")
  }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken(String);

impl RefreshToken {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  pub fn secret(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for RefreshToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("RefreshToken([redacted])")
  }
}

#[derive(Debug, Clone)]
pub struct ConnectedAccount {
  pub id: i64,
  pub user_id: String,
  pub provider: Provider,
  pub external_business_id: String,
  pub display_name: String,
  pub access_token: AccessToken,
  pub refresh_token: Option<RefreshToken>,
  pub expires_at: Option<DateTime<Utc>>,
  pub connected: bool,
  pub metadata: Value,
  pub last_synced_at: Option<DateTime<Utc>>,
}

impl ConnectedAccount {
  /// Ad account ids selected for this business, in metadata order.
  pub fn ad_account_ids(&self) -> Vec<String> {
    self
      .metadata
      .get("ad_account_ids")
      .and_then(|v| v.as_array())
      .map(|ids| {
        ids
          .iter()
          .filter_map(|v| v.as_str())
          .map(str::trim)
          .filter(|v| !v.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn configured_property_id(&self) -> Option<String> {
    self
      .metadata
      .get("property_id")
      .and_then(|v| v.as_str())
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .map(str::to_string)
  }

  pub fn token_is_fresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
    self.expires_at.map(|t| t - leeway > now).unwrap_or(false)
  }
}

/// Token material returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
  pub access_token: AccessToken,
  pub refresh_token: Option<RefreshToken>,
  pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
  Account,
  Campaign,
  AdGroup,
  Ad,
  Site,
}

impl ScopeLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      ScopeLevel::Account => "account",
      ScopeLevel::Campaign => "campaign",
      ScopeLevel::AdGroup => "adgroup",
      ScopeLevel::Ad => "ad",
      ScopeLevel::Site => "site",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim() {
      "account" => Some(ScopeLevel::Account),
      "campaign" => Some(ScopeLevel::Campaign),
      "adgroup" => Some(ScopeLevel::AdGroup),
      "ad" => Some(ScopeLevel::Ad),
      "site" => Some(ScopeLevel::Site),
      _ => None,
    }
  }
}

impl fmt::Display for ScopeLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
  pub external_id: String,
  pub ad_account_id: String,
  pub name: String,
  pub status: String,
  pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdGroup {
  pub external_id: String,
  pub campaign_external_id: String,
  pub name: String,
  pub status: String,
  pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
  pub external_id: String,
  pub ad_group_external_id: String,
  pub name: String,
  pub status: String,
  pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
  pub property_id: String,
  pub name: String,
  pub url: Option<String>,
  pub timezone: Option<String>,
}

/// Canonical metric set. Units: `spend`/`cpc` in major currency units,
/// `ctr`/`bounce_rate` as fractions, durations in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub impressions: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub clicks: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub spend: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reach: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub conversions: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ctr: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpc: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sessions: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub users: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_users: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_views: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bounce_rate: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub avg_session_duration_secs: Option<f64>,
}

impl Metrics {
  pub fn counters(&self) -> [(&'static str, Option<i64>); 7] {
    [
      ("impressions", self.impressions),
      ("clicks", self.clicks),
      ("reach", self.reach),
      ("sessions", self.sessions),
      ("users", self.users),
      ("new_users", self.new_users),
      ("page_views", self.page_views),
    ]
  }

  pub fn ratios(&self) -> [(&'static str, Option<f64>); 6] {
    [
      ("spend", self.spend),
      ("conversions", self.conversions),
      ("ctr", self.ctr),
      ("cpc", self.cpc),
      ("bounce_rate", self.bounce_rate),
      ("avg_session_duration_secs", self.avg_session_duration_secs),
    ]
  }
}

/// One row of the fact table. `breakdowns` maps a dimension key
/// (`traffic_source`, `device`, `geography`) to per-value metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
  pub dt: NaiveDate,
  pub scope_level: ScopeLevel,
  pub scope_id: String,
  pub metrics: Metrics,
  pub breakdowns: Value,
  pub raw: Value,
}

impl PerformanceRecord {
  /// A resync of the same natural key. Metrics and `raw` are replaced
  /// wholesale, so a metric the provider stopped reporting goes back to null.
  /// Stored breakdown dimensions survive unless `fresh` carries the same key.
  pub fn apply_resync(&mut self, fresh: &PerformanceRecord) {
    self.metrics = fresh.metrics.clone();
    self.raw = fresh.raw.clone();
    self.apply_breakdowns(fresh);
  }

  /// Replaces each breakdown dimension present in `partial`. Metrics and
  /// `raw` are left alone.
  pub fn apply_breakdowns(&mut self, partial: &PerformanceRecord) {
    let Value::Object(incoming) = &partial.breakdowns else {
      return;
    };
    if !self.breakdowns.is_object() {
      self.breakdowns = Value::Object(Default::default());
    }
    if let Value::Object(stored) = &mut self.breakdowns {
      for (dimension, values) in incoming {
        stored.insert(dimension.clone(), values.clone());
      }
    }
  }
}

/// Inclusive day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
  pub since: NaiveDate,
  pub until: NaiveDate,
}

impl DateRange {
  pub fn new(since: NaiveDate, until: NaiveDate) -> Option<Self> {
    if since > until {
      return None;
    }
    Some(Self { since, until })
  }

  /// The most recent complete day (yesterday relative to `today`) back `days` days.
  pub fn trailing_days(today: NaiveDate, days: i64) -> Self {
    let days = days.clamp(1, 365);
    let until = today - Duration::days(1);
    let since = until - Duration::days(days - 1);
    Self { since, until }
  }

  pub fn num_days(&self) -> i64 {
    (self.until - self.since).num_days() + 1
  }

  pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
    let since = self.since;
    (0..self.num_days()).map(move |i| since + Duration::days(i))
  }

  /// Splits into consecutive windows of at most `chunk_days`, oldest first.
  pub fn chunks(&self, chunk_days: i64) -> Vec<DateRange> {
    let chunk_days = chunk_days.clamp(1, 365);
    let mut out = Vec::new();
    let mut start = self.since;
    while start <= self.until {
      let end = (start + Duration::days(chunk_days - 1)).min(self.until);
      out.push(DateRange { since: start, until: end });
      start = end + Duration::days(1);
    }
    out
  }
}

impl fmt::Display for DateRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}", self.since, self.until)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  #[test]
  fn trailing_days_ends_on_last_complete_day() {
    let range = DateRange::trailing_days(d(2024, 3, 1), 30);
    assert_eq!(range.until, d(2024, 2, 29));
    assert_eq!(range.since, d(2024, 1, 31));
    assert_eq!(range.num_days(), 30);
  }

  #[test]
  fn chunks_cover_range_without_gaps() {
    let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 10)).unwrap();
    let chunks = range.chunks(4);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], DateRange::new(d(2024, 1, 1), d(2024, 1, 4)).unwrap());
    assert_eq!(chunks[2], DateRange::new(d(2024, 1, 9), d(2024, 1, 10)).unwrap());
    let total: i64 = chunks.iter().map(|c| c.num_days()).sum();
    assert_eq!(total, range.num_days());
  }

  #[test]
  fn rejects_inverted_range() {
    assert!(DateRange::new(d(2024, 1, 2), d(2024, 1, 1)).is_none());
  }

  #[test]
  fn token_debug_is_redacted() {
    let token = AccessToken::new("super-secret");
    assert!(!format!("{token:?}").contains("super-secret"));
    let refresh = RefreshToken::new("also-secret");
    assert!(!format!("{refresh:?}").contains("also-secret"));
  }

  fn perf(metrics: Metrics, breakdowns: serde_json::Value, raw: serde_json::Value) -> PerformanceRecord {
    PerformanceRecord {
      dt: d(2024, 1, 1),
      scope_level: ScopeLevel::Ad,
      scope_id: "A1".to_string(),
      metrics,
      breakdowns,
      raw,
    }
  }

  #[test]
  fn resync_drops_metrics_the_provider_stopped_reporting() {
    let mut stored = perf(
      Metrics {
        impressions: Some(100),
        conversions: Some(3.0),
        ..Default::default()
      },
      serde_json::json!({}),
      serde_json::json!({"ads_platform": {"impressions": "100", "actions": [{"action_type": "purchase", "value": "3"}]}}),
    );
    let fresh = perf(
      Metrics {
        impressions: Some(120),
        ..Default::default()
      },
      serde_json::json!({}),
      serde_json::json!({"ads_platform": {"impressions": "120"}}),
    );
    stored.apply_resync(&fresh);
    assert_eq!(stored.metrics.impressions, Some(120));
    assert_eq!(stored.metrics.conversions, None);
    assert!(stored.raw["ads_platform"].get("actions").is_none());
  }

  #[test]
  fn breakdowns_replace_whole_dimensions_and_keep_others() {
    let mut stored = perf(
      Metrics {
        sessions: Some(10),
        ..Default::default()
      },
      serde_json::json!({"device": {"mobile": {"sessions": 3}, "tablet": {"sessions": 1}}, "geography": {"US": {"sessions": 10}}}),
      serde_json::json!({"analytics_platform": {"rowCount": 1}}),
    );
    stored.apply_breakdowns(&perf(
      Metrics::default(),
      serde_json::json!({"device": {"desktop": {"sessions": 5}}}),
      serde_json::json!({}),
    ));
    assert_eq!(stored.metrics.sessions, Some(10));
    assert_eq!(stored.raw["analytics_platform"]["rowCount"], 1);
    assert_eq!(stored.breakdowns["device"]["desktop"]["sessions"], 5);
    assert!(stored.breakdowns["device"].get("mobile").is_none());
    assert_eq!(stored.breakdowns["geography"]["US"]["sessions"], 10);

    stored.apply_resync(&perf(Metrics::default(), serde_json::json!({}), serde_json::json!({})));
    assert_eq!(stored.breakdowns["device"]["desktop"]["sessions"], 5);
    assert_eq!(stored.metrics.sessions, None);
  }

  #[test]
  fn reads_ad_account_ids_from_metadata() {
    let account = ConnectedAccount {
      id: 1,
      user_id: "u1".to_string(),
      provider: Provider::AdsPlatform,
      external_business_id: "b1".to_string(),
      display_name: "Biz".to_string(),
      access_token: AccessToken::new("t"),
      refresh_token: None,
      expires_at: None,
      connected: true,
      metadata: serde_json::json!({"ad_account_ids": ["act_1", " ", "act_2"]}),
      last_synced_at: None,
    };
    assert_eq!(account.ad_account_ids(), vec!["act_1", "act_2"]);
    assert_eq!(account.configured_property_id(), None);
  }
}
