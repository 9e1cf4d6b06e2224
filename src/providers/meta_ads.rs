use async_trait::async_trait;
use chrono::NaiveDate;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::http_client::{encode_query_value, send, HttpResponse};
use crate::models::{AccessToken, DateRange, Metrics, ScopeLevel};
use crate::providers::{value_f64, value_i64, AdsPlatformApi, Cursor, DailyMetricsRecord, EntityRecord, Page};
use crate::retry::{retry_rate_limited, RetryConfig};

const PAGE_SIZE: u32 = 100;

const INSIGHT_FIELDS: &str = "date_start,impressions,clicks,spend,reach,ctr,cpc,actions";

/// Error codes the Graph API uses for throttling (app, user, account and ads-management limits).
const THROTTLE_CODES: [i64; 4] = [4, 17, 32, 613];
const THROTTLE_CODE_RANGE: std::ops::RangeInclusive<i64> = 80000..=80014;
const INVALID_TOKEN_CODE: i64 = 190;

const CONVERSION_ACTION_TYPES: [&str; 3] = ["purchase", "lead", "complete_registration"];

#[derive(Debug, Clone)]
pub struct MetaAdsClient {
  base_url: String,
  version: String,
  retry: RetryConfig,
}

impl MetaAdsClient {
  pub fn new(config: &SyncConfig) -> Self {
    Self::with_base_url(&config.meta_graph_base_url, &config.meta_graph_version, config.retry.clone())
  }

  pub fn with_base_url(base_url: &str, version: &str, retry: RetryConfig) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      version: version.trim_matches('/').to_string(),
      retry,
    }
  }

  fn edge_url(&self, node_id: &str, edge: &str, params: &[(&str, String)], cursor: Option<&Cursor>) -> String {
    let mut url = format!("{}/{}/{}/{}?limit={PAGE_SIZE}", self.base_url, self.version, node_id.trim(), edge);
    for (k, v) in params {
      url.push('&');
      url.push_str(k);
      url.push('=');
      url.push_str(&encode_query_value(v));
    }
    if let Some(Cursor::Token(after)) = cursor {
      url.push_str("&after=");
      url.push_str(&encode_query_value(after));
    }
    url
  }

  async fn get_page(&self, token: &AccessToken, label: &str, url: &str) -> Result<(Vec<Value>, Option<Cursor>), ApiError> {
    let json = retry_rate_limited(&self.retry, label, || async {
      let resp = send(Method::GET, url, Some(token.secret()), None).await?;
      classify_response(&resp)
    })
    .await?;
    Ok(parse_list_page(&json))
  }

  async fn list_entities(
    &self,
    token: &AccessToken,
    label: &str,
    parent_id: &str,
    edge: &str,
    fields: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError> {
    let url = self.edge_url(parent_id, edge, &[("fields", fields.to_string())], cursor);
    let (items, next) = self.get_page(token, label, &url).await?;
    let records = items
      .iter()
      .filter_map(|item| parse_entity(item, parent_id))
      .collect();
    Ok(Page { records, next })
  }
}

/// Maps a Graph API response onto the shared error taxonomy.
fn classify_response(resp: &HttpResponse) -> Result<Value, ApiError> {
  if resp.status.is_success() {
    return resp.json();
  }

  let parsed: Option<Value> = serde_json::from_slice(&resp.body).ok();
  let error = parsed.as_ref().and_then(|v| v.get("error"));
  let code = error.and_then(|e| e.get("code")).and_then(|c| c.as_i64());
  let message = error
    .and_then(|e| e.get("message"))
    .and_then(|m| m.as_str())
    .map(str::to_string)
    .unwrap_or_else(|| resp.body_snippet(300));

  let throttled = resp.status == StatusCode::TOO_MANY_REQUESTS
    || code.is_some_and(|c| THROTTLE_CODES.contains(&c) || THROTTLE_CODE_RANGE.contains(&c));
  if throttled {
    return Err(ApiError::RateLimited { attempts: 1, message });
  }

  if resp.status == StatusCode::UNAUTHORIZED || code == Some(INVALID_TOKEN_CODE) {
    return Err(ApiError::Unauthorized(message));
  }

  Err(ApiError::provider(Some(resp.status.as_u16()), message))
}

fn parse_list_page(json: &Value) -> (Vec<Value>, Option<Cursor>) {
  let items = json
    .get("data")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default();

  // `paging.next` is only present when another page exists; the cursor alone is not enough.
  let paging = json.get("paging");
  let has_next = paging
    .and_then(|p| p.get("next"))
    .and_then(|v| v.as_str())
    .is_some_and(|s| !s.is_empty());
  let next = if has_next {
    paging
      .and_then(|p| p.get("cursors"))
      .and_then(|c| c.get("after"))
      .and_then(|v| v.as_str())
      .filter(|s| !s.is_empty())
      .map(|s| Cursor::Token(s.to_string()))
  } else {
    None
  };

  (items, next)
}

fn normalize_status(item: &Value) -> String {
  if let Some(status) = item
    .get("effective_status")
    .or_else(|| item.get("status"))
    .and_then(|v| v.as_str())
  {
    return status.trim().to_ascii_lowercase();
  }

  // Ad accounts report a numeric `account_status`.
  match item.get("account_status").and_then(value_i64) {
    Some(1) => "active",
    Some(2) => "disabled",
    Some(3) => "unsettled",
    Some(7) => "pending_risk_review",
    Some(101) => "closed",
    _ => "unknown",
  }
  .to_string()
}

fn parse_entity(item: &Value, parent_id: &str) -> Option<EntityRecord> {
  let external_id = item.get("id").and_then(|v| v.as_str())?.trim().to_string();
  if external_id.is_empty() {
    return None;
  }

  let parent_external_id = ["adset_id", "campaign_id"]
    .iter()
    .find_map(|k| item.get(*k).and_then(|v| v.as_str()))
    .unwrap_or(parent_id)
    .to_string();

  let name = item
    .get("name")
    .and_then(|v| v.as_str())
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .unwrap_or(&external_id)
    .to_string();

  Some(EntityRecord {
    status: normalize_status(item),
    external_id,
    parent_external_id,
    name,
    raw: item.clone(),
  })
}

fn sum_conversions(actions: &Value) -> Option<f64> {
  let actions = actions.as_array()?;
  let total: f64 = actions
    .iter()
    .filter(|a| {
      a.get("action_type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| CONVERSION_ACTION_TYPES.contains(&t))
    })
    .filter_map(|a| a.get("value").and_then(value_f64))
    .sum();
  Some(total)
}

/// Converts one insights row to canonical units: `spend`/`cpc` are already major
/// currency units (sent as strings), `ctr` arrives as a percentage.
fn parse_insight_row(item: &Value) -> Option<DailyMetricsRecord> {
  let dt = item
    .get("date_start")
    .and_then(|v| v.as_str())
    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;

  let metrics = Metrics {
    impressions: item.get("impressions").and_then(value_i64),
    clicks: item.get("clicks").and_then(value_i64),
    spend: item.get("spend").and_then(value_f64),
    reach: item.get("reach").and_then(value_i64),
    conversions: item.get("actions").and_then(sum_conversions),
    ctr: item.get("ctr").and_then(value_f64).map(|pct| pct / 100.0),
    cpc: item.get("cpc").and_then(value_f64),
    ..Default::default()
  };

  Some(DailyMetricsRecord {
    dt,
    metrics,
    raw: item.clone(),
  })
}

fn insights_level(level: ScopeLevel) -> &'static str {
  match level {
    ScopeLevel::Account | ScopeLevel::Site => "account",
    ScopeLevel::Campaign => "campaign",
    ScopeLevel::AdGroup => "adset",
    ScopeLevel::Ad => "ad",
  }
}

#[async_trait]
impl AdsPlatformApi for MetaAdsClient {
  async fn list_ad_accounts(
    &self,
    token: &AccessToken,
    business_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError> {
    self
      .list_entities(token, "meta.ad_accounts", business_id, "owned_ad_accounts", "id,name,account_status,currency", cursor)
      .await
  }

  async fn list_campaigns(
    &self,
    token: &AccessToken,
    ad_account_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError> {
    self
      .list_entities(token, "meta.campaigns", ad_account_id, "campaigns", "id,name,status,effective_status,objective", cursor)
      .await
  }

  async fn list_ad_groups(
    &self,
    token: &AccessToken,
    campaign_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError> {
    self
      .list_entities(token, "meta.adsets", campaign_id, "adsets", "id,name,status,effective_status,campaign_id", cursor)
      .await
  }

  async fn list_ads(
    &self,
    token: &AccessToken,
    ad_group_id: &str,
    cursor: Option<&Cursor>,
  ) -> Result<Page<EntityRecord>, ApiError> {
    self
      .list_entities(token, "meta.ads", ad_group_id, "ads", "id,name,status,effective_status,adset_id", cursor)
      .await
  }

  async fn fetch_insights(
    &self,
    token: &AccessToken,
    level: ScopeLevel,
    scope_id: &str,
    range: DateRange,
    cursor: Option<&Cursor>,
  ) -> Result<Page<DailyMetricsRecord>, ApiError> {
    let time_range = json!({
      "since": range.since.format("%Y-%m-%d").to_string(),
      "until": range.until.format("%Y-%m-%d").to_string(),
    })
    .to_string();

    let url = self.edge_url(
      scope_id,
      "insights",
      &[
        ("level", insights_level(level).to_string()),
        ("fields", INSIGHT_FIELDS.to_string()),
        ("time_range", time_range),
        ("time_increment", "1".to_string()),
      ],
      cursor,
    );

    let (items, next) = self.get_page(token, "meta.insights", &url).await?;
    let records = items.iter().filter_map(parse_insight_row).collect();
    Ok(Page { records, next })
  }
}
