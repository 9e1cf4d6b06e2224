use async_trait::async_trait;
use chrono::NaiveDate;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::http_client::{encode_query_value, send, HttpResponse};
use crate::models::{AccessToken, DateRange, Metrics};
use crate::providers::{value_f64, value_i64, AnalyticsPlatformApi, AnalyticsRow, Breakdown, Cursor, Page, PropertyRecord};
use crate::retry::{retry_rate_limited, RetryConfig};

const REPORT_PAGE_SIZE: u64 = 1_000;
const SUMMARY_PAGE_SIZE: u32 = 200;

const REPORT_METRICS: [&str; 7] = [
  "sessions",
  "totalUsers",
  "newUsers",
  "screenPageViews",
  "bounceRate",
  "averageSessionDuration",
  "conversions",
];

const BREAKDOWN_METRICS: [&str; 3] = ["sessions", "totalUsers", "conversions"];

#[derive(Debug, Clone)]
pub struct GoogleAnalyticsClient {
  data_base_url: String,
  admin_base_url: String,
  retry: RetryConfig,
}

fn property_path(property_id: &str) -> String {
  let id = property_id.trim();
  let id = id.strip_prefix("properties/").unwrap_or(id);
  format!("properties/{id}")
}

fn bare_property_id(name: &str) -> String {
  name.trim().trim_start_matches("properties/").to_string()
}

fn breakdown_dimension(breakdown: Breakdown) -> &'static str {
  match breakdown {
    Breakdown::TrafficSource => "sessionSource",
    Breakdown::Device => "deviceCategory",
    Breakdown::Geography => "country",
  }
}

impl GoogleAnalyticsClient {
  pub fn new(config: &SyncConfig) -> Self {
    Self::with_base_urls(&config.ga_data_base_url, &config.ga_admin_base_url, config.retry.clone())
  }

  pub fn with_base_urls(data_base_url: &str, admin_base_url: &str, retry: RetryConfig) -> Self {
    Self {
      data_base_url: data_base_url.trim_end_matches('/').to_string(),
      admin_base_url: admin_base_url.trim_end_matches('/').to_string(),
      retry,
    }
  }

  async fn call(&self, token: &AccessToken, label: &str, method: Method, url: &str, body: Option<&Value>) -> Result<Value, ApiError> {
    retry_rate_limited(&self.retry, label, || async {
      let resp = send(method.clone(), url, Some(token.secret()), body).await?;
      classify_response(&resp)
    })
    .await
  }
}

fn classify_response(resp: &HttpResponse) -> Result<Value, ApiError> {
  if resp.status.is_success() {
    return resp.json();
  }

  let parsed: Option<Value> = serde_json::from_slice(&resp.body).ok();
  let error = parsed.as_ref().and_then(|v| v.get("error"));
  let grpc_status = error.and_then(|e| e.get("status")).and_then(|s| s.as_str()).unwrap_or("");
  let message = error
    .and_then(|e| e.get("message"))
    .and_then(|m| m.as_str())
    .map(str::to_string)
    .unwrap_or_else(|| resp.body_snippet(300));

  if resp.status == StatusCode::TOO_MANY_REQUESTS || grpc_status == "RESOURCE_EXHAUSTED" {
    return Err(ApiError::RateLimited { attempts: 1, message });
  }
  if resp.status == StatusCode::UNAUTHORIZED || grpc_status == "UNAUTHENTICATED" {
    return Err(ApiError::Unauthorized(message));
  }
  Err(ApiError::provider(Some(resp.status.as_u16()), message))
}

fn build_report_body(breakdown: Option<Breakdown>, range: DateRange, offset: u64) -> Value {
  let mut dimensions = vec![json!({"name": "date"})];
  let metric_names: &[&str] = match breakdown {
    Some(b) => {
      dimensions.push(json!({"name": breakdown_dimension(b)}));
      &BREAKDOWN_METRICS
    }
    None => &REPORT_METRICS,
  };

  json!({
    "dateRanges": [{
      "startDate": range.since.format("%Y-%m-%d").to_string(),
      "endDate": range.until.format("%Y-%m-%d").to_string(),
    }],
    "dimensions": dimensions,
    "metrics": metric_names.iter().map(|m| json!({"name": m})).collect::<Vec<_>>(),
    "orderBys": [{"dimension": {"dimensionName": "date"}}],
    "limit": REPORT_PAGE_SIZE,
    "offset": offset,
    "keepEmptyRows": false,
  })
}

fn header_names(json: &Value, key: &str) -> Vec<String> {
  json
    .get(key)
    .and_then(|v| v.as_array())
    .map(|headers| {
      headers
        .iter()
        .map(|h| h.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string())
        .collect()
    })
    .unwrap_or_default()
}

fn cell<'a>(row: &'a Value, key: &str, idx: usize) -> Option<&'a Value> {
  row.get(key)?.as_array()?.get(idx)?.get("value")
}

/// Parses a runReport response. Dates arrive as `YYYYMMDD`; `bounceRate` is
/// already a fraction and `averageSessionDuration` is in seconds.
fn parse_report_rows(json: &Value) -> Vec<AnalyticsRow> {
  let dims = header_names(json, "dimensionHeaders");
  let metrics = header_names(json, "metricHeaders");

  let idx_date = match dims.iter().position(|n| n == "date") {
    Some(i) => i,
    None => return vec![],
  };
  let idx_dimension = dims.iter().position(|n| n != "date");
  let metric_idx = |name: &str| metrics.iter().position(|n| n == name);

  let rows = json
    .get("rows")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default();

  let mut out = Vec::with_capacity(rows.len());
  for row in rows.iter() {
    let dt = match cell(row, "dimensionValues", idx_date)
      .and_then(|v| v.as_str())
      .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
    {
      Some(d) => d,
      None => continue,
    };

    let dimension = idx_dimension
      .and_then(|i| cell(row, "dimensionValues", i))
      .and_then(|v| v.as_str())
      .map(|s| if s.trim().is_empty() { "(not set)".to_string() } else { s.trim().to_string() });

    let int_metric = |name: &str| metric_idx(name).and_then(|i| cell(row, "metricValues", i)).and_then(value_i64);
    let float_metric = |name: &str| metric_idx(name).and_then(|i| cell(row, "metricValues", i)).and_then(value_f64);

    out.push(AnalyticsRow {
      dt,
      dimension,
      metrics: Metrics {
        sessions: int_metric("sessions"),
        users: int_metric("totalUsers"),
        new_users: int_metric("newUsers"),
        page_views: int_metric("screenPageViews"),
        bounce_rate: float_metric("bounceRate"),
        avg_session_duration_secs: float_metric("averageSessionDuration"),
        conversions: float_metric("conversions"),
        ..Default::default()
      },
      raw: row.clone(),
    });
  }
  out
}

/// `returned` counts the rows in the response, parsed or not.
fn next_offset(json: &Value, offset: u64, returned: usize) -> Option<Cursor> {
  let row_count = json.get("rowCount").and_then(value_i64).unwrap_or(0).max(0) as u64;
  let next = offset + returned as u64;
  if returned > 0 && next < row_count {
    Some(Cursor::Offset(next))
  } else {
    None
  }
}

fn parse_property_summaries(json: &Value) -> Vec<PropertyRecord> {
  json
    .get("accountSummaries")
    .and_then(|v| v.as_array())
    .map(|accounts| {
      accounts
        .iter()
        .filter_map(|a| a.get("propertySummaries").and_then(|p| p.as_array()))
        .flatten()
        .filter_map(|p| {
          let property_id = bare_property_id(p.get("property").and_then(|v| v.as_str())?);
          if property_id.is_empty() {
            return None;
          }
          Some(PropertyRecord {
            name: p
              .get("displayName")
              .and_then(|v| v.as_str())
              .unwrap_or(&property_id)
              .to_string(),
            property_id,
            url: None,
            timezone: None,
          })
        })
        .collect()
    })
    .unwrap_or_default()
}

fn first_web_stream_uri(json: &Value) -> Option<String> {
  json
    .get("dataStreams")?
    .as_array()?
    .iter()
    .find_map(|s| s.get("webStreamData")?.get("defaultUri")?.as_str())
    .map(str::to_string)
}

#[async_trait]
impl AnalyticsPlatformApi for GoogleAnalyticsClient {
  async fn list_properties(
    &self,
    token: &AccessToken,
    cursor: Option<&Cursor>,
  ) -> Result<Page<PropertyRecord>, ApiError> {
    let mut url = format!("{}/v1beta/accountSummaries?pageSize={SUMMARY_PAGE_SIZE}", self.admin_base_url);
    if let Some(Cursor::Token(page_token)) = cursor {
      url.push_str("&pageToken=");
      url.push_str(&encode_query_value(page_token));
    }

    let json = self.call(token, "ga.account_summaries", Method::GET, &url, None).await?;
    let next = json
      .get("nextPageToken")
      .and_then(|v| v.as_str())
      .filter(|s| !s.is_empty())
      .map(|s| Cursor::Token(s.to_string()));

    Ok(Page {
      records: parse_property_summaries(&json),
      next,
    })
  }

  async fn fetch_property(&self, token: &AccessToken, property_id: &str) -> Result<PropertyRecord, ApiError> {
    let path = property_path(property_id);
    let url = format!("{}/v1beta/{path}", self.admin_base_url);
    let json = self.call(token, "ga.property", Method::GET, &url, None).await?;

    let streams_url = format!("{}/v1beta/{path}/dataStreams", self.admin_base_url);
    let url_value = match self.call(token, "ga.data_streams", Method::GET, &streams_url, None).await {
      Ok(streams) => first_web_stream_uri(&streams),
      Err(ApiError::Provider { status, message }) => {
        tracing::debug!(property = %path, ?status, %message, "data streams unavailable");
        None
      }
      Err(err) => return Err(err),
    };

    let bare = bare_property_id(&path);
    Ok(PropertyRecord {
      name: json
        .get("displayName")
        .and_then(|v| v.as_str())
        .unwrap_or(&bare)
        .to_string(),
      property_id: bare,
      url: url_value,
      timezone: json.get("timeZone").and_then(|v| v.as_str()).map(str::to_string),
    })
  }

  async fn run_report(
    &self,
    token: &AccessToken,
    property_id: &str,
    breakdown: Option<Breakdown>,
    range: DateRange,
    cursor: Option<&Cursor>,
  ) -> Result<Page<AnalyticsRow>, ApiError> {
    let offset = match cursor {
      Some(Cursor::Offset(n)) => *n,
      _ => 0,
    };
    let url = format!("{}/v1beta/{}:runReport", self.data_base_url, property_path(property_id));
    let body = build_report_body(breakdown, range, offset);

    let json = self.call(token, "ga.run_report", Method::POST, &url, Some(&body)).await?;
    let returned = json.get("rows").and_then(|v| v.as_array()).map_or(0, Vec::len);
    let records = parse_report_rows(&json);
    let next = next_offset(&json, offset, returned);
    Ok(Page { records, next })
  }
}
