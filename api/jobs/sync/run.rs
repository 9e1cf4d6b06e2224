use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::OnceCell;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use adpulse_sync::config::{has_database_url, SyncConfig};
use adpulse_sync::logging::{error_chain, init_logging};
use adpulse_sync::models::{DateRange, Provider};
use adpulse_sync::orchestrator::{run_sync, RunOptions, SyncEngine};

static ENGINE: OnceCell<SyncEngine> = OnceCell::const_new();

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn bad_request(message: impl Into<String>) -> Result<Response<ResponseBody>, Error> {
  json_response(
    StatusCode::BAD_REQUEST,
    serde_json::json!({"ok": false, "error": "bad_request", "message": message.into()}),
  )
}

#[derive(Deserialize)]
struct RunRequest {
  now_ms: i64,
  start_dt: Option<String>,
  end_dt: Option<String>,
  account_id: Option<i64>,
  provider: Option<String>,
}

fn parse_dt(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, String> {
  match value.map(str::trim).filter(|v| !v.is_empty()) {
    None => Ok(None),
    Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
      .map(Some)
      .map_err(|_| format!("{field} must be YYYY-MM-DD")),
  }
}

/// Builds run options from the request body. Errors are client errors.
fn parse_run_request(body: &[u8]) -> Result<RunOptions, String> {
  let parsed: RunRequest = serde_json::from_slice(body).map_err(|e| format!("invalid json body: {e}"))?;

  if parsed.now_ms <= 0 {
    return Err("now_ms is required".to_string());
  }
  let now = Utc
    .timestamp_millis_opt(parsed.now_ms)
    .single()
    .ok_or_else(|| "now_ms is out of range".to_string())?;

  let start = parse_dt("start_dt", parsed.start_dt.as_deref())?;
  let end = parse_dt("end_dt", parsed.end_dt.as_deref())?;
  let range = match (start, end) {
    (None, None) => None,
    (Some(since), Some(until)) => {
      Some(DateRange::new(since, until).ok_or_else(|| "start_dt must not be after end_dt".to_string())?)
    }
    _ => return Err("start_dt and end_dt must be given together".to_string()),
  };

  let provider = match parsed.provider.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
    None => None,
    Some(p) => Some(Provider::parse(p).ok_or_else(|| format!("unknown provider: {p}"))?),
  };

  Ok(RunOptions {
    range,
    account_id: parsed.account_id,
    provider,
    now,
  })
}

async fn handle_run(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let options = match parse_run_request(&body) {
    Ok(options) => options,
    Err(message) => return bad_request(message),
  };

  let engine = ENGINE
    .get_or_try_init(|| SyncEngine::connect(SyncConfig::from_env()))
    .await?;

  match run_sync(engine, options).await {
    Ok(report) => json_response(
      StatusCode::OK,
      serde_json::json!({"ok": report.failed == 0, "report": report}),
    ),
    Err(err) => {
      tracing::error!(kind = err.kind(), error = %error_chain(&err), "sync run failed");
      json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({"ok": false, "error": err.kind(), "message": err.to_string()}),
      )
    }
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_run(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_logging("jobs_sync_run");
  run(service_fn(handler)).await
}
