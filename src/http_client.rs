use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;

use crate::error::ApiError;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

static SHARED_CLIENT: OnceLock<HttpsClient> = OnceLock::new();

const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

fn build_http_client() -> Result<HttpsClient, ApiError> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| ApiError::provider(None, e.to_string()))?
    .https_or_http()
    .enable_http1()
    .build();

  Ok(
    Client::builder(TokioExecutor::new())
      .pool_idle_timeout(Duration::from_secs(30))
      .build(connector),
  )
}

/// Connection pool shared by every provider client in the process.
pub fn shared_http_client() -> Result<&'static HttpsClient, ApiError> {
  if let Some(client) = SHARED_CLIENT.get() {
    return Ok(client);
  }
  let client = build_http_client()?;
  let _ = SHARED_CLIENT.set(client);
  SHARED_CLIENT
    .get()
    .ok_or_else(|| ApiError::provider(None, "http client not initialized"))
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: StatusCode,
  pub body: Bytes,
}

impl HttpResponse {
  pub fn json(&self) -> Result<Value, ApiError> {
    serde_json::from_slice(&self.body)
      .map_err(|e| ApiError::provider(Some(self.status.as_u16()), format!("invalid json response: {e}")))
  }

  pub fn body_snippet(&self, max_chars: usize) -> String {
    String::from_utf8_lossy(&self.body).chars().take(max_chars).collect()
  }
}

/// Sends one request. Transport failures and timeouts become `ApiError::Provider`;
/// HTTP status interpretation is left to the caller.
pub async fn send(
  method: Method,
  url: &str,
  bearer: Option<&str>,
  json_body: Option<&Value>,
) -> Result<HttpResponse, ApiError> {
  let client = shared_http_client()?;

  let mut builder = Request::builder()
    .method(method)
    .uri(url)
    .header(ACCEPT, "application/json")
    .header(USER_AGENT, "adpulse-sync");

  if let Some(token) = bearer {
    builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
  }

  let body = match json_body {
    Some(v) => {
      builder = builder.header(CONTENT_TYPE, "application/json");
      Bytes::from(serde_json::to_vec(v).map_err(|e| ApiError::provider(None, e.to_string()))?)
    }
    None => Bytes::new(),
  };

  let req = builder
    .body(Full::new(body))
    .map_err(|e| ApiError::provider(None, e.to_string()))?;

  let resp = tokio::time::timeout(REQUEST_TIMEOUT, client.request(req))
    .await
    .map_err(|_| ApiError::provider(None, format!("request timed out after {REQUEST_TIMEOUT:?}")))?
    .map_err(|e| ApiError::provider(None, e.to_string()))?;

  let status = resp.status();
  let body = resp
    .into_body()
    .collect()
    .await
    .map_err(|e| ApiError::provider(Some(status.as_u16()), e.to_string()))?
    .to_bytes();

  Ok(HttpResponse { status, body })
}

/// Percent-encodes a query component (RFC 3986 unreserved set kept as-is).
pub fn encode_query_value(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for b in value.bytes() {
    match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
      _ => out.push_str(&format!("%{b:02X}")),
    }
  }
  out
}
