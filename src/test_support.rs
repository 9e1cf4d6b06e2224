//! Local hyper servers standing in for provider APIs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct MockRequest {
  pub method: Method,
  /// Origin-form target, e.g. `/v19.0/act_1/campaigns?limit=100`.
  pub target: String,
  pub authorization: Option<String>,
  pub body: Bytes,
}

impl MockRequest {
  pub fn path(&self) -> &str {
    self.target.split('?').next().unwrap_or("")
  }

  pub fn query(&self) -> &str {
    self.target.split_once('?').map(|(_, q)| q).unwrap_or("")
  }
}

pub struct MockServer {
  pub base_url: String,
  pub hits: Arc<AtomicUsize>,
  task: tokio::task::JoinHandle<()>,
}

impl MockServer {
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }
}

impl Drop for MockServer {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Serves every connection with `handler` until dropped.
pub async fn spawn_json_server<F>(handler: F) -> MockServer
where
  F: Fn(&MockRequest) -> (StatusCode, String) + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);
  let hits = Arc::new(AtomicUsize::new(0));
  let hits_for_task = hits.clone();

  let task = tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let handler = handler.clone();
      let hits = hits_for_task.clone();
      tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let _ = http1::Builder::new()
          .serve_connection(
            io,
            service_fn(move |req: Request<Incoming>| {
              let handler = handler.clone();
              let hits = hits.clone();
              async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let method = req.method().clone();
                let target = req
                  .uri()
                  .path_and_query()
                  .map(|pq| pq.as_str().to_string())
                  .unwrap_or_else(|| "/".to_string());
                let authorization = req
                  .headers()
                  .get(AUTHORIZATION)
                  .and_then(|v| v.to_str().ok())
                  .map(str::to_string);
                let body = req
                  .into_body()
                  .collect()
                  .await
                  .map(|b| b.to_bytes())
                  .unwrap_or_default();

                let mock = MockRequest {
                  method,
                  target,
                  authorization,
                  body,
                };
                let (status, body) = handler(&mock);
                Ok::<_, hyper::Error>(
                  Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
                )
              }
            }),
          )
          .await;
      });
    }
  });

  MockServer {
    base_url: format!("http://{addr}/"),
    hits,
    task,
  }
}
