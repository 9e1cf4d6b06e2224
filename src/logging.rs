use std::error::Error as StdError;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
  Json,
  Text,
}

impl LogFormat {
  /// `LOG_FORMAT=text` selects human-readable output; anything else is JSON.
  pub fn parse(value: Option<&str>) -> Self {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
      Some("text") | Some("pretty") => LogFormat::Text,
      _ => LogFormat::Json,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      LogFormat::Json => "json",
      LogFormat::Text => "text",
    }
  }
}

/// Installs the process-wide subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(service: &str) -> LogFormat {
  let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let result = match format {
    LogFormat::Json => tracing_subscriber::registry()
      .with(filter)
      .with(
        tracing_subscriber::fmt::layer()
          .json()
          .with_target(true)
          .with_current_span(true)
          .flatten_event(true),
      )
      .try_init(),
    LogFormat::Text => tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_target(true))
      .try_init(),
  };

  if result.is_ok() {
    tracing::info!(service, log_format = format.as_str(), "logging initialized");
  }
  format
}

/// Flattens an error and its source chain into one line for log fields.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
  let mut out = err.to_string();
  let mut source = err.source();
  while let Some(cause) = source {
    out.push_str(": ");
    out.push_str(&cause.to_string());
    source = cause.source();
  }
  out
}
