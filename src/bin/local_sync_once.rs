use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;
use dotenv::dotenv;
use vercel_runtime::Error;

use adpulse_sync::config::{has_database_url, SyncConfig};
use adpulse_sync::logging::init_logging;
use adpulse_sync::models::{DateRange, Provider};
use adpulse_sync::orchestrator::{run_sync, RunOptions, SyncEngine};

#[derive(Parser, Debug)]
#[clap(about = "Run one sync pass (or a backfill) against the configured database")]
struct Cli {
  #[clap(long, env = "SYNC_ACCOUNT_ID")]
  /// Only sync this connected account id
  account_id: Option<i64>,

  #[clap(long, env = "SYNC_PROVIDER", value_parser = parse_provider)]
  /// Only sync accounts of this provider (ads_platform | analytics_platform)
  provider: Option<Provider>,

  #[clap(long, value_parser = parse_dt)]
  /// First day to sync (YYYY-MM-DD)
  start_dt: Option<NaiveDate>,

  #[clap(long, value_parser = parse_dt)]
  /// Last day to sync (YYYY-MM-DD); defaults to yesterday
  end_dt: Option<NaiveDate>,

  #[clap(long)]
  /// Days back from end_dt when start_dt is not given
  days: Option<i64>,
}

fn parse_dt(input: &str) -> Result<NaiveDate, String> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_provider(input: &str) -> Result<Provider, String> {
  Provider::parse(input).ok_or_else(|| format!("unknown provider: {input}"))
}

fn resolve_range(cli: &Cli, today: NaiveDate, lookback_days: i64) -> Result<DateRange, String> {
  let end_dt = cli.end_dt.unwrap_or_else(|| today - Duration::days(1));
  let days = cli.days.unwrap_or(lookback_days).clamp(1, 3_650);
  let start_dt = cli.start_dt.unwrap_or_else(|| end_dt - Duration::days(days - 1));
  DateRange::new(start_dt, end_dt).ok_or_else(|| format!("invalid range: start_dt ({start_dt}) > end_dt ({end_dt})"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  dotenv().ok();
  init_logging("local_sync_once");
  let cli = Cli::parse();

  if !has_database_url() {
    return Err(Box::new(std::io::Error::other("Missing TIDB_DATABASE_URL (or DATABASE_URL)")) as Error);
  }

  let config = SyncConfig::from_env();
  let now = Utc::now();
  let range = resolve_range(&cli, now.date_naive(), config.lookback_days)
    .map_err(|e| Box::new(std::io::Error::other(e)) as Error)?;

  let engine = SyncEngine::connect(config).await?;
  let options = RunOptions {
    range: Some(range),
    account_id: cli.account_id,
    provider: cli.provider,
    now,
  };

  let report = run_sync(&engine, options).await?;
  println!("{}", serde_json::to_string_pretty(&report)?);

  if report.failed > 0 {
    eprintln!("{} of {} accounts failed", report.failed, report.processed);
  }
  Ok(())
}
