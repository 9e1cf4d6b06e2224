//! Scheduled fan-out over every connected account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::SyncConfig;
use crate::db::MySqlStore;
use crate::error::SyncError;
use crate::logging::error_chain;
use crate::models::{ConnectedAccount, DateRange, Provider};
use crate::providers::google_analytics::GoogleAnalyticsClient;
use crate::providers::meta_ads::MetaAdsClient;
use crate::providers::oauth::{ProviderRefreshers, TokenRefresher};
use crate::providers::{AdsPlatformApi, AnalyticsPlatformApi};
use crate::store::{AccountFilter, SyncStore};
use crate::token_manager::TokenManager;
use crate::walker::{sync_account, SyncContext, SyncSummary};

/// Everything a run needs, built once per process.
pub struct SyncEngine {
  ctx: Arc<SyncContext>,
  config: SyncConfig,
}

impl SyncEngine {
  pub fn new(
    store: Arc<dyn SyncStore>,
    ads: Arc<dyn AdsPlatformApi>,
    analytics: Arc<dyn AnalyticsPlatformApi>,
    refresher: Arc<dyn TokenRefresher>,
    config: SyncConfig,
  ) -> Self {
    let tokens = Arc::new(TokenManager::new(store.clone(), refresher, config.token_refresh_leeway));
    let ctx = SyncContext {
      store,
      ads,
      analytics,
      tokens,
      max_pages: config.max_pages,
      chunk_days: config.chunk_days,
    };
    Self {
      ctx: Arc::new(ctx),
      config,
    }
  }

  /// Production wiring: MySQL store, live provider clients, OAuth refreshers.
  pub async fn connect(config: SyncConfig) -> Result<Self, SyncError> {
    let store = MySqlStore::connect().await?;
    let refreshers = ProviderRefreshers::from_config(&config)?;
    let ads = MetaAdsClient::new(&config);
    let analytics = GoogleAnalyticsClient::new(&config);
    Ok(Self::new(
      Arc::new(store),
      Arc::new(ads),
      Arc::new(analytics),
      Arc::new(refreshers),
      config,
    ))
  }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
  /// Defaults to the trailing `lookback_days` complete days before `now`.
  pub range: Option<DateRange>,
  pub account_id: Option<i64>,
  pub provider: Option<Provider>,
  pub now: DateTime<Utc>,
}

impl RunOptions {
  pub fn at(now: DateTime<Utc>) -> Self {
    Self {
      range: None,
      account_id: None,
      provider: None,
      now,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
  Succeeded,
  Partial,
  Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
  pub account_id: i64,
  pub provider: Provider,
  pub status: AccountStatus,
  pub duration_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summary: Option<SyncSummary>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_kind: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub range: DateRange,
  pub processed: usize,
  pub succeeded: usize,
  pub partial: usize,
  pub failed: usize,
  pub accounts: Vec<AccountReport>,
}

async fn run_account(
  ctx: Arc<SyncContext>,
  account: ConnectedAccount,
  range: DateRange,
  deadline: Duration,
) -> AccountReport {
  let started = Instant::now();
  let outcome = match tokio::time::timeout(deadline, sync_account(&ctx, &account, range)).await {
    Ok(result) => result,
    Err(_) => Err(SyncError::Timeout(deadline)),
  };

  let mut report = AccountReport {
    account_id: account.id,
    provider: account.provider,
    status: AccountStatus::Failed,
    duration_ms: 0,
    summary: None,
    error: None,
    error_kind: None,
  };

  match outcome {
    Ok(summary) if summary.is_clean() => match ctx.store.mark_synced(account.id, Utc::now()).await {
      Ok(()) => {
        report.status = AccountStatus::Succeeded;
        report.summary = Some(summary);
      }
      Err(err) => {
        let err = SyncError::from(err);
        tracing::error!(account_id = account.id, error = %error_chain(&err), "failed to record sync completion");
        report.error_kind = Some(err.kind());
        report.error = Some(err.to_string());
        report.summary = Some(summary);
      }
    },
    Ok(summary) => {
      report.status = AccountStatus::Partial;
      report.summary = Some(summary);
    }
    Err(err) => {
      tracing::error!(
        account_id = account.id,
        provider = %account.provider,
        kind = err.kind(),
        error = %error_chain(&err),
        "account sync failed"
      );
      report.error_kind = Some(err.kind());
      report.error = Some(err.to_string());
    }
  }

  report.duration_ms = started.elapsed().as_millis() as u64;
  report
}

/// Syncs every matching connected account. Only a failure to list accounts
/// fails the run; per-account failures are reported.
pub async fn run_sync(engine: &SyncEngine, options: RunOptions) -> Result<RunReport, SyncError> {
  let started_at = Utc::now();
  let range = options
    .range
    .unwrap_or_else(|| DateRange::trailing_days(options.now.date_naive(), engine.config.lookback_days));

  let filter = AccountFilter {
    account_id: options.account_id,
    provider: options.provider,
  };
  let accounts = engine.ctx.store.list_connected_accounts(&filter).await?;

  tracing::info!(
    accounts = accounts.len(),
    %range,
    max_concurrency = engine.config.max_concurrency,
    "sync run started"
  );

  let semaphore = Arc::new(Semaphore::new(engine.config.max_concurrency.max(1)));
  let deadline = engine.config.account_timeout;
  let mut tasks = JoinSet::new();
  let mut in_flight = HashMap::new();
  let fanout_started = Instant::now();

  for account in accounts {
    let ctx = engine.ctx.clone();
    let semaphore = semaphore.clone();
    let key = (account.id, account.provider);
    let handle = tasks.spawn(async move {
      let _permit = semaphore.acquire_owned().await.ok();
      run_account(ctx, account, range, deadline).await
    });
    in_flight.insert(handle.id(), key);
  }

  let mut reports = Vec::new();
  while let Some(joined) = tasks.join_next_with_id().await {
    match joined {
      Ok((_, report)) => reports.push(report),
      Err(err) => {
        let Some((account_id, provider)) = in_flight.remove(&err.id()) else {
          tracing::error!(error = %err, "untracked sync task failed");
          continue;
        };
        tracing::error!(account_id, %provider, error = %err, "account task aborted");
        reports.push(AccountReport {
          account_id,
          provider,
          status: AccountStatus::Failed,
          duration_ms: fanout_started.elapsed().as_millis() as u64,
          summary: None,
          error: Some(err.to_string()),
          error_kind: Some(if err.is_panic() { "task_panicked" } else { "task_cancelled" }),
        });
      }
    }
  }
  reports.sort_by_key(|r| r.account_id);

  let count = |status: AccountStatus| reports.iter().filter(|r| r.status == status).count();
  let report = RunReport {
    started_at,
    finished_at: Utc::now(),
    range,
    processed: reports.len(),
    succeeded: count(AccountStatus::Succeeded),
    partial: count(AccountStatus::Partial),
    failed: count(AccountStatus::Failed),
    accounts: reports,
  };

  tracing::info!(
    processed = report.processed,
    succeeded = report.succeeded,
    partial = report.partial,
    failed = report.failed,
    "sync run finished"
  );
  Ok(report)
}
