use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::types::Json;
use sqlx::{MySqlPool, Row};
use tokio::sync::OnceCell;

use crate::error::StoreError;
use crate::models::{
  AccessToken, Ad, AdGroup, Campaign, ConnectedAccount, DateRange, Metrics, PerformanceRecord, Provider,
  RefreshToken, RefreshedTokens, ScopeLevel, Site,
};
use crate::store::{plan_performance_write, AccountFilter, PerformanceWrite, SyncStore, UpsertOutcome};

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

const SCHEMA: [&str; 6] = [
  r#"
    CREATE TABLE IF NOT EXISTS connected_accounts (
      id BIGINT PRIMARY KEY AUTO_INCREMENT,
      user_id VARCHAR(128) NOT NULL,
      provider VARCHAR(32) NOT NULL,
      external_business_id VARCHAR(128) NOT NULL,
      display_name VARCHAR(255) NOT NULL DEFAULT '',
      access_token TEXT NOT NULL,
      refresh_token TEXT NULL,
      expires_at TIMESTAMP(3) NULL,
      connected TINYINT(1) NOT NULL DEFAULT 1,
      metadata_json JSON NULL,
      last_synced_at TIMESTAMP(3) NULL,
      created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
      UNIQUE KEY uq_connected_accounts_business (user_id, provider, external_business_id),
      KEY idx_connected_accounts_provider (provider, connected)
    );
  "#,
  r#"
    CREATE TABLE IF NOT EXISTS ad_campaigns (
      connected_account_id BIGINT NOT NULL,
      external_id VARCHAR(128) NOT NULL,
      ad_account_id VARCHAR(128) NOT NULL,
      name VARCHAR(512) NOT NULL,
      status VARCHAR(32) NOT NULL,
      raw_json JSON NOT NULL,
      created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
      PRIMARY KEY (connected_account_id, external_id),
      KEY idx_ad_campaigns_ad_account (connected_account_id, ad_account_id)
    );
  "#,
  r#"
    CREATE TABLE IF NOT EXISTS ad_groups (
      connected_account_id BIGINT NOT NULL,
      external_id VARCHAR(128) NOT NULL,
      campaign_external_id VARCHAR(128) NOT NULL,
      name VARCHAR(512) NOT NULL,
      status VARCHAR(32) NOT NULL,
      raw_json JSON NOT NULL,
      created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
      PRIMARY KEY (connected_account_id, external_id),
      KEY idx_ad_groups_campaign (connected_account_id, campaign_external_id)
    );
  "#,
  r#"
    CREATE TABLE IF NOT EXISTS ads (
      connected_account_id BIGINT NOT NULL,
      external_id VARCHAR(128) NOT NULL,
      ad_group_external_id VARCHAR(128) NOT NULL,
      name VARCHAR(512) NOT NULL,
      status VARCHAR(32) NOT NULL,
      raw_json JSON NOT NULL,
      created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
      PRIMARY KEY (connected_account_id, external_id),
      KEY idx_ads_ad_group (connected_account_id, ad_group_external_id)
    );
  "#,
  r#"
    CREATE TABLE IF NOT EXISTS analytics_sites (
      connected_account_id BIGINT PRIMARY KEY,
      property_id VARCHAR(128) NOT NULL,
      name VARCHAR(512) NOT NULL,
      url VARCHAR(2048) NULL,
      timezone VARCHAR(64) NULL,
      created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
    );
  "#,
  r#"
    CREATE TABLE IF NOT EXISTS performance_daily (
      connected_account_id BIGINT NOT NULL,
      dt DATE NOT NULL,
      scope_level VARCHAR(16) NOT NULL,
      scope_id VARCHAR(128) NOT NULL,
      impressions BIGINT NULL,
      clicks BIGINT NULL,
      spend DOUBLE NULL,
      reach BIGINT NULL,
      conversions DOUBLE NULL,
      ctr DOUBLE NULL,
      cpc DOUBLE NULL,
      sessions BIGINT NULL,
      users BIGINT NULL,
      new_users BIGINT NULL,
      page_views BIGINT NULL,
      bounce_rate DOUBLE NULL,
      avg_session_duration_secs DOUBLE NULL,
      breakdowns_json JSON NOT NULL,
      raw_json JSON NOT NULL,
      updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
      PRIMARY KEY (connected_account_id, dt, scope_level, scope_id),
      KEY idx_performance_daily_scope (connected_account_id, scope_level, scope_id, dt)
    );
  "#,
];

async fn ensure_schema(pool: &MySqlPool) -> Result<(), StoreError> {
  for ddl in SCHEMA {
    sqlx::query(ddl).execute(pool).await?;
  }
  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool, StoreError> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("TIDB_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| {
          StoreError::Database(sqlx::Error::Configuration(
            "Missing TIDB_DATABASE_URL (or DATABASE_URL)".into(),
          ))
        })?;

      let max_connections = std::env::var("SYNC_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(5)
        .clamp(1, 50);

      let pool = MySqlPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

      ensure_schema(&pool).await?;
      tracing::info!(max_connections, "database pool ready");
      Ok::<_, StoreError>(pool)
    })
    .await
}

fn decode_error(message: String) -> StoreError {
  StoreError::Database(sqlx::Error::Decode(message.into()))
}

type AccountRow = (
  i64,
  String,
  String,
  String,
  String,
  String,
  Option<String>,
  Option<DateTime<Utc>>,
  bool,
  Option<Json<Value>>,
  Option<DateTime<Utc>>,
);

const ACCOUNT_COLUMNS: &str = "id, user_id, provider, external_business_id, display_name, access_token, \
   refresh_token, expires_at, connected, metadata_json, last_synced_at";

fn account_from_row(row: AccountRow) -> Result<ConnectedAccount, StoreError> {
  let (
    id,
    user_id,
    provider,
    external_business_id,
    display_name,
    access_token,
    refresh_token,
    expires_at,
    connected,
    metadata,
    last_synced_at,
  ) = row;

  let provider = Provider::parse(&provider)
    .ok_or_else(|| decode_error(format!("connected account {id} has unknown provider {provider:?}")))?;

  Ok(ConnectedAccount {
    id,
    user_id,
    provider,
    external_business_id,
    display_name,
    access_token: AccessToken::new(access_token),
    refresh_token: refresh_token.filter(|t| !t.trim().is_empty()).map(RefreshToken::new),
    expires_at,
    connected,
    metadata: metadata.map(|m| m.0).unwrap_or_else(|| Value::Object(Default::default())),
    last_synced_at,
  })
}

fn performance_from_row(row: &MySqlRow) -> Result<PerformanceRecord, StoreError> {
  let scope_level: String = row.try_get("scope_level")?;
  let scope_level = ScopeLevel::parse(&scope_level)
    .ok_or_else(|| decode_error(format!("unknown scope level {scope_level:?}")))?;
  let breakdowns: Json<Value> = row.try_get("breakdowns_json")?;
  let raw: Json<Value> = row.try_get("raw_json")?;

  Ok(PerformanceRecord {
    dt: row.try_get::<NaiveDate, _>("dt")?,
    scope_level,
    scope_id: row.try_get("scope_id")?,
    metrics: Metrics {
      impressions: row.try_get("impressions")?,
      clicks: row.try_get("clicks")?,
      spend: row.try_get("spend")?,
      reach: row.try_get("reach")?,
      conversions: row.try_get("conversions")?,
      ctr: row.try_get("ctr")?,
      cpc: row.try_get("cpc")?,
      sessions: row.try_get("sessions")?,
      users: row.try_get("users")?,
      new_users: row.try_get("new_users")?,
      page_views: row.try_get("page_views")?,
      bounce_rate: row.try_get("bounce_rate")?,
      avg_session_duration_secs: row.try_get("avg_session_duration_secs")?,
    },
    breakdowns: breakdowns.0,
    raw: raw.0,
  })
}

const PERFORMANCE_COLUMNS: &str = "dt, scope_level, scope_id, impressions, clicks, spend, reach, conversions, \
   ctr, cpc, sessions, users, new_users, page_views, bounce_rate, avg_session_duration_secs, \
   breakdowns_json, raw_json";

const PERFORMANCE_UPSERT_SQL: &str = r#"
  INSERT INTO performance_daily
    (connected_account_id, dt, scope_level, scope_id,
     impressions, clicks, spend, reach, conversions, ctr, cpc,
     sessions, users, new_users, page_views, bounce_rate, avg_session_duration_secs,
     breakdowns_json, raw_json)
  VALUES
    (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
  ON DUPLICATE KEY UPDATE
    impressions = VALUES(impressions),
    clicks = VALUES(clicks),
    spend = VALUES(spend),
    reach = VALUES(reach),
    conversions = VALUES(conversions),
    ctr = VALUES(ctr),
    cpc = VALUES(cpc),
    sessions = VALUES(sessions),
    users = VALUES(users),
    new_users = VALUES(new_users),
    page_views = VALUES(page_views),
    bounce_rate = VALUES(bounce_rate),
    avg_session_duration_secs = VALUES(avg_session_duration_secs),
    breakdowns_json = VALUES(breakdowns_json),
    raw_json = VALUES(raw_json);
"#;

/// MySQL/TiDB-backed store.
///
/// Each upsert reads the current row first so the outcome does not depend on
/// the driver's found-rows setting; identical rows are not rewritten.
#[derive(Clone)]
pub struct MySqlStore {
  pool: MySqlPool,
}

impl MySqlStore {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }

  pub async fn connect() -> Result<Self, StoreError> {
    Ok(Self::new(get_pool().await?.clone()))
  }

  async fn existing_entity(
    &self,
    table: &str,
    parent_column: &str,
    account_id: i64,
    external_id: &str,
  ) -> Result<Option<(String, String, String, Value)>, StoreError> {
    let sql = format!(
      "SELECT {parent_column}, name, status, raw_json FROM {table} \
       WHERE connected_account_id = ? AND external_id = ? LIMIT 1;"
    );
    let row = sqlx::query_as::<_, (String, String, String, Json<Value>)>(&sql)
      .bind(account_id)
      .bind(external_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(|(parent, name, status, raw)| (parent, name, status, raw.0)))
  }

  #[allow(clippy::too_many_arguments)]
  async fn upsert_entity(
    &self,
    table: &str,
    parent_column: &str,
    account_id: i64,
    external_id: &str,
    parent_id: &str,
    name: &str,
    status: &str,
    raw: &Value,
  ) -> Result<UpsertOutcome, StoreError> {
    let existing = self.existing_entity(table, parent_column, account_id, external_id).await?;
    let outcome = match &existing {
      None => UpsertOutcome::Inserted,
      Some((p, n, s, r)) if p == parent_id && n == name && s == status && r == raw => {
        return Ok(UpsertOutcome::Unchanged);
      }
      Some(_) => UpsertOutcome::Updated,
    };

    let sql = format!(
      "INSERT INTO {table} (connected_account_id, external_id, {parent_column}, name, status, raw_json) \
       VALUES (?, ?, ?, ?, ?, ?) \
       ON DUPLICATE KEY UPDATE \
         {parent_column} = VALUES({parent_column}), \
         name = VALUES(name), \
         status = VALUES(status), \
         raw_json = VALUES(raw_json);"
    );
    sqlx::query(&sql)
      .bind(account_id)
      .bind(external_id)
      .bind(parent_id)
      .bind(name)
      .bind(status)
      .bind(Json(raw))
      .execute(&self.pool)
      .await?;

    Ok(outcome)
  }

  async fn existing_performance(
    &self,
    account_id: i64,
    record: &PerformanceRecord,
  ) -> Result<Option<PerformanceRecord>, StoreError> {
    let sql = format!(
      "SELECT {PERFORMANCE_COLUMNS} FROM performance_daily \
       WHERE connected_account_id = ? AND dt = ? AND scope_level = ? AND scope_id = ? LIMIT 1;"
    );
    let row = sqlx::query(&sql)
      .bind(account_id)
      .bind(record.dt)
      .bind(record.scope_level.as_str())
      .bind(&record.scope_id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(performance_from_row).transpose()
  }

  /// Resolves the target row in Rust, then writes it whole. Every column is
  /// overwritten, so the stored row always equals the planned one.
  async fn write_performance(
    &self,
    account_id: i64,
    record: &PerformanceRecord,
    mode: PerformanceWrite,
  ) -> Result<UpsertOutcome, StoreError> {
    let existing = self.existing_performance(account_id, record).await?;
    let (row, outcome) = plan_performance_write(existing.as_ref(), record, mode);
    if outcome == UpsertOutcome::Unchanged {
      return Ok(outcome);
    }

    let m = &row.metrics;
    sqlx::query(PERFORMANCE_UPSERT_SQL)
      .bind(account_id)
      .bind(row.dt)
      .bind(row.scope_level.as_str())
      .bind(&row.scope_id)
      .bind(m.impressions)
      .bind(m.clicks)
      .bind(m.spend)
      .bind(m.reach)
      .bind(m.conversions)
      .bind(m.ctr)
      .bind(m.cpc)
      .bind(m.sessions)
      .bind(m.users)
      .bind(m.new_users)
      .bind(m.page_views)
      .bind(m.bounce_rate)
      .bind(m.avg_session_duration_secs)
      .bind(Json(&row.breakdowns))
      .bind(Json(&row.raw))
      .execute(&self.pool)
      .await?;

    Ok(outcome)
  }
}

#[async_trait]
impl SyncStore for MySqlStore {
  async fn list_connected_accounts(&self, filter: &AccountFilter) -> Result<Vec<ConnectedAccount>, StoreError> {
    let sql = format!(
      "SELECT {ACCOUNT_COLUMNS} FROM connected_accounts \
       WHERE connected = 1 \
         AND (? IS NULL OR id = ?) \
         AND (? IS NULL OR provider = ?) \
       ORDER BY id ASC;"
    );
    let provider = filter.provider.map(|p| p.as_str());
    let rows = sqlx::query_as::<_, AccountRow>(&sql)
      .bind(filter.account_id)
      .bind(filter.account_id)
      .bind(provider)
      .bind(provider)
      .fetch_all(&self.pool)
      .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
      match account_from_row(row) {
        Ok(account) => out.push(account),
        Err(err) => tracing::warn!(error = %err, "skipping unreadable connected account"),
      }
    }
    Ok(out)
  }

  async fn fetch_account(&self, account_id: i64) -> Result<Option<ConnectedAccount>, StoreError> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM connected_accounts WHERE id = ? LIMIT 1;");
    let row = sqlx::query_as::<_, AccountRow>(&sql)
      .bind(account_id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(account_from_row).transpose()
  }

  async fn replace_tokens_if_current(
    &self,
    account_id: i64,
    expected: &AccessToken,
    tokens: &RefreshedTokens,
  ) -> Result<bool, StoreError> {
    let result = sqlx::query(
      r#"
        UPDATE connected_accounts
        SET access_token = ?,
            refresh_token = COALESCE(?, refresh_token),
            expires_at = ?
        WHERE id = ?
          AND access_token = ?;
      "#,
    )
    .bind(tokens.access_token.secret())
    .bind(tokens.refresh_token.as_ref().map(|t| t.secret()))
    .bind(tokens.expires_at)
    .bind(account_id)
    .bind(expected.secret())
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() > 0)
  }

  async fn mark_synced(&self, account_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
    sqlx::query("UPDATE connected_accounts SET last_synced_at = ? WHERE id = ?;")
      .bind(at)
      .bind(account_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn upsert_campaign(&self, account_id: i64, campaign: &Campaign) -> Result<UpsertOutcome, StoreError> {
    self
      .upsert_entity(
        "ad_campaigns",
        "ad_account_id",
        account_id,
        &campaign.external_id,
        &campaign.ad_account_id,
        &campaign.name,
        &campaign.status,
        &campaign.raw,
      )
      .await
  }

  async fn upsert_ad_group(&self, account_id: i64, ad_group: &AdGroup) -> Result<UpsertOutcome, StoreError> {
    self
      .upsert_entity(
        "ad_groups",
        "campaign_external_id",
        account_id,
        &ad_group.external_id,
        &ad_group.campaign_external_id,
        &ad_group.name,
        &ad_group.status,
        &ad_group.raw,
      )
      .await
  }

  async fn upsert_ad(&self, account_id: i64, ad: &Ad) -> Result<UpsertOutcome, StoreError> {
    self
      .upsert_entity(
        "ads",
        "ad_group_external_id",
        account_id,
        &ad.external_id,
        &ad.ad_group_external_id,
        &ad.name,
        &ad.status,
        &ad.raw,
      )
      .await
  }

  async fn upsert_site(&self, account_id: i64, site: &Site) -> Result<UpsertOutcome, StoreError> {
    let existing = sqlx::query_as::<_, (String, String, Option<String>, Option<String>)>(
      "SELECT property_id, name, url, timezone FROM analytics_sites WHERE connected_account_id = ? LIMIT 1;",
    )
    .bind(account_id)
    .fetch_optional(&self.pool)
    .await?;

    let outcome = match existing {
      None => UpsertOutcome::Inserted,
      Some((property_id, name, url, timezone))
        if property_id == site.property_id && name == site.name && url == site.url && timezone == site.timezone =>
      {
        return Ok(UpsertOutcome::Unchanged);
      }
      Some(_) => UpsertOutcome::Updated,
    };

    sqlx::query(
      r#"
        INSERT INTO analytics_sites
          (connected_account_id, property_id, name, url, timezone)
        VALUES
          (?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          property_id = VALUES(property_id),
          name = VALUES(name),
          url = COALESCE(VALUES(url), url),
          timezone = COALESCE(VALUES(timezone), timezone);
      "#,
    )
    .bind(account_id)
    .bind(&site.property_id)
    .bind(&site.name)
    .bind(site.url.as_deref())
    .bind(site.timezone.as_deref())
    .execute(&self.pool)
    .await?;

    Ok(outcome)
  }

  async fn upsert_performance(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
    self.write_performance(account_id, record, PerformanceWrite::Resync).await
  }

  async fn merge_breakdowns(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
    self.write_performance(account_id, record, PerformanceWrite::Breakdowns).await
  }

  async fn list_campaigns(&self, account_id: i64) -> Result<Vec<Campaign>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, String, String, Json<Value>)>(
      r#"
        SELECT external_id, ad_account_id, name, status, raw_json
        FROM ad_campaigns
        WHERE connected_account_id = ?
        ORDER BY name ASC, external_id ASC;
      "#,
    )
    .bind(account_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|(external_id, ad_account_id, name, status, raw)| Campaign {
          external_id,
          ad_account_id,
          name,
          status,
          raw: raw.0,
        })
        .collect(),
    )
  }

  async fn list_ad_groups(&self, account_id: i64, campaign_external_id: &str) -> Result<Vec<AdGroup>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, String, String, Json<Value>)>(
      r#"
        SELECT external_id, campaign_external_id, name, status, raw_json
        FROM ad_groups
        WHERE connected_account_id = ?
          AND campaign_external_id = ?
        ORDER BY name ASC, external_id ASC;
      "#,
    )
    .bind(account_id)
    .bind(campaign_external_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|(external_id, campaign_external_id, name, status, raw)| AdGroup {
          external_id,
          campaign_external_id,
          name,
          status,
          raw: raw.0,
        })
        .collect(),
    )
  }

  async fn list_ads(&self, account_id: i64, ad_group_external_id: &str) -> Result<Vec<Ad>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, String, String, Json<Value>)>(
      r#"
        SELECT external_id, ad_group_external_id, name, status, raw_json
        FROM ads
        WHERE connected_account_id = ?
          AND ad_group_external_id = ?
        ORDER BY name ASC, external_id ASC;
      "#,
    )
    .bind(account_id)
    .bind(ad_group_external_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|(external_id, ad_group_external_id, name, status, raw)| Ad {
          external_id,
          ad_group_external_id,
          name,
          status,
          raw: raw.0,
        })
        .collect(),
    )
  }

  async fn list_performance(
    &self,
    account_id: i64,
    scope_level: ScopeLevel,
    scope_id: Option<&str>,
    range: DateRange,
  ) -> Result<Vec<PerformanceRecord>, StoreError> {
    let sql = format!(
      "SELECT {PERFORMANCE_COLUMNS} FROM performance_daily \
       WHERE connected_account_id = ? \
         AND scope_level = ? \
         AND (? IS NULL OR scope_id = ?) \
         AND dt BETWEEN ? AND ? \
       ORDER BY dt ASC, scope_id ASC;"
    );
    let rows = sqlx::query(&sql)
      .bind(account_id)
      .bind(scope_level.as_str())
      .bind(scope_id)
      .bind(scope_id)
      .bind(range.since)
      .bind(range.until)
      .fetch_all(&self.pool)
      .await?;

    rows.iter().map(performance_from_row).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn account_rows_decode_provider_and_tokens() {
    let row: AccountRow = (
      3,
      "u1".to_string(),
      "analytics_platform".to_string(),
      "properties/9".to_string(),
      "Shop".to_string(),
      "access".to_string(),
      Some("  ".to_string()),
      None,
      true,
      None,
      None,
    );
    let account = account_from_row(row).unwrap();
    assert_eq!(account.provider, Provider::AnalyticsPlatform);
    assert!(account.refresh_token.is_none());
    assert!(account.metadata.is_object());
  }

  #[test]
  fn account_rows_reject_unknown_provider() {
    let row: AccountRow = (
      4,
      "u1".to_string(),
      "tiktok".to_string(),
      "b".to_string(),
      "B".to_string(),
      "access".to_string(),
      None,
      None,
      true,
      Some(Json(serde_json::json!({"ad_account_ids": ["act_1"]}))),
      None,
    );
    assert!(matches!(account_from_row(row), Err(StoreError::Database(_))));
  }

  #[test]
  fn schema_covers_every_table() {
    let ddl = SCHEMA.join("\n");
    for table in [
      "connected_accounts",
      "ad_campaigns",
      "ad_groups",
      "ads",
      "analytics_sites",
      "performance_daily",
    ] {
      assert!(ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")), "{table}");
    }
  }

  #[test]
  fn performance_upsert_overwrites_every_column() {
    let update = PERFORMANCE_UPSERT_SQL
      .split("ON DUPLICATE KEY UPDATE")
      .nth(1)
      .unwrap();
    assert!(!update.contains("COALESCE"));
    assert!(!update.contains("JSON_MERGE_PATCH"));
    for column in PERFORMANCE_COLUMNS.split(',').map(str::trim).skip(3) {
      assert!(update.contains(&format!("{column} = VALUES({column})")), "{column}");
    }
  }
}
