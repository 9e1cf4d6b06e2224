//! Validated, idempotent writes of normalized records.

use std::sync::Arc;

use serde::Serialize;

use crate::error::StoreError;
use crate::models::{Ad, AdGroup, Campaign, PerformanceRecord, Site};
use crate::store::{SyncStore, UpsertOutcome};

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
  pub inserted: u64,
  pub updated: u64,
  pub unchanged: u64,
}

impl UpsertCounts {
  pub fn record(&mut self, outcome: UpsertOutcome) {
    match outcome {
      UpsertOutcome::Inserted => self.inserted += 1,
      UpsertOutcome::Updated => self.updated += 1,
      UpsertOutcome::Unchanged => self.unchanged += 1,
    }
  }

  pub fn total(&self) -> u64 {
    self.inserted + self.updated + self.unchanged
  }

  pub fn add(&mut self, other: &UpsertCounts) {
    self.inserted += other.inserted;
    self.updated += other.updated;
    self.unchanged += other.unchanged;
  }
}

fn check_id(field: &str, value: &str) -> Result<(), StoreError> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(StoreError::ConstraintViolation(format!("{field} must not be empty")));
  }
  if trimmed.len() > MAX_ID_LEN {
    return Err(StoreError::ConstraintViolation(format!(
      "{field} longer than {MAX_ID_LEN} characters"
    )));
  }
  Ok(())
}

fn check_name(field: &str, value: &str) -> Result<(), StoreError> {
  if value.trim().is_empty() {
    return Err(StoreError::ConstraintViolation(format!("{field} must not be empty")));
  }
  Ok(())
}

fn check_performance(record: &PerformanceRecord) -> Result<(), StoreError> {
  check_id("scope_id", &record.scope_id)?;

  for (name, value) in record.metrics.counters() {
    if let Some(v) = value {
      if v < 0 {
        return Err(StoreError::ConstraintViolation(format!(
          "{name} must not be negative ({} {} {})",
          record.scope_level, record.scope_id, record.dt
        )));
      }
    }
  }
  for (name, value) in record.metrics.ratios() {
    if let Some(v) = value {
      if !v.is_finite() || v < 0.0 {
        return Err(StoreError::ConstraintViolation(format!(
          "{name} must be a finite non-negative number ({} {} {})",
          record.scope_level, record.scope_id, record.dt
        )));
      }
    }
  }
  if !record.breakdowns.is_object() || !record.raw.is_object() {
    return Err(StoreError::ConstraintViolation(
      "breakdowns and raw payloads must be JSON objects".to_string(),
    ));
  }
  Ok(())
}

/// Writes one connected account's records and tallies the outcomes.
pub struct Persister {
  store: Arc<dyn SyncStore>,
  account_id: i64,
  pub entities: UpsertCounts,
  pub performance: UpsertCounts,
}

impl Persister {
  pub fn new(store: Arc<dyn SyncStore>, account_id: i64) -> Self {
    Self {
      store,
      account_id,
      entities: UpsertCounts::default(),
      performance: UpsertCounts::default(),
    }
  }

  pub async fn upsert_campaign(&mut self, campaign: &Campaign) -> Result<UpsertOutcome, StoreError> {
    check_id("campaign id", &campaign.external_id)?;
    check_id("ad account id", &campaign.ad_account_id)?;
    check_name("campaign name", &campaign.name)?;
    let outcome = self.store.upsert_campaign(self.account_id, campaign).await?;
    self.entities.record(outcome);
    Ok(outcome)
  }

  pub async fn upsert_ad_group(&mut self, ad_group: &AdGroup) -> Result<UpsertOutcome, StoreError> {
    check_id("ad group id", &ad_group.external_id)?;
    check_id("campaign id", &ad_group.campaign_external_id)?;
    check_name("ad group name", &ad_group.name)?;
    let outcome = self.store.upsert_ad_group(self.account_id, ad_group).await?;
    self.entities.record(outcome);
    Ok(outcome)
  }

  pub async fn upsert_ad(&mut self, ad: &Ad) -> Result<UpsertOutcome, StoreError> {
    check_id("ad id", &ad.external_id)?;
    check_id("ad group id", &ad.ad_group_external_id)?;
    check_name("ad name", &ad.name)?;
    let outcome = self.store.upsert_ad(self.account_id, ad).await?;
    self.entities.record(outcome);
    Ok(outcome)
  }

  pub async fn upsert_site(&mut self, site: &Site) -> Result<UpsertOutcome, StoreError> {
    check_id("property id", &site.property_id)?;
    check_name("site name", &site.name)?;
    let outcome = self.store.upsert_site(self.account_id, site).await?;
    self.entities.record(outcome);
    Ok(outcome)
  }

  pub async fn upsert_performance(&mut self, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
    check_performance(record)?;
    let outcome = self.store.upsert_performance(self.account_id, record).await?;
    self.performance.record(outcome);
    Ok(outcome)
  }

  /// Folds one breakdown dimension into the daily site row without touching
  /// its aggregate metrics.
  pub async fn merge_site_breakdowns(&mut self, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
    check_performance(record)?;
    let outcome = self.store.merge_breakdowns(self.account_id, record).await?;
    self.performance.record(outcome);
    Ok(outcome)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Metrics, ScopeLevel};
  use crate::store::memory::MemoryStore;
  use chrono::NaiveDate;
  use serde_json::json;

  fn record(scope_id: &str, metrics: Metrics) -> PerformanceRecord {
    PerformanceRecord {
      dt: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
      scope_level: ScopeLevel::Campaign,
      scope_id: scope_id.to_string(),
      metrics,
      breakdowns: json!({}),
      raw: json!({}),
    }
  }

  fn campaign(id: &str) -> Campaign {
    Campaign {
      external_id: id.to_string(),
      ad_account_id: "act_1".to_string(),
      name: format!("Campaign {id}"),
      status: "active".to_string(),
      raw: json!({"id": id}),
    }
  }

  #[tokio::test]
  async fn counts_inserted_then_unchanged_then_updated() {
    let store = Arc::new(MemoryStore::default());
    let mut persister = Persister::new(store.clone(), 1);

    assert_eq!(persister.upsert_campaign(&campaign("C1")).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(persister.upsert_campaign(&campaign("C1")).await.unwrap(), UpsertOutcome::Unchanged);

    let mut renamed = campaign("C1");
    renamed.name = "Renamed".to_string();
    assert_eq!(persister.upsert_campaign(&renamed).await.unwrap(), UpsertOutcome::Updated);

    assert_eq!(
      persister.entities,
      UpsertCounts {
        inserted: 1,
        updated: 1,
        unchanged: 1
      }
    );
    assert_eq!(store.campaign_count(), 1);
  }

  #[tokio::test]
  async fn rejects_empty_ids_before_writing() {
    let store = Arc::new(MemoryStore::default());
    let mut persister = Persister::new(store.clone(), 1);

    let err = persister.upsert_campaign(&campaign("  ")).await.unwrap_err();
    assert!(matches!(err, StoreError::ConstraintViolation(_)));
    assert!(store.writes().is_empty());
  }

  #[tokio::test]
  async fn rejects_negative_and_non_finite_metrics() {
    let store = Arc::new(MemoryStore::default());
    let mut persister = Persister::new(store.clone(), 1);

    let negative = record(
      "C1",
      Metrics {
        clicks: Some(-1),
        ..Default::default()
      },
    );
    assert!(matches!(
      persister.upsert_performance(&negative).await,
      Err(StoreError::ConstraintViolation(_))
    ));

    let nan = record(
      "C1",
      Metrics {
        spend: Some(f64::NAN),
        ..Default::default()
      },
    );
    assert!(matches!(
      persister.upsert_performance(&nan).await,
      Err(StoreError::ConstraintViolation(_))
    ));
    assert!(store.performance_rows().is_empty());
    assert_eq!(persister.performance.total(), 0);
  }

  #[tokio::test]
  async fn resync_overwrites_performance_row() {
    let store = Arc::new(MemoryStore::default());
    let mut persister = Persister::new(store.clone(), 1);

    let mut first = record(
      "A1",
      Metrics {
        impressions: Some(100),
        conversions: Some(3.0),
        ..Default::default()
      },
    );
    first.scope_level = ScopeLevel::Ad;
    first.raw = json!({"ads_platform": {"actions": [{"action_type": "purchase", "value": "3"}]}});
    persister.upsert_performance(&first).await.unwrap();

    let mut second = first.clone();
    second.metrics.conversions = None;
    second.raw = json!({"ads_platform": {"impressions": "100"}});
    assert_eq!(persister.upsert_performance(&second).await.unwrap(), UpsertOutcome::Updated);

    let rows = store.performance_rows();
    assert_eq!(rows[0].metrics.conversions, None);
    assert!(rows[0].raw["ads_platform"].get("actions").is_none());
    assert_eq!(persister.performance.inserted, 1);
    assert_eq!(persister.performance.updated, 1);
  }
}
