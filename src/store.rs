//! Persistence seam between the sync pipeline and the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{
  AccessToken, Ad, AdGroup, Campaign, ConnectedAccount, DateRange, PerformanceRecord, Provider,
  RefreshedTokens, ScopeLevel, Site,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
  Inserted,
  Updated,
  Unchanged,
}

/// How a performance write combines with the row already stored under the
/// same natural key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerformanceWrite {
  /// Metrics and raw payload are overwritten.
  Resync,
  /// Only the breakdown dimensions carried by the record are replaced.
  Breakdowns,
}

/// The row to write for `incoming` and how the write classifies. Callers skip
/// the write when the outcome is `Unchanged`.
pub fn plan_performance_write(
  existing: Option<&PerformanceRecord>,
  incoming: &PerformanceRecord,
  mode: PerformanceWrite,
) -> (PerformanceRecord, UpsertOutcome) {
  let Some(existing) = existing else {
    return (incoming.clone(), UpsertOutcome::Inserted);
  };
  let mut next = existing.clone();
  match mode {
    PerformanceWrite::Resync => next.apply_resync(incoming),
    PerformanceWrite::Breakdowns => next.apply_breakdowns(incoming),
  }
  let outcome = if &next == existing {
    UpsertOutcome::Unchanged
  } else {
    UpsertOutcome::Updated
  };
  (next, outcome)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountFilter {
  pub account_id: Option<i64>,
  pub provider: Option<Provider>,
}

impl AccountFilter {
  pub fn matches(&self, account: &ConnectedAccount) -> bool {
    account.connected
      && self.account_id.is_none_or(|id| id == account.id)
      && self.provider.is_none_or(|p| p == account.provider)
  }
}

#[async_trait]
pub trait SyncStore: Send + Sync {
  /// Connected accounts matching `filter`, ordered by id.
  async fn list_connected_accounts(&self, filter: &AccountFilter) -> Result<Vec<ConnectedAccount>, StoreError>;

  async fn fetch_account(&self, account_id: i64) -> Result<Option<ConnectedAccount>, StoreError>;

  /// Writes refreshed token material only if the stored access token is still
  /// `expected`. Returns `false` when another writer got there first. A `None`
  /// refresh token keeps the stored one.
  async fn replace_tokens_if_current(
    &self,
    account_id: i64,
    expected: &AccessToken,
    tokens: &RefreshedTokens,
  ) -> Result<bool, StoreError>;

  async fn mark_synced(&self, account_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

  async fn upsert_campaign(&self, account_id: i64, campaign: &Campaign) -> Result<UpsertOutcome, StoreError>;

  async fn upsert_ad_group(&self, account_id: i64, ad_group: &AdGroup) -> Result<UpsertOutcome, StoreError>;

  async fn upsert_ad(&self, account_id: i64, ad: &Ad) -> Result<UpsertOutcome, StoreError>;

  async fn upsert_site(&self, account_id: i64, site: &Site) -> Result<UpsertOutcome, StoreError>;

  /// Overwrites metrics and raw payload for the record's natural key. Stored
  /// breakdown dimensions the record does not carry are kept.
  async fn upsert_performance(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError>;

  /// Replaces the breakdown dimensions carried by `record`, leaving metrics and
  /// raw payload as stored. Inserts the record as-is when no row exists yet.
  async fn merge_breakdowns(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError>;

  async fn list_campaigns(&self, account_id: i64) -> Result<Vec<Campaign>, StoreError>;

  async fn list_ad_groups(&self, account_id: i64, campaign_external_id: &str) -> Result<Vec<AdGroup>, StoreError>;

  async fn list_ads(&self, account_id: i64, ad_group_external_id: &str) -> Result<Vec<Ad>, StoreError>;

  async fn list_performance(
    &self,
    account_id: i64,
    scope_level: ScopeLevel,
    scope_id: Option<&str>,
    range: DateRange,
  ) -> Result<Vec<PerformanceRecord>, StoreError>;
}

#[cfg(test)]
pub(crate) mod memory {
  use std::collections::{BTreeMap, HashSet};
  use std::sync::Mutex;

  use chrono::NaiveDate;

  use super::*;

  type PerfKey = (i64, NaiveDate, ScopeLevel, String);

  #[derive(Default)]
  struct Tables {
    accounts: BTreeMap<i64, ConnectedAccount>,
    campaigns: BTreeMap<(i64, String), Campaign>,
    ad_groups: BTreeMap<(i64, String), AdGroup>,
    ads: BTreeMap<(i64, String), Ad>,
    sites: BTreeMap<i64, Site>,
    performance: BTreeMap<PerfKey, PerformanceRecord>,
    writes: Vec<String>,
  }

  /// In-memory `SyncStore` with the same write and outcome semantics as MySQL.
  #[derive(Default)]
  pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Upserts for these external ids fail with a constraint violation.
    pub reject_ids: Mutex<HashSet<String>>,
    /// Every call fails as if the database were unreachable.
    pub offline: std::sync::atomic::AtomicBool,
  }

  fn upsert<K: Ord, V: PartialEq>(map: &mut BTreeMap<K, V>, key: K, value: V) -> UpsertOutcome {
    match map.get(&key) {
      None => {
        map.insert(key, value);
        UpsertOutcome::Inserted
      }
      Some(existing) if *existing == value => UpsertOutcome::Unchanged,
      Some(_) => {
        map.insert(key, value);
        UpsertOutcome::Updated
      }
    }
  }

  impl MemoryStore {
    pub fn with_accounts(accounts: Vec<ConnectedAccount>) -> Self {
      let store = MemoryStore::default();
      {
        let mut t = store.tables.lock().unwrap();
        for a in accounts {
          t.accounts.insert(a.id, a);
        }
      }
      store
    }

    pub fn reject(&self, external_id: &str) {
      self.reject_ids.lock().unwrap().insert(external_id.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self, external_id: &str) -> Result<(), StoreError> {
      if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
      }
      if self.reject_ids.lock().unwrap().contains(external_id) {
        return Err(StoreError::ConstraintViolation(format!("rejected {external_id}")));
      }
      Ok(())
    }

    pub fn account(&self, id: i64) -> Option<ConnectedAccount> {
      self.tables.lock().unwrap().accounts.get(&id).cloned()
    }

    /// Ordered log of successful writes, e.g. `campaign:C1`.
    pub fn writes(&self) -> Vec<String> {
      self.tables.lock().unwrap().writes.clone()
    }

    pub fn campaign_count(&self) -> usize {
      self.tables.lock().unwrap().campaigns.len()
    }

    pub fn ad_group_count(&self) -> usize {
      self.tables.lock().unwrap().ad_groups.len()
    }

    pub fn ad_count(&self) -> usize {
      self.tables.lock().unwrap().ads.len()
    }

    pub fn performance_rows(&self) -> Vec<PerformanceRecord> {
      self.tables.lock().unwrap().performance.values().cloned().collect()
    }

    pub fn campaign_ids(&self) -> Vec<String> {
      self
        .tables
        .lock()
        .unwrap()
        .campaigns
        .values()
        .map(|c| c.external_id.clone())
        .collect()
    }

    fn write_performance(
      &self,
      account_id: i64,
      record: &PerformanceRecord,
      mode: PerformanceWrite,
    ) -> Result<UpsertOutcome, StoreError> {
      self.check(&record.scope_id)?;
      let mut t = self.tables.lock().unwrap();
      let key = (account_id, record.dt, record.scope_level, record.scope_id.clone());
      let (next, out) = plan_performance_write(t.performance.get(&key), record, mode);
      if out != UpsertOutcome::Unchanged {
        t.performance.insert(key, next);
      }
      t.writes.push(format!("performance:{}:{}:{}", record.scope_level, record.scope_id, record.dt));
      Ok(out)
    }

    pub fn site(&self, account_id: i64) -> Option<Site> {
      self.tables.lock().unwrap().sites.get(&account_id).cloned()
    }
  }

  #[async_trait]
  impl SyncStore for MemoryStore {
    async fn list_connected_accounts(&self, filter: &AccountFilter) -> Result<Vec<ConnectedAccount>, StoreError> {
      self.check("")?;
      Ok(
        self
          .tables
          .lock()
          .unwrap()
          .accounts
          .values()
          .filter(|a| filter.matches(a))
          .cloned()
          .collect(),
      )
    }

    async fn fetch_account(&self, account_id: i64) -> Result<Option<ConnectedAccount>, StoreError> {
      self.check("")?;
      Ok(self.account(account_id))
    }

    async fn replace_tokens_if_current(
      &self,
      account_id: i64,
      expected: &AccessToken,
      tokens: &RefreshedTokens,
    ) -> Result<bool, StoreError> {
      self.check("")?;
      let mut t = self.tables.lock().unwrap();
      let Some(account) = t.accounts.get_mut(&account_id) else {
        return Ok(false);
      };
      if account.access_token != *expected {
        return Ok(false);
      }
      account.access_token = tokens.access_token.clone();
      if let Some(refresh) = &tokens.refresh_token {
        account.refresh_token = Some(refresh.clone());
      }
      account.expires_at = tokens.expires_at;
      Ok(true)
    }

    async fn mark_synced(&self, account_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
      self.check("")?;
      if let Some(a) = self.tables.lock().unwrap().accounts.get_mut(&account_id) {
        a.last_synced_at = Some(at);
      }
      Ok(())
    }

    async fn upsert_campaign(&self, account_id: i64, campaign: &Campaign) -> Result<UpsertOutcome, StoreError> {
      self.check(&campaign.external_id)?;
      let mut t = self.tables.lock().unwrap();
      let out = upsert(&mut t.campaigns, (account_id, campaign.external_id.clone()), campaign.clone());
      t.writes.push(format!("campaign:{}", campaign.external_id));
      Ok(out)
    }

    async fn upsert_ad_group(&self, account_id: i64, ad_group: &AdGroup) -> Result<UpsertOutcome, StoreError> {
      self.check(&ad_group.external_id)?;
      let mut t = self.tables.lock().unwrap();
      let out = upsert(&mut t.ad_groups, (account_id, ad_group.external_id.clone()), ad_group.clone());
      t.writes.push(format!("adgroup:{}", ad_group.external_id));
      Ok(out)
    }

    async fn upsert_ad(&self, account_id: i64, ad: &Ad) -> Result<UpsertOutcome, StoreError> {
      self.check(&ad.external_id)?;
      let mut t = self.tables.lock().unwrap();
      let out = upsert(&mut t.ads, (account_id, ad.external_id.clone()), ad.clone());
      t.writes.push(format!("ad:{}", ad.external_id));
      Ok(out)
    }

    async fn upsert_site(&self, account_id: i64, site: &Site) -> Result<UpsertOutcome, StoreError> {
      self.check(&site.property_id)?;
      let mut t = self.tables.lock().unwrap();
      let out = upsert(&mut t.sites, account_id, site.clone());
      t.writes.push(format!("site:{}", site.property_id));
      Ok(out)
    }

    async fn upsert_performance(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
      self.write_performance(account_id, record, PerformanceWrite::Resync)
    }

    async fn merge_breakdowns(&self, account_id: i64, record: &PerformanceRecord) -> Result<UpsertOutcome, StoreError> {
      self.write_performance(account_id, record, PerformanceWrite::Breakdowns)
    }

    async fn list_campaigns(&self, account_id: i64) -> Result<Vec<Campaign>, StoreError> {
      self.check("")?;
      let t = self.tables.lock().unwrap();
      Ok(
        t.campaigns
          .iter()
          .filter(|((id, _), _)| *id == account_id)
          .map(|(_, c)| c.clone())
          .collect(),
      )
    }

    async fn list_ad_groups(&self, account_id: i64, campaign_external_id: &str) -> Result<Vec<AdGroup>, StoreError> {
      self.check("")?;
      let t = self.tables.lock().unwrap();
      Ok(
        t.ad_groups
          .iter()
          .filter(|((id, _), g)| *id == account_id && g.campaign_external_id == campaign_external_id)
          .map(|(_, g)| g.clone())
          .collect(),
      )
    }

    async fn list_ads(&self, account_id: i64, ad_group_external_id: &str) -> Result<Vec<Ad>, StoreError> {
      self.check("")?;
      let t = self.tables.lock().unwrap();
      Ok(
        t.ads
          .iter()
          .filter(|((id, _), a)| *id == account_id && a.ad_group_external_id == ad_group_external_id)
          .map(|(_, a)| a.clone())
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
      self.check("")?;
      let t = self.tables.lock().unwrap();
      Ok(
        t.performance
          .iter()
          .filter(|((id, dt, level, sid), _)| {
            *id == account_id
              && *level == scope_level
              && *dt >= range.since
              && *dt <= range.until
              && scope_id.is_none_or(|s| s == sid.as_str())
          })
          .map(|(_, r)| r.clone())
          .collect(),
      )
    }
  }
}
