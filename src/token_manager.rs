use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};

use crate::error::TokenError;
use crate::models::{AccessToken, ConnectedAccount};
use crate::providers::oauth::TokenRefresher;
use crate::store::SyncStore;

/// Hands out usable access tokens, refreshing and persisting them when needed.
///
/// Refreshes for one account are serialized inside the process. Across
/// processes the persisted write is conditional on the token that was
/// refreshed, and the loser adopts the winner's token.
pub struct TokenManager {
  store: Arc<dyn SyncStore>,
  refresher: Arc<dyn TokenRefresher>,
  leeway: Duration,
  locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
  pub fn new(store: Arc<dyn SyncStore>, refresher: Arc<dyn TokenRefresher>, leeway: Duration) -> Self {
    Self {
      store,
      refresher,
      leeway,
      locks: Mutex::new(HashMap::new()),
    }
  }

  fn account_lock(&self, account_id: i64) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(account_id).or_default().clone()
  }

  pub async fn ensure_valid_token(&self, account: &ConnectedAccount) -> Result<AccessToken, TokenError> {
    if account.token_is_fresh(Utc::now(), self.leeway) {
      return Ok(account.access_token.clone());
    }
    self.refresh(account, &account.access_token, false).await
  }

  /// Refreshes after the provider rejected `rejected`, unless another task
  /// already replaced it.
  pub async fn force_refresh(
    &self,
    account: &ConnectedAccount,
    rejected: &AccessToken,
  ) -> Result<AccessToken, TokenError> {
    self.refresh(account, rejected, true).await
  }

  async fn refresh(
    &self,
    account: &ConnectedAccount,
    stale: &AccessToken,
    forced: bool,
  ) -> Result<AccessToken, TokenError> {
    let lock = self.account_lock(account.id);
    let _guard = lock.lock().await;

    let current = self
      .store
      .fetch_account(account.id)
      .await?
      .ok_or_else(|| TokenError::ReauthRequired(format!("connected account {} no longer exists", account.id)))?;

    if !current.connected {
      return Err(TokenError::ReauthRequired(format!("connected account {} is disconnected", account.id)));
    }

    if current.access_token != *stale && (forced || current.token_is_fresh(Utc::now(), self.leeway)) {
      tracing::debug!(account_id = account.id, provider = %account.provider, "token already refreshed by another task");
      return Ok(current.access_token);
    }
    if !forced && current.token_is_fresh(Utc::now(), self.leeway) {
      return Ok(current.access_token);
    }

    let Some(refresh_token) = current.refresh_token.clone() else {
      tracing::warn!(account_id = account.id, provider = %account.provider, "no refresh token stored, reauthorization required");
      return Err(TokenError::ReauthRequired("no refresh token stored".to_string()));
    };

    tracing::info!(account_id = account.id, provider = %account.provider, forced, "refreshing access token");

    let refreshed = match self.refresher.refresh(&current, &refresh_token).await {
      Ok(tokens) => tokens,
      Err(err) => {
        tracing::warn!(account_id = account.id, provider = %account.provider, error = %err, "token refresh failed");
        return Err(err);
      }
    };

    let persisted = self
      .store
      .replace_tokens_if_current(account.id, &current.access_token, &refreshed)
      .await?;

    if persisted {
      return Ok(refreshed.access_token);
    }

    tracing::info!(account_id = account.id, provider = %account.provider, "concurrent refresh won, adopting stored token");
    let winner = self
      .store
      .fetch_account(account.id)
      .await?
      .ok_or_else(|| TokenError::ReauthRequired(format!("connected account {} no longer exists", account.id)))?;
    Ok(winner.access_token)
  }
}
