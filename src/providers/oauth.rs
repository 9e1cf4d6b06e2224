//! Token refresh grants for each provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hyper::Method;
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType};
use oauth2::{
  ClientId, ClientSecret, EndpointNotSet, EndpointSet, RequestTokenError, TokenResponse, TokenUrl,
};
use serde_json::Value;

use crate::config::{ProviderCredentials, SyncConfig};
use crate::error::{ApiError, SyncError, TokenError};
use crate::http_client::{encode_query_value, send};
use crate::models::{AccessToken, ConnectedAccount, Provider, RefreshToken, RefreshedTokens};

pub type RefreshOAuthClient =
  BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[async_trait]
pub trait TokenRefresher: Send + Sync {
  async fn refresh(
    &self,
    account: &ConnectedAccount,
    refresh_token: &RefreshToken,
  ) -> Result<RefreshedTokens, TokenError>;
}

/// Standard `refresh_token` grant against an OAuth 2.0 token endpoint.
pub struct OAuthRefresher {
  client: RefreshOAuthClient,
  http: oauth2::reqwest::Client,
}

impl OAuthRefresher {
  pub fn new(credentials: &ProviderCredentials, token_url: &str) -> Result<Self, SyncError> {
    if credentials.client_id.trim().is_empty() || credentials.client_secret.trim().is_empty() {
      return Err(SyncError::Config("oauth client id/secret must not be empty".to_string()));
    }
    let token_url =
      TokenUrl::new(token_url.to_string()).map_err(|e| SyncError::Config(format!("invalid token url: {e}")))?;

    let client = BasicClient::new(ClientId::new(credentials.client_id.clone()))
      .set_client_secret(ClientSecret::new(credentials.client_secret.clone()))
      .set_token_uri(token_url);

    let http = oauth2::reqwest::ClientBuilder::new()
      .redirect(oauth2::reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| SyncError::Config(e.to_string()))?;

    Ok(Self { client, http })
  }
}

fn classify_grant_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> TokenError
where
  RE: std::error::Error + 'static,
{
  match err {
    RequestTokenError::ServerResponse(resp) => {
      let detail = match resp.error_description() {
        Some(desc) => format!("{}: {desc}", resp.error()),
        None => resp.error().to_string(),
      };
      match resp.error() {
        BasicErrorResponseType::InvalidGrant
        | BasicErrorResponseType::InvalidClient
        | BasicErrorResponseType::UnauthorizedClient => TokenError::ReauthRequired(detail),
        _ => TokenError::RefreshFailed(detail),
      }
    }
    RequestTokenError::Request(e) => TokenError::RefreshFailed(format!("token request failed: {e}")),
    RequestTokenError::Parse(e, _) => TokenError::RefreshFailed(format!("unreadable token response: {e}")),
    RequestTokenError::Other(msg) => TokenError::RefreshFailed(msg),
  }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
  async fn refresh(
    &self,
    account: &ConnectedAccount,
    refresh_token: &RefreshToken,
  ) -> Result<RefreshedTokens, TokenError> {
    let token = self
      .client
      .exchange_refresh_token(&oauth2::RefreshToken::new(refresh_token.secret().to_string()))
      .request_async(&self.http)
      .await
      .map_err(classify_grant_error)?;

    tracing::debug!(account_id = account.id, provider = %account.provider, "oauth refresh grant accepted");

    Ok(RefreshedTokens {
      access_token: AccessToken::new(token.access_token().secret().to_string()),
      refresh_token: token
        .refresh_token()
        .map(|t| RefreshToken::new(t.secret().to_string())),
      expires_at: token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d),
    })
  }
}

/// Graph API long-lived token exchange (`grant_type=fb_exchange_token`).
///
/// The stored refresh material is the current long-lived user token; a
/// successful exchange returns a new one, which also becomes the next refresh
/// material.
pub struct MetaTokenExchanger {
  base_url: String,
  version: String,
  credentials: ProviderCredentials,
}

impl MetaTokenExchanger {
  pub fn new(config: &SyncConfig, credentials: ProviderCredentials) -> Self {
    Self::with_base_url(&config.meta_graph_base_url, &config.meta_graph_version, credentials)
  }

  pub fn with_base_url(base_url: &str, version: &str, credentials: ProviderCredentials) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      version: version.trim_matches('/').to_string(),
      credentials,
    }
  }

  fn exchange_url(&self, refresh_token: &RefreshToken) -> String {
    format!(
      "{}/{}/oauth/access_token?grant_type=fb_exchange_token&client_id={}&client_secret={}&fb_exchange_token={}",
      self.base_url,
      self.version,
      encode_query_value(&self.credentials.client_id),
      encode_query_value(&self.credentials.client_secret),
      encode_query_value(refresh_token.secret()),
    )
  }
}

fn graph_error_message(json: &Value) -> Option<String> {
  json
    .get("error")
    .and_then(|e| e.get("message"))
    .and_then(|m| m.as_str())
    .map(str::to_string)
}

#[async_trait]
impl TokenRefresher for MetaTokenExchanger {
  async fn refresh(
    &self,
    account: &ConnectedAccount,
    refresh_token: &RefreshToken,
  ) -> Result<RefreshedTokens, TokenError> {
    let resp = send(Method::GET, &self.exchange_url(refresh_token), None, None)
      .await
      .map_err(|e| match e {
        ApiError::Provider { message, .. } => TokenError::RefreshFailed(message),
        other => TokenError::RefreshFailed(other.to_string()),
      })?;

    let json: Option<Value> = serde_json::from_slice(&resp.body).ok();

    if !resp.status.is_success() {
      let message = json
        .as_ref()
        .and_then(graph_error_message)
        .unwrap_or_else(|| resp.body_snippet(300));
      if resp.status.is_client_error() {
        return Err(TokenError::ReauthRequired(message));
      }
      return Err(TokenError::RefreshFailed(format!("status {}: {message}", resp.status.as_u16())));
    }

    let json = json.ok_or_else(|| TokenError::RefreshFailed("unreadable token response".to_string()))?;
    let access = json
      .get("access_token")
      .and_then(|v| v.as_str())
      .filter(|s| !s.is_empty())
      .ok_or_else(|| TokenError::RefreshFailed("token response missing access_token".to_string()))?;
    let expires_in = json.get("expires_in").and_then(|v| v.as_i64()).filter(|n| *n > 0);

    tracing::debug!(account_id = account.id, provider = %account.provider, "long-lived token exchanged");

    Ok(RefreshedTokens {
      access_token: AccessToken::new(access),
      refresh_token: Some(RefreshToken::new(access)),
      expires_at: expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
    })
  }
}

/// Routes a refresh to the grant registered for the account's provider.
#[derive(Default, Clone)]
pub struct ProviderRefreshers {
  pub ads: Option<Arc<dyn TokenRefresher>>,
  pub analytics: Option<Arc<dyn TokenRefresher>>,
}

impl ProviderRefreshers {
  pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
    let ads = config
      .meta_app
      .clone()
      .map(|creds| Arc::new(MetaTokenExchanger::new(config, creds)) as Arc<dyn TokenRefresher>);
    let analytics = match &config.google_app {
      Some(creds) => Some(Arc::new(OAuthRefresher::new(creds, &config.google_token_url)?) as Arc<dyn TokenRefresher>),
      None => None,
    };
    Ok(Self { ads, analytics })
  }

  fn for_provider(&self, provider: Provider) -> Option<&Arc<dyn TokenRefresher>> {
    match provider {
      Provider::AdsPlatform => self.ads.as_ref(),
      Provider::AnalyticsPlatform => self.analytics.as_ref(),
    }
  }
}

#[async_trait]
impl TokenRefresher for ProviderRefreshers {
  async fn refresh(
    &self,
    account: &ConnectedAccount,
    refresh_token: &RefreshToken,
  ) -> Result<RefreshedTokens, TokenError> {
    match self.for_provider(account.provider) {
      Some(refresher) => refresher.refresh(account, refresh_token).await,
      None => Err(TokenError::RefreshFailed(format!(
        "no client credentials configured for {}",
        account.provider
      ))),
    }
  }
}
