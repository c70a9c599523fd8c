//! MCP OAuth client: authorization-code flow with PKCE.
//!
//! MCP servers declare their own authorization servers; the client discovers
//! the metadata, registers dynamically when the server supports it, and runs
//! the S256 code flow. All state (tokens, registration, verifier, pending
//! authorization) persists through [CredentialStorage] so a flow can complete
//! across process restarts.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::storage::CredentialStorage;
use super::{
  AuthError, ClientRegistration, McpAuthRecord, OAuthTokens, Result, server_key,
};

/// Authorization-server metadata, per RFC 8414 discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
  pub authorization_endpoint: String,
  pub token_endpoint: String,
  #[serde(default)]
  pub registration_endpoint: Option<String>,
}

pub struct McpOAuthClient {
  client: Client,
  storage: Arc<dyn CredentialStorage>,
  server_name: String,
  server_url: String,
}

impl McpOAuthClient {
  pub fn new(
    storage: Arc<dyn CredentialStorage>,
    server_name: impl Into<String>,
    server_url: impl Into<String>,
  ) -> Self {
    let client = Client::builder()
      .timeout(std::time::Duration::from_secs(30))
      .build()
      .unwrap_or_else(|_| Client::new());
    Self {
      client,
      storage,
      server_name: server_name.into(),
      server_url: server_url.into(),
    }
  }

  fn key(&self) -> String {
    server_key(&self.server_name, &self.server_url)
  }

  async fn record(&self) -> Result<McpAuthRecord> {
    Ok(self.storage.load(&self.key()).await?.unwrap_or_default())
  }

  async fn store(&self, record: McpAuthRecord) -> Result<()> {
    self.storage.save(&self.key(), record).await
  }

  /// Fetches authorization-server metadata from the server origin.
  pub async fn discover_metadata(&self) -> Result<AuthServerMetadata> {
    let origin = origin_of(&self.server_url)?;
    let url = format!("{origin}/.well-known/oauth-authorization-server");
    let response = self.client.get(&url).send().await?;
    if !response.status().is_success() {
      return Err(AuthError::Discovery(format!(
        "HTTP {} from {url}",
        response.status()
      )));
    }
    let metadata: AuthServerMetadata = response
      .json()
      .await
      .map_err(|e| AuthError::Discovery(e.to_string()))?;
    Ok(metadata)
  }

  /// Registered client id, registering dynamically on first use.
  pub async fn ensure_client(
    &self,
    metadata: &AuthServerMetadata,
    redirect_uri: &str,
  ) -> Result<ClientRegistration> {
    let mut record = self.record().await?;
    if let Some(client) = record.client {
      return Ok(client);
    }

    let endpoint = metadata
      .registration_endpoint
      .as_ref()
      .ok_or_else(|| AuthError::Registration("server offers no registration endpoint".to_string()))?;

    let response = self
      .client
      .post(endpoint)
      .json(&json!({
        "client_name": "llmux",
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
      }))
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(AuthError::Registration(format!(
        "HTTP {}",
        response.status()
      )));
    }
    let body: Value = response.json().await?;
    let registration = ClientRegistration {
      client_id: body
        .get("client_id")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::Registration("response missing client_id".to_string()))?
        .to_string(),
      client_secret: body
        .get("client_secret")
        .and_then(Value::as_str)
        .map(ToString::to_string),
    };

    record = self.record().await?;
    record.client = Some(registration.clone());
    self.store(record).await?;
    debug!(server = %self.server_name, "registered oauth client");
    Ok(registration)
  }

  /// Builds the authorization URL and persists the PKCE verifier and state.
  pub async fn begin_authorization(
    &self,
    metadata: &AuthServerMetadata,
    redirect_uri: &str,
  ) -> Result<String> {
    let registration = self.ensure_client(metadata, redirect_uri).await?;

    let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    let state = Uuid::new_v4().simple().to_string();

    let mut record = self.record().await?;
    record.verifier = Some(verifier);
    record.pending_state = Some(state.clone());
    self.store(record).await?;

    let mut url = Url::parse(&metadata.authorization_endpoint)
      .map_err(|e| AuthError::Discovery(e.to_string()))?;
    url
      .query_pairs_mut()
      .append_pair("response_type", "code")
      .append_pair("client_id", &registration.client_id)
      .append_pair("redirect_uri", redirect_uri)
      .append_pair("code_challenge", &challenge)
      .append_pair("code_challenge_method", "S256")
      .append_pair("state", &state);
    Ok(url.to_string())
  }

  /// Exchanges an authorization code, verifying the callback state.
  pub async fn exchange_code(
    &self,
    metadata: &AuthServerMetadata,
    code: &str,
    state: &str,
    redirect_uri: &str,
  ) -> Result<OAuthTokens> {
    let mut record = self.record().await?;
    let pending = record
      .pending_state
      .take()
      .ok_or(AuthError::NoPendingAuthorization)?;
    if pending != state {
      return Err(AuthError::Exchange("state mismatch".to_string()));
    }
    let verifier = record
      .verifier
      .take()
      .ok_or(AuthError::NoPendingAuthorization)?;
    let client_id = record
      .client
      .as_ref()
      .map(|c| c.client_id.clone())
      .unwrap_or_default();

    let form = [
      ("grant_type", "authorization_code"),
      ("code", code),
      ("redirect_uri", redirect_uri),
      ("client_id", &client_id),
      ("code_verifier", &verifier),
    ];
    let tokens = self.token_request(&metadata.token_endpoint, &form).await?;

    record.tokens = Some(tokens.clone());
    self.store(record).await?;
    Ok(tokens)
  }

  /// Refreshes the stored tokens.
  pub async fn refresh_tokens(&self, metadata: &AuthServerMetadata) -> Result<OAuthTokens> {
    let mut record = self.record().await?;
    let refresh_token = record
      .tokens
      .as_ref()
      .and_then(|t| t.refresh_token.clone())
      .ok_or_else(|| AuthError::Exchange("no refresh token stored".to_string()))?;
    let client_id = record
      .client
      .as_ref()
      .map(|c| c.client_id.clone())
      .unwrap_or_default();

    let form = [
      ("grant_type", "refresh_token"),
      ("refresh_token", &refresh_token),
      ("client_id", &client_id),
    ];
    let mut tokens = self.token_request(&metadata.token_endpoint, &form).await?;
    // Servers may omit the refresh token on rotation
    if tokens.refresh_token.is_none() {
      tokens.refresh_token = Some(refresh_token);
    }

    record.tokens = Some(tokens.clone());
    self.store(record).await?;
    Ok(tokens)
  }

  /// Valid stored access token, if any; `None` when absent or expired.
  pub async fn access_token(&self) -> Result<Option<String>> {
    let record = self.record().await?;
    Ok(record.tokens.and_then(|tokens| {
      if tokens.is_expired(Utc::now()) {
        None
      } else {
        Some(tokens.access_token)
      }
    }))
  }

  async fn token_request(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<OAuthTokens> {
    let response = self
      .client
      .post(endpoint)
      .header("Accept", "application/json")
      .form(form)
      .send()
      .await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
      return Err(AuthError::Exchange(format!("HTTP {status}: {body}")));
    }

    let value: Value = serde_json::from_str(&body)?;
    let access_token = value
      .get("access_token")
      .and_then(Value::as_str)
      .ok_or_else(|| AuthError::Exchange("response missing access_token".to_string()))?
      .to_string();
    let expires_at = value
      .get("expires_in")
      .and_then(Value::as_i64)
      .map(|secs| Utc::now() + Duration::seconds(secs));
    Ok(OAuthTokens {
      access_token,
      refresh_token: value
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(ToString::to_string),
      expires_at,
      scope: value.get("scope").and_then(Value::as_str).map(ToString::to_string),
    })
  }
}

fn origin_of(server_url: &str) -> Result<String> {
  let url = Url::parse(server_url).map_err(|e| AuthError::Discovery(e.to_string()))?;
  let origin = url.origin();
  if matches!(origin, url::Origin::Opaque(_)) {
    return Err(AuthError::Discovery(format!(
      "server url has no origin: {server_url}"
    )));
  }
  Ok(origin.ascii_serialization())
}
