//! MCP server authentication
//!
//! OAuth authorization-code + PKCE against endpoints declared by each MCP
//! server, with token state persisted in a secret store keyed by a stable
//! hash of the server identity.

pub mod callback;
pub mod oauth;
pub mod storage;

pub use callback::{CallbackParams, CallbackServer};
pub use oauth::{AuthServerMetadata, McpOAuthClient};
pub use storage::{CredentialStorage, FileCredentialStorage, MemoryCredentialStorage};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
  #[error("metadata discovery failed: {0}")]
  Discovery(String),

  #[error("client registration failed: {0}")]
  Registration(String),

  #[error("token exchange failed: {0}")]
  Exchange(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("callback error: {0}")]
  Callback(String),

  #[error("no authorization pending for this server")]
  NoPendingAuthorization,

  #[error("authorization timed out")]
  Timeout,

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),
}

/// Authentication result
pub type Result<T> = std::result::Result<T, AuthError>;

/// Stable storage key for one `(server_name, server_url)` identity.
pub fn server_key(server_name: &str, server_url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(server_name.as_bytes());
  hasher.update(b"|");
  hasher.update(server_url.as_bytes());
  let digest = hasher.finalize();
  digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// OAuth tokens for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
  pub access_token: String,
  #[serde(default)]
  pub refresh_token: Option<String>,
  #[serde(default)]
  pub expires_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub scope: Option<String>,
}

impl OAuthTokens {
  /// True within a 60-second buffer of expiry.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self
      .expires_at
      .is_some_and(|at| now + Duration::seconds(60) >= at)
  }
}

/// Dynamic client registration result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRegistration {
  pub client_id: String,
  #[serde(default)]
  pub client_secret: Option<String>,
}

/// Everything persisted for one server: tokens, registration, PKCE verifier
/// and pending-authorization state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpAuthRecord {
  #[serde(default)]
  pub tokens: Option<OAuthTokens>,
  #[serde(default)]
  pub client: Option<ClientRegistration>,
  #[serde(default)]
  pub verifier: Option<String>,
  #[serde(default)]
  pub pending_state: Option<String>,
}
