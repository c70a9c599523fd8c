//! Provider layer error types

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by adapters and the auth/catalog services.
///
/// Transport and auth failures keep the provider name and HTTP status as
/// structured fields so callers can branch on retryability (429 vs 401)
/// without string-parsing.
#[derive(Error, Debug)]
pub enum ProviderError {
  /// Network/HTTP failure, enriched at the call boundary
  #[error("{provider} request failed (HTTP {status}): {message}")]
  Transport {
    provider: String,
    status: u16,
    message: String,
    /// Vendor error code when the body carried one
    code: Option<String>,
    /// Decoded vendor error body, if any
    error_details: Option<Value>,
  },

  /// Authentication failed (401/403)
  #[error("{provider} authentication failed (HTTP {status}): {message}")]
  Auth {
    provider: String,
    status: u16,
    message: String,
  },

  /// Vendor returned a 200 with an embedded error object
  #[error("{provider} error: {message}")]
  VendorProtocol {
    provider: String,
    message: String,
    code: Option<String>,
  },

  /// Streaming error
  #[error("stream error: {0}")]
  Stream(String),

  /// Invalid response from provider
  #[error("invalid response: {0}")]
  InvalidResponse(String),

  /// Configuration error
  #[error("configuration error: {0}")]
  Config(String),

  /// Every quota-fallback profile is cooling down or over limit
  #[error("all configured providers are unavailable")]
  AllProvidersUnavailable,

  /// Network error
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  /// JSON parse error
  #[error("JSON parse error: {0}")]
  Json(#[from] serde_json::Error),
}

/// Alias for Result<T, ProviderError>
pub type Result<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
  /// Builds a Transport or Auth error from an HTTP status and raw body.
  ///
  /// The body is probed for the common `{"error":{"message","code"}}` shape
  /// so the vendor message survives wrapping.
  pub fn from_http(provider: &str, status: u16, body: &str) -> Self {
    let decoded = serde_json::from_str::<Value>(body).ok();
    let (message, code) = match decoded.as_ref().and_then(|v| v.get("error")) {
      Some(err) => (
        err
          .get("message")
          .and_then(Value::as_str)
          .unwrap_or(body)
          .to_string(),
        err
          .get("code")
          .map(|c| c.to_string().trim_matches('"').to_string()),
      ),
      None => (body.to_string(), None),
    };

    if status == 401 || status == 403 {
      return Self::Auth {
        provider: provider.to_string(),
        status,
        message,
      };
    }

    Self::Transport {
      provider: provider.to_string(),
      status,
      message,
      code,
      error_details: decoded,
    }
  }

  /// HTTP status, when this error carries one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Transport { status, .. } | Self::Auth { status, .. } => Some(*status),
      Self::Network(err) => err.status().map(|s| s.as_u16()),
      _ => None,
    }
  }

  /// True for 401/403, the only class adapters answer with a token refresh.
  pub fn is_auth(&self) -> bool {
    matches!(self.status(), Some(401) | Some(403)) || matches!(self, Self::Auth { .. })
  }

  /// True when a caller may reasonably retry: 429 or a 5xx.
  pub fn is_retryable(&self) -> bool {
    matches!(self.status(), Some(429) | Some(500..=599))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_http_extracts_vendor_message() {
    let body = r#"{"error":{"message":"rate limited","code":"rate_limit_exceeded"}}"#;
    let err = ProviderError::from_http("openrouter", 429, body);
    match &err {
      ProviderError::Transport {
        provider,
        status,
        message,
        code,
        ..
      } => {
        assert_eq!(provider, "openrouter");
        assert_eq!(*status, 429);
        assert_eq!(message, "rate limited");
        assert_eq!(code.as_deref(), Some("rate_limit_exceeded"));
      }
      other => panic!("expected transport error, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(!err.is_auth());
  }

  #[test]
  fn test_from_http_auth_classification() {
    let err = ProviderError::from_http("copilot", 401, "unauthorized");
    assert!(err.is_auth());
    assert!(!err.is_retryable());
    assert_eq!(err.status(), Some(401));
  }

  #[test]
  fn test_from_http_plain_body() {
    let err = ProviderError::from_http("cerebras", 500, "upstream exploded");
    match err {
      ProviderError::Transport { message, code, .. } => {
        assert_eq!(message, "upstream exploded");
        assert!(code.is_none());
      }
      other => panic!("expected transport error, got {other:?}"),
    }
  }
}
