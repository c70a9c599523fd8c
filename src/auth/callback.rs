//! Local OAuth callback server.
//!
//! Binds 127.0.0.1 on the first free port in a fixed range, serves exactly
//! one callback request for the flow, answers a static HTML success page and
//! disposes itself. An idle flow self-terminates after ten minutes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};
use tracing::debug;
use url::Url;

use super::{AuthError, Result};

const PORT_RANGE: std::ops::RangeInclusive<u16> = 48801..=48811;
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Authorization complete</title></head>\
<body><h1>Authorization complete</h1><p>You can close this window and return to the editor.</p></body></html>";

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
  pub code: Option<String>,
  pub state: Option<String>,
  pub error: Option<String>,
}

pub struct CallbackServer {
  listener: TcpListener,
  port: u16,
  idle_timeout: Duration,
}

impl CallbackServer {
  /// Binds the first free port in the 48801-48811 range.
  pub async fn bind() -> Result<Self> {
    Self::bind_with_timeout(IDLE_TIMEOUT).await
  }

  pub async fn bind_with_timeout(idle_timeout: Duration) -> Result<Self> {
    for port in PORT_RANGE {
      match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
          debug!(port, "oauth callback server bound");
          return Ok(Self {
            listener,
            port,
            idle_timeout,
          });
        }
        Err(_) => continue,
      }
    }
    Err(AuthError::Callback(
      "no free port in the callback range".to_string(),
    ))
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn redirect_uri(&self) -> String {
    format!("http://127.0.0.1:{}/callback", self.port)
  }

  /// Serves until one callback arrives, then disposes the listener.
  ///
  /// Requests without `code` or `error` parameters (favicon probes and the
  /// like) get a 404 and the wait continues.
  pub async fn wait_for_callback(self) -> Result<CallbackParams> {
    let deadline = tokio::time::Instant::now() + self.idle_timeout;

    loop {
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        return Err(AuthError::Timeout);
      }

      let accepted = timeout(remaining, self.listener.accept())
        .await
        .map_err(|_| AuthError::Timeout)?;
      let (stream, _) = accepted?;

      match handle_connection(stream).await {
        Ok(Some(params)) => return Ok(params),
        Ok(None) => continue,
        // A broken probe connection should not kill the flow
        Err(_) => continue,
      }
    }
  }
}

async fn handle_connection(mut stream: TcpStream) -> Result<Option<CallbackParams>> {
  let mut buffer = Vec::with_capacity(2048);
  let mut chunk = [0u8; 1024];
  loop {
    let read = stream.read(&mut chunk).await?;
    if read == 0 {
      break;
    }
    buffer.extend_from_slice(&chunk[..read]);
    if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() > 16 * 1024 {
      break;
    }
  }

  let request = String::from_utf8_lossy(&buffer);
  let Some(params) = parse_request_line(&request) else {
    respond(&mut stream, "404 Not Found", "not found").await?;
    return Ok(None);
  };

  respond(&mut stream, "200 OK", SUCCESS_PAGE).await?;
  Ok(Some(params))
}

fn parse_request_line(request: &str) -> Option<CallbackParams> {
  let line = request.lines().next()?;
  let target = line.split_whitespace().nth(1)?;
  let url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;
  if url.path() != "/callback" {
    return None;
  }

  let mut params = CallbackParams {
    code: None,
    state: None,
    error: None,
  };
  for (name, value) in url.query_pairs() {
    match name.as_ref() {
      "code" => params.code = Some(value.into_owned()),
      "state" => params.state = Some(value.into_owned()),
      "error" => params.error = Some(value.into_owned()),
      _ => {}
    }
  }
  if params.code.is_none() && params.error.is_none() {
    return None;
  }
  Some(params)
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
  let response = format!(
    "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
    body.len()
  );
  stream.write_all(response.as_bytes()).await?;
  stream.shutdown().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_serves_one_callback_and_disposes() {
    let server = CallbackServer::bind().await.expect("bind");
    let uri = server.redirect_uri();
    let port = server.port();
    assert!(PORT_RANGE.contains(&port));

    let wait = tokio::spawn(server.wait_for_callback());

    let body = reqwest::get(format!("{uri}?code=abc&state=xyz"))
      .await
      .expect("request")
      .text()
      .await
      .expect("body");
    assert!(body.contains("Authorization complete"));

    let params = wait.await.expect("join").expect("params");
    assert_eq!(params.code.as_deref(), Some("abc"));
    assert_eq!(params.state.as_deref(), Some("xyz"));

    // Listener is gone; the port is free again
    let rebound = CallbackServer::bind().await.expect("rebind");
    assert!(PORT_RANGE.contains(&rebound.port()));
  }

  #[tokio::test]
  async fn test_probe_requests_do_not_complete_the_flow() {
    let server = CallbackServer::bind().await.expect("bind");
    let port = server.port();
    let wait = tokio::spawn(server.wait_for_callback());

    let status = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
      .await
      .expect("request")
      .status();
    assert_eq!(status.as_u16(), 404);

    reqwest::get(format!("http://127.0.0.1:{port}/callback?error=access_denied"))
      .await
      .expect("request");
    let params = wait.await.expect("join").expect("params");
    assert_eq!(params.error.as_deref(), Some("access_denied"));
    assert!(params.code.is_none());
  }

  #[tokio::test]
  async fn test_idle_timeout() {
    let server = CallbackServer::bind_with_timeout(Duration::from_millis(50))
      .await
      .expect("bind");
    let err = server.wait_for_callback().await.expect_err("timeout");
    assert!(matches!(err, AuthError::Timeout));
  }
}
