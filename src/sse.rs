//! Incremental SSE framing.
//!
//! Splits a byte stream on the `\n\n` event separator, extracts `data:`
//! payloads and flags the `[DONE]` terminator. Payload JSON parsing is left to
//! each adapter, which knows its vendor's event schema.

use futures::{Stream, StreamExt};

use crate::error::{ProviderError, Result};

const EVENT_SEPARATOR: &str = "\n\n";

/// One framed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
  /// Concatenated `data:` payload, `[DONE]` excluded
  pub data: String,
  /// Vendor event name from an `event:` line, if any
  pub event: Option<String>,
  pub done: bool,
}

/// Stateful framer; feed arriving segments, drain complete events.
#[derive(Debug, Default)]
pub struct SseProcessor {
  buffer: String,
}

impl SseProcessor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feeds one text segment and returns the events completed by it.
  pub fn push_text(&mut self, text: &str) -> Vec<SseEvent> {
    self.buffer.push_str(text);
    let mut events = Vec::new();
    while let Some(idx) = self.buffer.find(EVENT_SEPARATOR) {
      let raw = self.buffer[..idx].to_string();
      self.buffer.drain(..idx + EVENT_SEPARATOR.len());
      if let Some(event) = parse_event(&raw) {
        events.push(event);
      }
    }
    events
  }

  /// Feeds bytes; invalid UTF-8 is replaced, never fatal.
  pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
    self.push_text(&String::from_utf8_lossy(bytes))
  }

  /// Flushes a trailing event that was not followed by a separator.
  pub fn finish(&mut self) -> Vec<SseEvent> {
    if self.buffer.is_empty() {
      return Vec::new();
    }
    let remaining = std::mem::take(&mut self.buffer);
    parse_event(&remaining).into_iter().collect()
  }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
  let mut data = String::new();
  let mut event_name = None;
  let mut done = false;

  for line in raw.lines() {
    if let Some(name) = line.strip_prefix("event:") {
      event_name = Some(name.trim().to_string());
      continue;
    }
    let Some(payload) = line.strip_prefix("data:") else {
      continue;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
      done = true;
      continue;
    }
    if !data.is_empty() {
      data.push('\n');
    }
    data.push_str(payload);
  }

  if data.is_empty() && event_name.is_none() && !done {
    return None;
  }
  Some(SseEvent {
    data,
    event: event_name,
    done,
  })
}

/// Streams framed SSE events out of an HTTP response.
///
/// Non-success status collects the body and fails with a structured transport
/// error before any event is yielded. Dropping the returned stream drops the
/// response body, which closes the connection.
pub fn sse_event_stream(
  provider: &'static str,
  response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent>> + Send {
  async_stream::try_stream! {
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      Err(ProviderError::from_http(provider, status.as_u16(), &body))?;
      return;
    }

    let mut processor = SseProcessor::new();
    let mut bytes = response.bytes_stream();
    while let Some(segment) = bytes.next().await {
      let segment = segment.map_err(|e| ProviderError::Stream(format!("{provider}: {e}")))?;
      for event in processor.push_bytes(&segment) {
        let done = event.done;
        yield event;
        if done {
          return;
        }
      }
    }
    for event in processor.finish() {
      yield event;
    }
  }
}
