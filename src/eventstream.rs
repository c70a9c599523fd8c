//! `application/vnd.amazon.eventstream` binary frame decoder.
//!
//! Bedrock's ConverseStream responses arrive as length-prefixed binary frames:
//! a 12-byte prelude (total length, headers length, prelude CRC), a header
//! block, the payload, and a trailing message CRC. The decoder is incremental;
//! feed arriving byte segments and drain complete frames. CRC fields are
//! length-checked but not verified.

use std::collections::HashMap;

use crate::error::{ProviderError, Result};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One decoded frame: string headers plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStreamFrame {
  pub headers: HashMap<String, String>,
  pub payload: Vec<u8>,
}

impl EventStreamFrame {
  /// `:event-type` header, present on normal event frames.
  pub fn event_type(&self) -> Option<&str> {
    self.headers.get(":event-type").map(String::as_str)
  }

  /// `:exception-type` header, present on modeled error frames.
  pub fn exception_type(&self) -> Option<&str> {
    self.headers.get(":exception-type").map(String::as_str)
  }
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
  buffer: Vec<u8>,
}

impl EventStreamDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feeds bytes and returns every frame they complete.
  pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<EventStreamFrame>> {
    self.buffer.extend_from_slice(bytes);
    let mut frames = Vec::new();

    loop {
      if self.buffer.len() < PRELUDE_LEN {
        break;
      }
      let total_len = read_u32(&self.buffer, 0)? as usize;
      if total_len < PRELUDE_LEN + TRAILER_LEN || total_len > MAX_FRAME_LEN {
        return Err(ProviderError::Stream(format!(
          "eventstream: invalid frame length {total_len}"
        )));
      }
      if self.buffer.len() < total_len {
        break;
      }

      let headers_len = read_u32(&self.buffer, 4)? as usize;
      if PRELUDE_LEN + headers_len + TRAILER_LEN > total_len {
        return Err(ProviderError::Stream(
          "eventstream: header block exceeds frame".to_string(),
        ));
      }

      let headers = parse_headers(&self.buffer[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
      let payload =
        self.buffer[PRELUDE_LEN + headers_len..total_len - TRAILER_LEN].to_vec();
      self.buffer.drain(..total_len);
      frames.push(EventStreamFrame { headers, payload });
    }

    Ok(frames)
  }

  /// Trailing bytes that never formed a complete frame.
  pub fn remainder(&self) -> usize {
    self.buffer.len()
  }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
  let bytes: [u8; 4] = buf
    .get(offset..offset + 4)
    .and_then(|s| s.try_into().ok())
    .ok_or_else(|| ProviderError::Stream("eventstream: truncated prelude".to_string()))?;
  Ok(u32::from_be_bytes(bytes))
}

/// Parses the header block; non-string values are skipped by length.
fn parse_headers(mut block: &[u8]) -> Result<HashMap<String, String>> {
  let mut headers = HashMap::new();

  while !block.is_empty() {
    let (name_len, rest) = split_first(block)?;
    let name_len = name_len as usize;
    if rest.len() < name_len + 1 {
      return Err(truncated());
    }
    let name = String::from_utf8_lossy(&rest[..name_len]).to_string();
    let value_type = rest[name_len];
    block = &rest[name_len + 1..];

    match value_type {
      // bool true / bool false carry no value bytes
      0 | 1 => {}
      // byte
      2 => block = skip(block, 1)?,
      // i16
      3 => block = skip(block, 2)?,
      // i32
      4 => block = skip(block, 4)?,
      // i64 / timestamp
      5 | 8 => block = skip(block, 8)?,
      // byte array / string, 2-byte length prefix
      6 | 7 => {
        if block.len() < 2 {
          return Err(truncated());
        }
        let len = u16::from_be_bytes([block[0], block[1]]) as usize;
        if block.len() < 2 + len {
          return Err(truncated());
        }
        if value_type == 7 {
          let value = String::from_utf8_lossy(&block[2..2 + len]).to_string();
          headers.insert(name, value);
        }
        block = &block[2 + len..];
        continue;
      }
      // uuid
      9 => block = skip(block, 16)?,
      other => {
        return Err(ProviderError::Stream(format!(
          "eventstream: unknown header value type {other}"
        )));
      }
    }
  }

  Ok(headers)
}

fn split_first(block: &[u8]) -> Result<(u8, &[u8])> {
  block
    .split_first()
    .map(|(b, rest)| (*b, rest))
    .ok_or_else(truncated)
}

fn skip(block: &[u8], n: usize) -> Result<&[u8]> {
  block.get(n..).ok_or_else(truncated)
}

fn truncated() -> ProviderError {
  ProviderError::Stream("eventstream: truncated header block".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
      header_block.push(name.len() as u8);
      header_block.extend_from_slice(name.as_bytes());
      header_block.push(7u8);
      header_block.extend_from_slice(&(value.len() as u16).to_be_bytes());
      header_block.extend_from_slice(value.as_bytes());
    }
    let total = PRELUDE_LEN + header_block.len() + payload.len() + TRAILER_LEN;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(&header_block);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0u8; 4]);
    frame
  }

  #[test]
  fn test_decode_single_frame() {
    let frame = encode_frame(
      &[(":event-type", "contentBlockDelta"), (":message-type", "event")],
      br#"{"delta":{"text":"hi"}}"#,
    );
    let mut decoder = EventStreamDecoder::new();
    let frames = decoder.push(&frame).expect("decode");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event_type(), Some("contentBlockDelta"));
    assert_eq!(frames[0].payload, br#"{"delta":{"text":"hi"}}"#);
    assert_eq!(decoder.remainder(), 0);
  }

  #[test]
  fn test_frame_split_across_pushes() {
    let frame = encode_frame(&[(":event-type", "messageStop")], b"{}");
    let mut decoder = EventStreamDecoder::new();
    let (a, b) = frame.split_at(7);
    assert!(decoder.push(a).expect("decode").is_empty());
    let frames = decoder.push(b).expect("decode");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event_type(), Some("messageStop"));
  }

  #[test]
  fn test_two_frames_in_one_push() {
    let mut bytes = encode_frame(&[(":event-type", "a")], b"1");
    bytes.extend(encode_frame(&[(":event-type", "b")], b"2"));
    let frames = EventStreamDecoder::new().push(&bytes).expect("decode");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].event_type(), Some("b"));
  }

  #[test]
  fn test_invalid_length_is_an_error() {
    let mut decoder = EventStreamDecoder::new();
    let err = decoder.push(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    assert!(err.is_err());
  }

  #[test]
  fn test_exception_frame() {
    let frame = encode_frame(
      &[(":exception-type", "throttlingException"), (":message-type", "exception")],
      br#"{"message":"slow down"}"#,
    );
    let frames = EventStreamDecoder::new().push(&frame).expect("decode");
    assert_eq!(frames[0].exception_type(), Some("throttlingException"));
  }
}
