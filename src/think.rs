//! `<think>` tag extraction.
//!
//! Some models interleave chain-of-thought with answer text using literal
//! `<think>...</think>` markers instead of a separate field. The scanner
//! splits a chunked text stream into reasoning and answer pieces without ever
//! emitting the markers themselves, even when a tag straddles a chunk
//! boundary. Answer text immediately following a close tag has its leading
//! whitespace trimmed once.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// One classified span of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinkPiece {
  Text(String),
  Reasoning(String),
}

/// Stateful scanner; feed chunks in arrival order, then call `finish`.
#[derive(Debug, Default)]
pub struct ThinkTagScanner {
  inside: bool,
  pending: String,
  trim_next_text: bool,
}

impl ThinkTagScanner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feeds one chunk and returns the pieces it completes.
  ///
  /// A chunk ending mid-tag is held back until the next chunk resolves it.
  pub fn push(&mut self, chunk: &str) -> Vec<ThinkPiece> {
    self.pending.push_str(chunk);
    let mut pieces = Vec::new();

    loop {
      let tag = if self.inside { CLOSE_TAG } else { OPEN_TAG };
      match self.pending.find(tag) {
        Some(idx) => {
          let before = self.pending[..idx].to_string();
          self.pending.drain(..idx + tag.len());
          self.emit(&mut pieces, before);
          if self.inside {
            self.trim_next_text = true;
          }
          self.inside = !self.inside;
        }
        None => {
          // Hold back a tail that could still grow into the tag.
          let keep = partial_tag_len(&self.pending, tag);
          let emit_len = self.pending.len() - keep;
          let ready: String = self.pending.drain(..emit_len).collect();
          self.emit(&mut pieces, ready);
          break;
        }
      }
    }

    pieces
  }

  /// Flushes held-back text; an unclosed partial tag is emitted literally.
  pub fn finish(&mut self) -> Vec<ThinkPiece> {
    let remaining = std::mem::take(&mut self.pending);
    let mut pieces = Vec::new();
    self.emit(&mut pieces, remaining);
    pieces
  }

  fn emit(&mut self, pieces: &mut Vec<ThinkPiece>, text: String) {
    if text.is_empty() {
      return;
    }
    if self.inside {
      pieces.push(ThinkPiece::Reasoning(text));
      return;
    }
    let text = if self.trim_next_text {
      let trimmed = text.trim_start();
      if trimmed.is_empty() {
        return;
      }
      self.trim_next_text = false;
      trimmed.to_string()
    } else {
      text
    };
    pieces.push(ThinkPiece::Text(text));
  }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_tag_len(buf: &str, tag: &str) -> usize {
  let max = tag.len().min(buf.len());
  for len in (1..=max).rev() {
    if len == tag.len() {
      continue;
    }
    if buf.is_char_boundary(buf.len() - len) && buf.ends_with(&tag[..len]) {
      return len;
    }
  }
  0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_chunk_with_both_tags() {
    let mut s = ThinkTagScanner::new();
    let mut pieces = s.push("<think>plan</think> answer");
    pieces.extend(s.finish());
    assert_eq!(
      pieces,
      vec![
        ThinkPiece::Reasoning("plan".to_string()),
        ThinkPiece::Text("answer".to_string()),
      ]
    );
  }

  #[test]
  fn test_tag_split_across_chunks() {
    let mut s = ThinkTagScanner::new();
    let mut pieces = Vec::new();
    pieces.extend(s.push("<thi"));
    pieces.extend(s.push("nk>deep "));
    pieces.extend(s.push("thought</th"));
    pieces.extend(s.push("ink>done"));
    pieces.extend(s.finish());
    assert_eq!(
      pieces,
      vec![
        ThinkPiece::Reasoning("deep ".to_string()),
        ThinkPiece::Reasoning("thought".to_string()),
        ThinkPiece::Text("done".to_string()),
      ]
    );
  }

  #[test]
  fn test_close_tag_and_text_in_same_fragment_trims_once() {
    let mut s = ThinkTagScanner::new();
    s.push("<think>x");
    let pieces = s.push("</think>\n  hi  there");
    assert_eq!(pieces, vec![ThinkPiece::Text("hi  there".to_string())]);
  }

  #[test]
  fn test_unclosed_partial_tag_flushes_literally() {
    let mut s = ThinkTagScanner::new();
    let pieces = s.push("hello <thi");
    assert_eq!(pieces, vec![ThinkPiece::Text("hello ".to_string())]);
    assert_eq!(s.finish(), vec![ThinkPiece::Text("<thi".to_string())]);
  }

  #[test]
  fn test_plain_text_passes_through() {
    let mut s = ThinkTagScanner::new();
    let pieces = s.push("no tags here");
    assert_eq!(pieces, vec![ThinkPiece::Text("no tags here".to_string())]);
  }

  #[test]
  fn test_trim_applies_across_fragments() {
    let mut s = ThinkTagScanner::new();
    s.push("<think>x</think>");
    let pieces = s.push("   lead");
    assert_eq!(pieces, vec![ThinkPiece::Text("lead".to_string())]);
    // Only once.
    let pieces = s.push("  rest");
    assert_eq!(pieces, vec![ThinkPiece::Text("  rest".to_string())]);
  }
}
