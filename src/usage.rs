//! Token and cost accounting.
//!
//! Pure functions; prices in [crate::model::ModelDescriptor] are USD per
//! million tokens and a missing price means free/unknown, counted as zero.

use crate::model::ModelDescriptor;
use crate::stream::UsageChunk;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Dollar cost of a completed request.
///
/// Cache-read and cache-write tokens are priced by their dedicated rates when
/// the model defines them.
pub fn calculate_cost(
  info: &ModelDescriptor,
  input_tokens: u32,
  output_tokens: u32,
  cache_read_tokens: u32,
  cache_write_tokens: u32,
) -> f64 {
  let input = info.input_price.unwrap_or(0.0) * f64::from(input_tokens) / TOKENS_PER_MILLION;
  let output = info.output_price.unwrap_or(0.0) * f64::from(output_tokens) / TOKENS_PER_MILLION;
  let cache_read =
    info.cache_reads_price.unwrap_or(0.0) * f64::from(cache_read_tokens) / TOKENS_PER_MILLION;
  let cache_write =
    info.cache_writes_price.unwrap_or(0.0) * f64::from(cache_write_tokens) / TOKENS_PER_MILLION;
  input + output + cache_read + cache_write
}

/// Attaches a computed `total_cost` to a usage snapshot.
pub fn with_cost(info: &ModelDescriptor, mut usage: UsageChunk) -> UsageChunk {
  usage.total_cost = Some(calculate_cost(
    info,
    usage.input_tokens,
    usage.output_tokens,
    usage.cache_read_tokens.unwrap_or(0),
    usage.cache_write_tokens.unwrap_or(0),
  ));
  usage
}

/// Rough token estimate used when no vendor tokenizer is available.
///
/// Four characters per token, rounded up. Documented fallback for
/// `count_tokens`.
pub fn estimate_tokens(content: &str) -> u32 {
  u32::try_from(content.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}
