//! Quota-based fallback router.
//!
//! Wraps N adapters, each bound to a usage-limit profile over rolling
//! minute/hour/day windows. Every dispatch picks the first profile that is
//! not cooling down and under all of its limits. An error from the active
//! adapter puts that profile on a fixed 10-minute cooldown and rethrows; the
//! router never retries a different profile mid-stream, since replaying a
//! partial stream against another provider would corrupt conversation state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::LlmAdapter;
use crate::error::{ProviderError, Result};
use crate::model::ResolvedModel;
use crate::stream::{ChunkStream, StreamChunk};
use crate::types::{Message, RequestMetadata};

const COOLDOWN_SECS: i64 = 600;
const MINUTE_SECS: i64 = 60;
const HOUR_SECS: i64 = 3_600;
const DAY_SECS: i64 = 86_400;

/// Time source; injected so tests control the windows.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Rolling usage limits for one profile; `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
  pub requests_per_minute: Option<u64>,
  pub requests_per_hour: Option<u64>,
  pub requests_per_day: Option<u64>,
  pub tokens_per_minute: Option<u64>,
  pub tokens_per_hour: Option<u64>,
  pub tokens_per_day: Option<u64>,
}

/// One adapter bound to its limits.
pub struct QuotaProfile {
  pub name: String,
  pub limits: QuotaLimits,
  pub adapter: Arc<dyn LlmAdapter>,
}

#[derive(Debug, Default)]
struct ProfileState {
  /// (timestamp, requests, tokens), pruned past the day window
  events: VecDeque<(DateTime<Utc>, u64, u64)>,
  cooldown_until: Option<DateTime<Utc>>,
}

impl ProfileState {
  fn prune(&mut self, now: DateTime<Utc>) {
    let horizon = now - Duration::seconds(DAY_SECS);
    while let Some((at, _, _)) = self.events.front() {
      if *at < horizon {
        self.events.pop_front();
      } else {
        break;
      }
    }
  }

  fn totals_since(&self, since: DateTime<Utc>) -> (u64, u64) {
    self
      .events
      .iter()
      .filter(|(at, _, _)| *at >= since)
      .fold((0, 0), |(r, t), (_, requests, tokens)| {
        (r + requests, t + tokens)
      })
  }

  fn record(&mut self, now: DateTime<Utc>, requests: u64, tokens: u64) {
    self.prune(now);
    self.events.push_back((now, requests, tokens));
  }

  fn eligible(&mut self, now: DateTime<Utc>, limits: &QuotaLimits) -> bool {
    if let Some(until) = self.cooldown_until {
      if now < until {
        return false;
      }
      self.cooldown_until = None;
    }
    self.prune(now);

    let windows = [
      (MINUTE_SECS, limits.requests_per_minute, limits.tokens_per_minute),
      (HOUR_SECS, limits.requests_per_hour, limits.tokens_per_hour),
      (DAY_SECS, limits.requests_per_day, limits.tokens_per_day),
    ];
    for (secs, request_limit, token_limit) in windows {
      if request_limit.is_none() && token_limit.is_none() {
        continue;
      }
      let (requests, tokens) = self.totals_since(now - Duration::seconds(secs));
      if request_limit.is_some_and(|limit| requests >= limit) {
        return false;
      }
      if token_limit.is_some_and(|limit| tokens >= limit) {
        return false;
      }
    }
    true
  }
}

/// Router over an ordered profile list.
pub struct FallbackRouter {
  profiles: Vec<QuotaProfile>,
  states: Vec<Arc<Mutex<ProfileState>>>,
  active: Mutex<Option<usize>>,
  clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FallbackRouter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FallbackRouter")
      .field("active", &self.active)
      .finish_non_exhaustive()
  }
}

impl FallbackRouter {
  /// Fails on an empty profile list; every other method assumes at least one
  /// profile exists.
  pub fn new(profiles: Vec<QuotaProfile>) -> Result<Self> {
    Self::with_clock(profiles, Arc::new(SystemClock))
  }

  pub fn with_clock(profiles: Vec<QuotaProfile>, clock: Arc<dyn Clock>) -> Result<Self> {
    if profiles.is_empty() {
      return Err(ProviderError::Config(
        "fallback router needs at least one quota profile".to_string(),
      ));
    }
    let states = profiles
      .iter()
      .map(|_| Arc::new(Mutex::new(ProfileState::default())))
      .collect();
    Ok(Self {
      profiles,
      states,
      active: Mutex::new(None),
      clock,
    })
  }

  /// First profile under all its limits and not cooling down.
  pub fn adjust_active_handler(&self) -> Result<usize> {
    let now = self.clock.now();
    for (index, profile) in self.profiles.iter().enumerate() {
      let eligible = lock(&self.states[index]).eligible(now, &profile.limits);
      if !eligible {
        continue;
      }
      let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
      if *active != Some(index) {
        debug!(profile = %profile.name, "switching active quota profile");
        *active = Some(index);
      }
      return Ok(index);
    }
    Err(ProviderError::AllProvidersUnavailable)
  }

  fn cooldown(&self, index: usize) {
    let until = self.clock.now() + Duration::seconds(COOLDOWN_SECS);
    lock(&self.states[index]).cooldown_until = Some(until);
    warn!(profile = %self.profiles[index].name, "profile placed on cooldown");
  }

  #[cfg(test)]
  fn active_profile(&self) -> Option<usize> {
    *self.active.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn lock(state: &Arc<Mutex<ProfileState>>) -> std::sync::MutexGuard<'_, ProfileState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl LlmAdapter for FallbackRouter {
  fn get_model(&self) -> ResolvedModel {
    // Synchronous and infallible: current or first profile; the constructor
    // guarantees the list is non-empty
    let index = self
      .active
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .unwrap_or(0);
    self.profiles[index].adapter.get_model()
  }

  async fn create_message(
    &self,
    system_prompt: &str,
    messages: &[Message],
    metadata: RequestMetadata,
  ) -> Result<ChunkStream> {
    let index = self.adjust_active_handler()?;
    let profile = &self.profiles[index];

    let inner = match profile
      .adapter
      .create_message(system_prompt, messages, metadata)
      .await
    {
      Ok(stream) => stream,
      Err(err) => {
        self.cooldown(index);
        return Err(err);
      }
    };

    lock(&self.states[index]).record(self.clock.now(), 1, 0);

    let state = self.states[index].clone();
    let cooldown_state = self.states[index].clone();
    let clock = self.clock.clone();
    Ok(Box::pin(async_stream::try_stream! {
      let mut inner = inner;
      while let Some(item) = inner.next().await {
        match item {
          Ok(chunk) => {
            if let StreamChunk::Usage(usage) = &chunk {
              let tokens = u64::from(usage.input_tokens) + u64::from(usage.output_tokens);
              lock(&state).record(clock.now(), 0, tokens);
            }
            yield chunk;
          }
          Err(err) => {
            lock(&cooldown_state).cooldown_until =
              Some(clock.now() + Duration::seconds(COOLDOWN_SECS));
            Err(err)?;
          }
        }
      }
    }))
  }

  async fn complete_prompt(&self, prompt: &str) -> Result<String> {
    let index = self.adjust_active_handler()?;
    let profile = &self.profiles[index];
    match profile.adapter.complete_prompt(prompt).await {
      Ok(text) => {
        lock(&self.states[index]).record(self.clock.now(), 1, 0);
        Ok(text)
      }
      Err(err) => {
        self.cooldown(index);
        Err(err)
      }
    }
  }

  async fn count_tokens(&self, content: &str) -> Result<u32> {
    let index = self.adjust_active_handler()?;
    self.profiles[index].adapter.count_tokens(content).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{ModelDescriptor, ResolvedModel};
  use crate::params::ModelParams;
  use crate::stream::UsageChunk;

  struct ManualClock {
    now: Mutex<DateTime<Utc>>,
  }

  impl ManualClock {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        now: Mutex::new(Utc::now()),
      })
    }

    fn advance(&self, secs: i64) {
      let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
      *now += Duration::seconds(secs);
    }
  }

  impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
      *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
  }

  struct StubAdapter {
    name: &'static str,
    fail: bool,
  }

  #[async_trait]
  impl LlmAdapter for StubAdapter {
    fn get_model(&self) -> ResolvedModel {
      ResolvedModel {
        id: self.name.to_string(),
        info: ModelDescriptor::new(self.name, 8192, 128_000),
        params: ModelParams::default(),
      }
    }

    async fn create_message(
      &self,
      _system_prompt: &str,
      _messages: &[Message],
      _metadata: RequestMetadata,
    ) -> Result<ChunkStream> {
      if self.fail {
        return Err(ProviderError::Stream("backend down".to_string()));
      }
      Ok(Box::pin(async_stream::try_stream! {
        yield StreamChunk::Text { text: "ok".to_string() };
        yield StreamChunk::Usage(UsageChunk {
          input_tokens: 10,
          output_tokens: 5,
          ..Default::default()
        });
      }))
    }

    async fn complete_prompt(&self, _prompt: &str) -> Result<String> {
      if self.fail {
        return Err(ProviderError::Stream("backend down".to_string()));
      }
      Ok("ok".to_string())
    }
  }

  fn profile(name: &'static str, fail: bool, limits: QuotaLimits) -> QuotaProfile {
    QuotaProfile {
      name: name.to_string(),
      limits,
      adapter: Arc::new(StubAdapter { name, fail }),
    }
  }

  async fn drain(router: &FallbackRouter) -> Result<Vec<StreamChunk>> {
    let mut stream = router
      .create_message("s", &[Message::user("hi")], RequestMetadata::default())
      .await?;
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
      chunks.push(item?);
    }
    Ok(chunks)
  }

  #[tokio::test]
  async fn test_limit_met_selects_next_profile_then_window_rolls_over() {
    let clock = ManualClock::new();
    let limits_a = QuotaLimits {
      requests_per_minute: Some(1),
      ..Default::default()
    };
    let router = FallbackRouter::with_clock(
      vec![
        profile("a", false, limits_a),
        profile("b", false, QuotaLimits::default()),
      ],
      clock.clone(),
    )
    .expect("router");

    drain(&router).await.expect("first request");
    assert_eq!(router.active_profile(), Some(0));

    // A's per-minute limit is now met
    drain(&router).await.expect("second request");
    assert_eq!(router.active_profile(), Some(1));

    clock.advance(61);
    assert_eq!(router.adjust_active_handler().expect("eligible"), 0);
  }

  #[tokio::test]
  async fn test_error_sets_cooldown_then_recovers() {
    let clock = ManualClock::new();
    let router = FallbackRouter::with_clock(
      vec![
        profile("a", true, QuotaLimits::default()),
        profile("b", false, QuotaLimits::default()),
      ],
      clock.clone(),
    )
    .expect("router");

    let err = drain(&router).await.expect_err("a fails");
    assert!(matches!(err, ProviderError::Stream(_)));

    // A cooling down, B takes over
    assert_eq!(router.adjust_active_handler().expect("eligible"), 1);
    clock.advance(599);
    assert_eq!(router.adjust_active_handler().expect("eligible"), 1);
    clock.advance(2);
    assert_eq!(router.adjust_active_handler().expect("eligible"), 0);
  }

  #[tokio::test]
  async fn test_all_profiles_unavailable() {
    let clock = ManualClock::new();
    let limits = QuotaLimits {
      requests_per_minute: Some(0),
      ..Default::default()
    };
    let router = FallbackRouter::with_clock(vec![profile("a", false, limits)], clock).expect("router");
    let err = router.adjust_active_handler().expect_err("none eligible");
    assert!(matches!(err, ProviderError::AllProvidersUnavailable));
  }

  #[tokio::test]
  async fn test_token_limits_consume_from_usage_chunks() {
    let clock = ManualClock::new();
    let limits = QuotaLimits {
      tokens_per_hour: Some(15),
      ..Default::default()
    };
    let router = FallbackRouter::with_clock(vec![profile("a", false, limits)], clock).expect("router");

    drain(&router).await.expect("first request");
    // 15 tokens consumed, limit reached
    let err = router.adjust_active_handler().expect_err("limit met");
    assert!(matches!(err, ProviderError::AllProvidersUnavailable));
  }

  #[test]
  fn test_empty_profile_list_is_rejected() {
    let err = FallbackRouter::with_clock(Vec::new(), ManualClock::new()).expect_err("rejected");
    assert!(matches!(err, ProviderError::Config(_)));
  }
}
