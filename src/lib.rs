//! llmux — provider abstraction and streaming normalization for LLM backends.
//!
//! Each vendor family gets one adapter implementing [providers::LlmAdapter];
//! every adapter emits the same canonical [stream::StreamChunk] sequence
//! regardless of the wire protocol behind it (OpenAI chat-completions or
//! Responses SSE, Anthropic Messages SSE, raw HTTP SSE, Bedrock eventstream
//! frames). Around the adapters sit the model parameter resolver, cost
//! accounting, quota-based fallback routing, live model catalogs, and the
//! authentication state machines (Copilot token exchange, Bedrock
//! inference-profile resolution, MCP OAuth with a loopback callback server).

pub mod auth;
pub mod catalog;
pub mod error;
pub mod eventstream;
pub mod model;
pub mod params;
pub mod providers;
pub mod sse;
pub mod stream;
pub mod think;
pub mod types;
pub mod usage;

pub use error::{ProviderError, Result};
pub use model::{ModelDescriptor, ResolvedModel};
pub use providers::{
  AnthropicAdapter, BedrockAdapter, CerebrasAdapter, CopilotAdapter, FallbackRouter,
  KiloCodeAdapter, LlmAdapter, OpenAiAdapter, OpenRouterAdapter,
};
pub use stream::{ChunkStream, StreamChunk, ToolCallAccumulator, UsageChunk};
pub use types::{
  FunctionDefinition, Message, ProviderSettings, RequestMetadata, Tool, ToolCall, ToolChoice,
  ToolProtocol,
};
