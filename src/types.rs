//! Shared request types
//!
//! Conversation messages, tool definitions, per-request metadata and the
//! provider settings struct consumed by every adapter constructor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
  /// System message
  System { content: String },

  /// User message
  User { content: String },

  /// Assistant message
  Assistant {
    content: String,

    /// Tool calls made by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
  },

  /// Tool result message
  Tool {
    /// ID of the tool call this result answers
    tool_call_id: String,
    content: String,
  },
}

impl Message {
  pub fn system(content: impl Into<String>) -> Self {
    Message::System {
      content: content.into(),
    }
  }

  pub fn user(content: impl Into<String>) -> Self {
    Message::User {
      content: content.into(),
    }
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    Message::Assistant {
      content: content.into(),
      tool_calls: Vec::new(),
    }
  }

  pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
    Message::Tool {
      tool_call_id: tool_call_id.into(),
      content: content.into(),
    }
  }

  /// Text content of this message
  pub fn text(&self) -> &str {
    match self {
      Message::System { content }
      | Message::User { content }
      | Message::Assistant { content, .. }
      | Message::Tool { content, .. } => content,
    }
  }

  /// Role string as sent on OpenAI-compatible wires
  pub fn role(&self) -> &'static str {
    match self {
      Message::System { .. } => "system",
      Message::User { .. } => "user",
      Message::Assistant { .. } => "assistant",
      Message::Tool { .. } => "tool",
    }
  }
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
  /// Tool type (currently only "function")
  #[serde(rename = "type")]
  pub tool_type: String,

  pub function: FunctionDefinition,
}

impl Tool {
  pub fn function(function: FunctionDefinition) -> Self {
    Self {
      tool_type: "function".to_string(),
      function,
    }
  }
}

/// Function definition for a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,

  /// JSON schema for the function parameters
  #[serde(default)]
  pub parameters: serde_json::Value,
}

/// Tool call made by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
  pub id: String,

  /// Type of tool call (currently only "function")
  #[serde(rename = "type")]
  pub call_type: String,

  pub function: ToolCallFunction,
}

/// Function call in a tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallFunction {
  pub name: String,

  /// Arguments as a JSON string
  pub arguments: String,
}

impl ToolCall {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: impl Into<String>,
  ) -> Self {
    Self {
      id: id.into(),
      call_type: "function".to_string(),
      function: ToolCallFunction {
        name: name.into(),
        arguments: arguments.into(),
      },
    }
  }
}

/// Tool choice constraint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
  Auto,
  None,
  Required,
  Function { name: String },
}

/// How tool calls are surfaced to the consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolProtocol {
  /// Incremental `tool_call_partial` chunks plus a final `native_tool_calls`
  Native,
  /// Tool use is described in text; no tool chunks are emitted
  #[default]
  Text,
}

/// Per-request metadata passed into `create_message`
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
  pub tools: Option<Vec<Tool>>,
  pub tool_choice: Option<ToolChoice>,
  pub tool_protocol: ToolProtocol,
  pub task_id: Option<String>,
}

impl RequestMetadata {
  /// Tool definitions to put on the wire; `None` under the text protocol.
  pub fn native_tools(&self) -> Option<&[Tool]> {
    if self.tool_protocol != ToolProtocol::Native {
      return None;
    }
    self.tools.as_deref().filter(|tools| !tools.is_empty())
  }
}

/// OpenAI-compatible endpoint selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
  #[default]
  Completions,
  Responses,
}

/// Responses-API preference when `ApiMode::Responses` is selected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponsesMode {
  Off,
  #[default]
  Auto,
  Force,
}

/// Per-provider settings, constructed by the host config layer and passed by
/// value into each adapter constructor. The core consumes, never owns, this.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
  /// API key (or OAuth token for Copilot)
  #[serde(default)]
  pub api_key: Option<String>,

  /// Base URL override
  #[serde(default)]
  pub base_url: Option<String>,

  /// Model identifier
  #[serde(default)]
  pub model_id: Option<String>,

  /// Sampling temperature override
  #[serde(default)]
  pub model_temperature: Option<f32>,

  /// Max output tokens override; never exceeds the model ceiling
  #[serde(default)]
  pub model_max_tokens: Option<u32>,

  /// User opt-in for reasoning/thinking output
  #[serde(default)]
  pub enable_reasoning: bool,

  /// Thinking token budget for budget-style models
  #[serde(default)]
  pub reasoning_budget: Option<u32>,

  /// Effort level ("low"/"medium"/"high") for effort-style models
  #[serde(default)]
  pub reasoning_effort: Option<String>,

  /// Chat-completions vs Responses endpoint selection
  #[serde(default)]
  pub api_mode: ApiMode,

  /// Responses-API preference (off/auto/force)
  #[serde(default)]
  pub responses_mode: ResponsesMode,

  /// AWS region for Bedrock
  #[serde(default)]
  pub region: Option<String>,

  /// Request timeout in seconds
  #[serde(default)]
  pub timeout: Option<u64>,

  /// Custom headers
  #[serde(default)]
  pub headers: HashMap<String, String>,
}
