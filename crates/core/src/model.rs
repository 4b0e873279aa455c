//! Model trait: the abstraction over language-model backends.
//!
//! A model receives the conversation so far plus the available tools and
//! answers with a stream of events: text and reasoning deltas, tool input
//! fragments, complete tool calls and a step-finish marker.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::message::FileRef;
use crate::tool::{ToolCall, ToolDefinition};

/// One entry of the model-facing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ModelMessage {
    System {
        text: String,
    },
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<FileRef>,
    },
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        tool_name: String,
        output: serde_json::Value,
    },
}

/// Provider-specific reasoning configuration carried in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReasoningOptions {
    /// Extended thinking with a token budget.
    Budget { budget_tokens: u32 },
    /// Named thinking level, optionally echoing the thoughts back.
    Level { level: String, include_thoughts: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// A single model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<ModelMessage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub options: ModelOptions,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            _ => Self::Other,
        }
    }
}

/// One event of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolInputStart { call_id: String, tool_name: String },
    ToolInputDelta { call_id: String, delta: String },
    /// The complete, parsed tool call. Always follows any input fragments of
    /// the same call id.
    ToolCall(ToolCall),
    StepFinish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

pub type ModelStream = BoxStream<'static, std::result::Result<ModelEvent, ModelError>>;

/// The core Model trait.
///
/// Every backend implements this trait; the agent loop calls `run()` once per
/// step without knowing which backend answers.
#[async_trait]
pub trait Model: Send + Sync {
    /// The routed model id (e.g., "openai/gpt-4o", "anthropic/claude-reasoning").
    fn id(&self) -> &str;

    async fn run(&self, request: ModelRequest) -> std::result::Result<ModelStream, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_from_wire() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("weird"), FinishReason::Other);
    }

    #[test]
    fn request_defaults_have_no_reasoning() {
        let req = ModelRequest::default();
        assert!(req.options.reasoning.is_none());
        assert!(req.tools.is_empty());
    }

    #[test]
    fn reasoning_options_serialization() {
        let opts = ReasoningOptions::Level {
            level: "high".into(),
            include_thoughts: true,
        };
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(value["type"], "level");
        assert_eq!(value["include_thoughts"], true);
    }
}
