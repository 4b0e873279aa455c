//! Tool and ToolProvider traits, the abstraction over external capabilities.
//!
//! A tool turns a JSON input into either a single JSON value or a stream of
//! JSON values. Tools are grouped by providers, each with its own
//! initialisation and teardown lifecycle.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ToolError;
use crate::stream::UiStreamWriter;

/// A request to execute a tool, as emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub input: serde_json::Value,
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// What a tool produced.
///
/// Streamed results publish each item as a preliminary output; the last item
/// is the final output.
pub enum ToolOutput {
    Value(serde_json::Value),
    Stream(BoxStream<'static, serde_json::Value>),
}

impl ToolOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<serde_json::Value> for ToolOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl std::fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,

    /// Side channel into the run's output stream.
    pub writer: UiStreamWriter,

    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, writer: UiStreamWriter) -> Self {
        Self {
            call_id: call_id.into(),
            writer,
            user_id: None,
            chat_id: None,
        }
    }

    /// A context whose side-channel writes are discarded.
    pub fn detached(call_id: impl Into<String>) -> Self {
        Self::new(call_id, UiStreamWriter::sink())
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "create_document").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn input_schema(&self) -> serde_json::Value;

    /// Run the tool.
    async fn invoke(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Whether a call must be confirmed by the user before it runs.
    fn needs_approval(&self) -> bool {
        false
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}

/// An independent source of tools.
///
/// `tools()` may be expensive (spawning processes, connecting to servers) and
/// may legitimately return an empty set, e.g. when credentials are absent.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn tools(&self) -> std::result::Result<Vec<Arc<dyn Tool>>, ToolError>;

    /// Release whatever `tools()` acquired.
    async fn shutdown(&self) -> std::result::Result<(), ToolError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn invoke(
            &self,
            input: serde_json::Value,
            _ctx: ToolContext,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Value(input["text"].clone()))
        }
    }

    #[test]
    fn definition_uses_name_and_schema() {
        let def = EchoTool.definition();
        assert_eq!(def.name, "echo");
        assert_eq!(def.parameters["required"][0], "text");
        assert!(!EchoTool.needs_approval());
    }

    #[tokio::test]
    async fn invoke_returns_value() {
        let output = EchoTool
            .invoke(json!({"text": "hello world"}), ToolContext::detached("call_1"))
            .await
            .unwrap();
        match output {
            ToolOutput::Value(v) => assert_eq!(v, "hello world"),
            ToolOutput::Stream(_) => panic!("expected a value"),
        }
    }

    #[test]
    fn context_builders() {
        let ctx = ToolContext::detached("c").with_user("u1").with_chat("chat");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.chat_id.as_deref(), Some("chat"));
    }
}
