//! Error types for the Stepweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde_json::json;
use thiserror::Error;

/// The top-level error type for all Stepweave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Storage errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the language-model invocation.
///
/// These are never recovered inside the agent loop: they end the run with a
/// terminal `error` event while the partial response is still persisted.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed model stream: {0}")]
    MalformedStream(String),

    #[error("Model not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures of a single tool invocation.
///
/// The isolation wrapper turns every one of these into a value; none of them
/// ever aborts a run.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool \"{tool_name}\" timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool \"{tool_name}\" panicked: {message}")]
    Panicked { tool_name: String, message: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool provider unavailable: {provider}: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
}

impl ToolError {
    /// The `{ "error": "..." }` payload reported to the model in place of a
    /// tool result.
    pub fn to_output(&self) -> serde_json::Value {
        json!({ "error": self.to_string() })
    }
}

/// Failures of the chat store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_displays_correctly() {
        let err = Error::Model(ModelError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn timeout_error_names_tool_and_deadline() {
        let err = ToolError::Timeout {
            tool_name: "web_search".into(),
            timeout_secs: 90,
        };
        assert_eq!(err.to_string(), "Tool \"web_search\" timed out after 90s");
    }

    #[test]
    fn tool_error_output_is_error_shaped() {
        let err = ToolError::ExecutionFailed {
            tool_name: "graph_query".into(),
            reason: "connection refused".into(),
        };
        let output = err.to_output();
        let text = output["error"].as_str().unwrap();
        assert!(text.contains("graph_query"));
        assert!(text.contains("connection refused"));
        assert_eq!(output.as_object().unwrap().len(), 1);
    }
}
