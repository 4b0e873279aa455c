//! Output event protocol and the fan-in stream writer.
//!
//! Every producer in a run (the agent loop, tools writing side-channel data,
//! merged sub-streams) writes [`UiEvent`]s through a cloneable
//! [`UiStreamWriter`]. All clones feed a single channel whose receiver is the
//! one consumer of the run.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// A typed event on the output stream.
///
/// Serialized as JSON with a kebab-case `type` tag; `data-*` events carry a
/// free-form `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    // ── Message lifecycle ──
    Start {
        #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    StartStep,

    FinishStep,

    Finish {
        #[serde(rename = "finishReason", default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },

    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },

    // ── Text and reasoning blocks ──
    TextStart {
        id: String,
    },

    TextDelta {
        id: String,
        delta: String,
    },

    TextEnd {
        id: String,
    },

    ReasoningStart {
        id: String,
    },

    ReasoningDelta {
        id: String,
        delta: String,
    },

    ReasoningEnd {
        id: String,
    },

    // ── Tool input ──
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },

    ToolInputDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "inputTextDelta")]
        input_text_delta: String,
    },

    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },

    // ── Approval ──
    ToolApprovalRequest {
        #[serde(rename = "approvalId")]
        approval_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },

    ToolApprovalResponse {
        #[serde(rename = "approvalId")]
        approval_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // ── Tool output ──
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preliminary: Option<bool>,
    },

    ToolOutputError {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "errorText")]
        error_text: String,
    },

    ToolOutputDenied {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },

    // ── Custom data ──
    /// `data-<name>` event. Transient events reach the client but are never
    /// folded into a persisted message.
    #[serde(untagged)]
    Data {
        #[serde(rename = "type")]
        data_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<bool>,
    },
}

impl UiEvent {
    pub fn start(message_id: impl Into<String>) -> Self {
        Self::Start {
            message_id: Some(message_id.into()),
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self::Finish {
            finish_reason: Some(reason.into()),
        }
    }

    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }

    pub fn text_start(id: impl Into<String>) -> Self {
        Self::TextStart { id: id.into() }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn text_end(id: impl Into<String>) -> Self {
        Self::TextEnd { id: id.into() }
    }

    pub fn reasoning_start(id: impl Into<String>) -> Self {
        Self::ReasoningStart { id: id.into() }
    }

    pub fn reasoning_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn reasoning_end(id: impl Into<String>) -> Self {
        Self::ReasoningEnd { id: id.into() }
    }

    pub fn tool_input_start(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self::ToolInputStart {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn tool_input_delta(tool_call_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ToolInputDelta {
            tool_call_id: tool_call_id.into(),
            input_text_delta: delta.into(),
        }
    }

    pub fn tool_input_available(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::ToolInputAvailable {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
        }
    }

    pub fn tool_approval_request(
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self::ToolApprovalRequest {
            approval_id: approval_id.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn tool_approval_response(
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        approved: bool,
        reason: Option<String>,
    ) -> Self {
        Self::ToolApprovalResponse {
            approval_id: approval_id.into(),
            tool_call_id: tool_call_id.into(),
            approved,
            reason,
        }
    }

    pub fn tool_output(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self::ToolOutputAvailable {
            tool_call_id: tool_call_id.into(),
            output,
            preliminary: None,
        }
    }

    pub fn tool_output_preliminary(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self::ToolOutputAvailable {
            tool_call_id: tool_call_id.into(),
            output,
            preliminary: Some(true),
        }
    }

    pub fn tool_output_error(tool_call_id: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self::ToolOutputError {
            tool_call_id: tool_call_id.into(),
            error_text: error_text.into(),
        }
    }

    pub fn tool_output_denied(tool_call_id: impl Into<String>) -> Self {
        Self::ToolOutputDenied {
            tool_call_id: tool_call_id.into(),
        }
    }

    /// A persisted `data-<name>` event.
    pub fn data(name: &str, data: Value) -> Self {
        Self::Data {
            data_type: format!("data-{name}"),
            data,
            transient: None,
        }
    }

    /// A `data-<name>` event that is shown to the client only.
    pub fn transient(name: &str, data: Value) -> Self {
        Self::Data {
            data_type: format!("data-{name}"),
            data,
            transient: Some(true),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Data { transient: Some(true), .. })
    }

    /// `finish` is always the last event of a run.
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }

    /// The tool call this event belongs to, if any.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolInputStart { tool_call_id, .. }
            | Self::ToolInputDelta { tool_call_id, .. }
            | Self::ToolInputAvailable { tool_call_id, .. }
            | Self::ToolApprovalRequest { tool_call_id, .. }
            | Self::ToolApprovalResponse { tool_call_id, .. }
            | Self::ToolOutputAvailable { tool_call_id, .. }
            | Self::ToolOutputError { tool_call_id, .. }
            | Self::ToolOutputDenied { tool_call_id } => Some(tool_call_id),
            _ => None,
        }
    }
}

/// Receiving half of a run's event channel.
pub type UiEventReceiver = mpsc::UnboundedReceiver<UiEvent>;

/// Cloneable sending half of a run's event channel.
///
/// Writes never block and never fail: once the consumer is gone, events are
/// dropped.
#[derive(Debug, Clone)]
pub struct UiStreamWriter {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiStreamWriter {
    /// Create a writer and the single receiver all of its clones feed.
    pub fn channel() -> (Self, UiEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A writer whose events go nowhere.
    pub fn sink() -> Self {
        Self::channel().0
    }

    pub fn write(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    /// Forward every event of `stream` on its own producer task.
    ///
    /// Per-source order is kept. A panic while polling the source is reported
    /// as an `error` event instead of tearing the channel down.
    pub fn merge(&self, mut stream: BoxStream<'static, UiEvent>) {
        let forward = self.clone();
        let producer = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                forward.write(event);
            }
        });

        let watcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = producer.await {
                warn!(error = %e, "Merged stream producer failed");
                watcher.write(UiEvent::error(format!("Stream producer failed: {e}")));
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
