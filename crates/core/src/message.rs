//! Message and Part domain types.
//!
//! A message is an ordered list of typed parts. Assistant messages carry the
//! whole multi-step turn: text, reasoning, step boundaries and one
//! tool-invocation part per call id, whose state advances in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh opaque identifier (messages, chats, calls, streams).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
}

/// Lifecycle state of a single tool call.
///
/// ```text
/// input-streaming -> input-available -> (approval-requested -> approval-responded)?
///                 -> output-available | output-error | output-denied
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    ApprovalRequested,
    ApprovalResponded,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

impl ToolState {
    const ALL: [ToolState; 7] = [
        Self::InputStreaming,
        Self::InputAvailable,
        Self::ApprovalRequested,
        Self::ApprovalResponded,
        Self::OutputAvailable,
        Self::OutputError,
        Self::OutputDenied,
    ];

    /// Whether no further state is expected for the call.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::OutputAvailable | Self::OutputError | Self::OutputDenied
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `output-available -> output-available` is allowed: streamed tools
    /// publish preliminary outputs before the final one.
    pub fn can_advance_to(self, next: ToolState) -> bool {
        use ToolState::*;
        match (self, next) {
            (InputStreaming, InputStreaming | InputAvailable | OutputError) => true,
            (InputAvailable, ApprovalRequested | OutputAvailable | OutputError) => true,
            (ApprovalRequested, ApprovalResponded) => true,
            (ApprovalResponded, OutputAvailable | OutputError | OutputDenied) => true,
            (OutputAvailable, OutputAvailable) => true,
            _ => false,
        }
    }

    /// Whether `target` is `self` or follows it through legal transitions.
    pub fn can_reach(self, target: ToolState) -> bool {
        let mut seen = vec![self];
        let mut frontier = vec![self];
        while let Some(state) = frontier.pop() {
            if state == target {
                return true;
            }
            for next in Self::ALL {
                if state.can_advance_to(next) && !seen.contains(&next) {
                    seen.push(next);
                    frontier.push(next);
                }
            }
        }
        false
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputStreaming => "input-streaming",
            Self::InputAvailable => "input-available",
            Self::ApprovalRequested => "approval-requested",
            Self::ApprovalResponded => "approval-responded",
            Self::OutputAvailable => "output-available",
            Self::OutputError => "output-error",
            Self::OutputDenied => "output-denied",
        }
    }
}

impl std::fmt::Display for ToolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval record attached to a tool call that needs human confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    /// Approval id handed to the client with the request.
    pub id: String,

    /// `None` until the user answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A tool call as it appears inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub state: ToolState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,

    /// Set while a streamed tool has only published intermediate output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preliminary: bool,
}

impl ToolInvocation {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        state: ToolState,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state,
            input: None,
            output: None,
            error_text: None,
            approval: None,
            preliminary: false,
        }
    }

    /// The approval answer carried by an `approval-responded` call.
    pub fn approval_answer(&self) -> Option<bool> {
        self.approval.as_ref().and_then(|a| a.approved)
    }
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub url: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One typed part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },

    Reasoning {
        text: String,
    },

    File(FileRef),

    /// Boundary between two steps of the same assistant turn.
    StepStart,

    #[serde(rename = "tool-invocation")]
    ToolInvocation(ToolInvocation),

    /// Opaque UI payload, `type` is `data-<name>`.
    #[serde(untagged)]
    Data {
        #[serde(rename = "type")]
        data_type: String,
        data: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered parts
    #[serde(default)]
    pub parts: Vec<Part>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create an empty message with the given id.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a new user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(generate_id(), Role::User).with_part(Part::text(text))
    }

    /// Create a new system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(generate_id(), Role::System).with_part(Part::text(text))
    }

    /// Create a new, empty assistant message.
    pub fn assistant() -> Self {
        Self::new(generate_id(), Role::Assistant)
    }

    #[must_use]
    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// All text parts concatenated.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolInvocation(inv) => Some(inv),
            _ => None,
        })
    }

    pub fn tool_invocation(&self, call_id: &str) -> Option<&ToolInvocation> {
        self.tool_invocations().find(|inv| inv.tool_call_id == call_id)
    }

    /// Insert or replace the tool-invocation part for `inv.tool_call_id`.
    ///
    /// A replacement keeps the position of the first occurrence, so the part
    /// order reflects when each call was first requested.
    pub fn upsert_tool_invocation(&mut self, inv: ToolInvocation) {
        let existing = self.parts.iter_mut().find_map(|p| match p {
            Part::ToolInvocation(current) if current.tool_call_id == inv.tool_call_id => {
                Some(current)
            }
            _ => None,
        });
        match existing {
            Some(current) => *current = inv,
            None => self.parts.push(Part::ToolInvocation(inv)),
        }
    }
}
