//! # Stepweave Core
//!
//! Domain types, traits, and error definitions for the Stepweave
//! tool-orchestration engine. This crate has **no framework dependencies**:
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here (`Model`, `Tool`, `ToolProvider`,
//! `ChatStore`). Implementations live in their respective crates, so tests
//! can swap in scripted models and tools, and all crates depend inward on
//! core.

pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod store;
pub mod stream;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ModelError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{generate_id, Approval, FileRef, Message, Part, Role, ToolInvocation, ToolState};
pub use model::{
    FinishReason, Model, ModelEvent, ModelMessage, ModelOptions, ModelRequest, ModelStream,
    ReasoningOptions, Usage,
};
pub use store::{Chat, ChatStore, Document, DocumentKind, UpsertOutcome, Visibility};
pub use stream::{UiEvent, UiEventReceiver, UiStreamWriter};
pub use tool::{Tool, ToolCall, ToolContext, ToolDefinition, ToolOutput, ToolProvider};
