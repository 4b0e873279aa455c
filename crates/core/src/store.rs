//! ChatStore trait: durable storage for chats, messages, stream ids and
//! documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// A conversation owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            visibility: Visibility::Private,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Text,
    Code,
    Sheet,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Sheet => "sheet",
        }
    }
}

/// A document produced by the document tools. Every save is a new version;
/// lookups return the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub kind: DocumentKind,
    pub content: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Same id and same parts were already stored.
    Unchanged,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError>;

    async fn save_chat(&self, chat: Chat) -> Result<(), StoreError>;

    /// Delete a chat with its messages and stream ids. Returns the deleted chat.
    async fn delete_chat(&self, id: &str) -> Result<Option<Chat>, StoreError>;

    async fn update_chat_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    /// Messages of a chat in insertion order.
    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Insert a message, or replace the parts of the stored message with the
    /// same id.
    async fn upsert_message(
        &self,
        chat_id: &str,
        message: Message,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Number of user messages sent by `user_id` since `since`.
    async fn user_message_count_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Record that `stream_id` carries output for `chat_id`.
    async fn create_stream_id(&self, stream_id: &str, chat_id: &str) -> Result<(), StoreError>;

    /// Stream ids of a chat, oldest first.
    async fn stream_ids(&self, chat_id: &str) -> Result<Vec<String>, StoreError>;

    async fn save_document(&self, document: Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;
}
