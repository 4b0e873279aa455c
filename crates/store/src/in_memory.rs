//! In-memory chat store, used by the gateway by default and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use stepweave_core::error::StoreError;
use stepweave_core::message::{Message, Role};
use stepweave_core::store::{Chat, ChatStore, Document, UpsertOutcome};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct State {
    chats: HashMap<String, Chat>,
    /// chat id → messages in insertion order
    messages: HashMap<String, Vec<Message>>,
    /// chat id → stream ids, oldest first
    streams: HashMap<String, Vec<String>>,
    /// document id → versions, oldest first
    documents: HashMap<String, Vec<Document>>,
}

/// A [`ChatStore`] keeping everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryChatStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        Ok(self.state.read().await.chats.get(id).cloned())
    }

    async fn save_chat(&self, chat: Chat) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.messages.entry(chat.id.clone()).or_default();
        state.chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        let mut state = self.state.write().await;
        state.messages.remove(id);
        state.streams.remove(id);
        Ok(state.chats.remove(id))
    }

    async fn update_chat_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let chat = state
            .chats
            .get_mut(id)
            .ok_or_else(|| StoreError::ChatNotFound(id.to_string()))?;
        chat.title = title.to_string();
        Ok(())
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        Ok(state.messages.get(chat_id).cloned().unwrap_or_default())
    }

    async fn upsert_message(
        &self,
        chat_id: &str,
        message: Message,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.write().await;
        if !state.chats.contains_key(chat_id) {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        let messages = state.messages.entry(chat_id.to_string()).or_default();

        let outcome = match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) if existing.parts == message.parts => UpsertOutcome::Unchanged,
            Some(existing) => {
                existing.parts = message.parts;
                UpsertOutcome::Replaced
            }
            None => {
                messages.push(message);
                UpsertOutcome::Inserted
            }
        };

        debug!(chat_id, ?outcome, "Upserted message");
        Ok(outcome)
    }

    async fn user_message_count_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        let count = state
            .chats
            .values()
            .filter(|chat| chat.user_id == user_id)
            .filter_map(|chat| state.messages.get(&chat.id))
            .flatten()
            .filter(|m| m.role == Role::User && m.created_at >= since)
            .count();
        Ok(count)
    }

    async fn create_stream_id(&self, stream_id: &str, chat_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.chats.contains_key(chat_id) {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }
        state
            .streams
            .entry(chat_id.to_string())
            .or_default()
            .push(stream_id.to_string());
        Ok(())
    }

    async fn stream_ids(&self, chat_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state.streams.get(chat_id).cloned().unwrap_or_default())
    }

    async fn save_document(&self, document: Document) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .documents
            .entry(document.id.clone())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state.documents.get(id).and_then(|v| v.last()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stepweave_core::message::Part;
    use stepweave_core::store::DocumentKind;

    async fn store_with_chat() -> InMemoryChatStore {
        let store = InMemoryChatStore::new();
        store.save_chat(Chat::new("c1", "alice", "Hello")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store_with_chat().await;
        let msg = Message::user("hi");

        assert_eq!(
            store.upsert_message("c1", msg.clone()).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_message("c1", msg.clone()).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let edited = msg.clone().with_part(Part::text(" there"));
        assert_eq!(
            store.upsert_message("c1", edited).await.unwrap(),
            UpsertOutcome::Replaced
        );

        let messages = store.messages("c1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text_content(), "hi there");
    }

    #[tokio::test]
    async fn upsert_into_unknown_chat_fails() {
        let store = InMemoryChatStore::new();
        let err = store.upsert_message("nope", Message::user("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::ChatNotFound(_)));
    }

    #[tokio::test]
    async fn counts_only_recent_user_messages_of_owner() {
        let store = store_with_chat().await;
        store.save_chat(Chat::new("c2", "bob", "Other")).await.unwrap();

        store.upsert_message("c1", Message::user("one")).await.unwrap();
        store.upsert_message("c1", Message::assistant()).await.unwrap();
        let mut old = Message::user("old");
        old.created_at = Utc::now() - Duration::hours(48);
        store.upsert_message("c1", old).await.unwrap();
        store.upsert_message("c2", Message::user("bob's")).await.unwrap();

        let since = Utc::now() - Duration::hours(24);
        assert_eq!(store.user_message_count_since("alice", since).await.unwrap(), 1);
        assert_eq!(store.user_message_count_since("bob", since).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stream_ids_are_kept_in_order_and_deleted_with_chat() {
        let store = store_with_chat().await;
        store.create_stream_id("s1", "c1").await.unwrap();
        store.create_stream_id("s2", "c1").await.unwrap();
        assert_eq!(store.stream_ids("c1").await.unwrap(), vec!["s1", "s2"]);

        let deleted = store.delete_chat("c1").await.unwrap();
        assert_eq!(deleted.unwrap().user_id, "alice");
        assert!(store.stream_ids("c1").await.unwrap().is_empty());
        assert!(store.get_chat("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn documents_return_latest_version() {
        let store = InMemoryChatStore::new();
        for content in ["v1", "v2"] {
            store
                .save_document(Document {
                    id: "d1".into(),
                    title: "Essay".into(),
                    kind: DocumentKind::Text,
                    content: content.into(),
                    user_id: "alice".into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.content, "v2");
        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn title_update_requires_chat() {
        let store = store_with_chat().await;
        store.update_chat_title("c1", "Renamed").await.unwrap();
        assert_eq!(store.get_chat("c1").await.unwrap().unwrap().title, "Renamed");
        assert!(store.update_chat_title("zz", "x").await.is_err());
    }
}
