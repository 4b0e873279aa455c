//! Document tools.
//!
//! `create_document` and `update_document` generate document content with an
//! artifact model and stream it to the client through the run's side channel
//! while the call is in flight. The side-channel events are transient: the
//! client renders them live, the persisted message only keeps the tool
//! result.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use stepweave_core::error::ToolError;
use stepweave_core::message::generate_id;
use stepweave_core::model::{Model, ModelEvent, ModelMessage, ModelRequest};
use stepweave_core::store::{ChatStore, Document, DocumentKind};
use stepweave_core::stream::{UiEvent, UiStreamWriter};
use stepweave_core::tool::{Tool, ToolContext, ToolOutput};
use tracing::debug;

fn system_prompt(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Text => {
            "Write about the given topic. Markdown is supported. Use headings wherever appropriate."
        }
        DocumentKind::Code => {
            "You are a code generator that creates self-contained, executable code snippets. \
             Output only the code, without explanations or Markdown fences."
        }
        DocumentKind::Sheet => {
            "You are a spreadsheet creation assistant. Create a spreadsheet in CSV format \
             based on the given prompt, with meaningful column headers and data."
        }
    }
}

/// Name of the transient delta event for a document kind.
fn delta_event(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Text => "textDelta",
        DocumentKind::Code => "codeDelta",
        DocumentKind::Sheet => "sheetDelta",
    }
}

fn parse_kind(value: &serde_json::Value) -> Result<DocumentKind, ToolError> {
    match value.as_str() {
        Some("text") | None => Ok(DocumentKind::Text),
        Some("code") => Ok(DocumentKind::Code),
        Some("sheet") => Ok(DocumentKind::Sheet),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "unknown document kind: {other}"
        ))),
    }
}

/// Run the artifact model and forward every text delta to the side channel.
async fn generate(
    tool_name: &str,
    model: &dyn Model,
    kind: DocumentKind,
    system: String,
    prompt: String,
    writer: &UiStreamWriter,
) -> Result<String, ToolError> {
    let request = ModelRequest {
        messages: vec![
            ModelMessage::System { text: system },
            ModelMessage::User {
                text: prompt,
                files: Vec::new(),
            },
        ],
        ..ModelRequest::default()
    };

    let failed = |reason: String| ToolError::ExecutionFailed {
        tool_name: tool_name.to_string(),
        reason,
    };

    let mut stream = model.run(request).await.map_err(|e| failed(e.to_string()))?;
    let mut content = String::new();
    while let Some(event) = stream.next().await {
        match event.map_err(|e| failed(e.to_string()))? {
            ModelEvent::TextDelta(delta) => {
                writer.write(UiEvent::transient(delta_event(kind), json!(delta)));
                content.push_str(&delta);
            }
            ModelEvent::StepFinish { .. } => break,
            _ => {}
        }
    }
    Ok(content)
}

/// Creates a document and streams its content to the client.
pub struct CreateDocumentTool {
    model: Arc<dyn Model>,
    store: Arc<dyn ChatStore>,
}

impl CreateDocumentTool {
    pub fn new(model: Arc<dyn Model>, store: Arc<dyn ChatStore>) -> Self {
        Self { model, store }
    }
}

#[async_trait]
impl Tool for CreateDocumentTool {
    fn name(&self) -> &str {
        "create_document"
    }

    fn description(&self) -> &str {
        "Create a document for writing or content creation activities. The content is \
         generated from the title and shown to the user as it is written."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "kind": { "type": "string", "enum": ["text", "code", "sheet"] }
            },
            "required": ["title"]
        })
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let title = input["title"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'title' argument".into()))?
            .to_string();
        let kind = parse_kind(&input["kind"])?;
        let id = generate_id();
        let writer = &ctx.writer;

        writer.write(UiEvent::transient("kind", json!(kind.as_str())));
        writer.write(UiEvent::transient("id", json!(id)));
        writer.write(UiEvent::transient("title", json!(title)));
        writer.write(UiEvent::transient("clear", json!(null)));

        let content = generate(
            self.name(),
            self.model.as_ref(),
            kind,
            system_prompt(kind).to_string(),
            title.clone(),
            writer,
        )
        .await?;

        let user_id = ctx.user_id.clone().unwrap_or_default();
        self.store
            .save_document(Document {
                id: id.clone(),
                title: title.clone(),
                kind,
                content,
                user_id,
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;

        writer.write(UiEvent::transient("finish", json!(null)));
        debug!(document_id = %id, kind = kind.as_str(), "Document created");

        Ok(ToolOutput::Value(json!({
            "id": id,
            "title": title,
            "kind": kind.as_str(),
            "content": "A document was created and is now visible to the user.",
        })))
    }
}

/// Rewrites an existing document following a description of the change.
pub struct UpdateDocumentTool {
    model: Arc<dyn Model>,
    store: Arc<dyn ChatStore>,
}

impl UpdateDocumentTool {
    pub fn new(model: Arc<dyn Model>, store: Arc<dyn ChatStore>) -> Self {
        Self { model, store }
    }
}

#[async_trait]
impl Tool for UpdateDocumentTool {
    fn name(&self) -> &str {
        "update_document"
    }

    fn description(&self) -> &str {
        "Update a document with the given description of changes."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "The ID of the document to update" },
                "description": { "type": "string", "description": "The changes to make" }
            },
            "required": ["id", "description"]
        })
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = input["id"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'id' argument".into()))?;
        let description = input["description"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'description' argument".into()))?;

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "update_document".into(),
            reason,
        };

        let document = self
            .store
            .get_document(id)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed(format!("Document not found: {id}")))?;

        if let Some(user_id) = &ctx.user_id
            && !document.user_id.is_empty()
            && &document.user_id != user_id
        {
            return Err(failed(format!("Document not found: {id}")));
        }

        ctx.writer.write(UiEvent::transient("clear", json!(null)));

        let system = format!(
            "Improve the following contents of the document based on the given prompt.\n\n{}",
            document.content
        );
        let content = generate(
            self.name(),
            self.model.as_ref(),
            document.kind,
            system,
            description.to_string(),
            &ctx.writer,
        )
        .await?;

        self.store
            .save_document(Document {
                content,
                created_at: Utc::now(),
                ..document.clone()
            })
            .await
            .map_err(|e| failed(e.to_string()))?;

        ctx.writer.write(UiEvent::transient("finish", json!(null)));

        Ok(ToolOutput::Value(json!({
            "id": document.id,
            "title": document.title,
            "kind": document.kind.as_str(),
            "content": "The document has been updated successfully.",
        })))
    }
}
