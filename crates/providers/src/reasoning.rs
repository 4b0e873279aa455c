//! Reasoning extraction for models that inline their thoughts in text.
//!
//! Some models emit `<thinking>…</thinking>` inside ordinary content. The
//! [`ExtractReasoning`] wrapper moves everything between the tags into
//! reasoning deltas, even when a tag is split across chunks.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use stepweave_core::error::ModelError;
use stepweave_core::model::{Model, ModelEvent, ModelRequest, ModelStream};
use tokio_stream::wrappers::ReceiverStream;

/// Splits a text stream into text and reasoning around an XML-like tag.
pub struct TagSplitter {
    open: String,
    close: String,
    inside: bool,
    pending: String,
}

impl TagSplitter {
    pub fn new(tag: &str) -> Self {
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            inside: false,
            pending: String::new(),
        }
    }

    /// Feed a text chunk; returns the deltas that are certain so far.
    pub fn push(&mut self, chunk: &str) -> Vec<ModelEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let tag = if self.inside { &self.close } else { &self.open };
            if let Some(pos) = self.pending.find(tag.as_str()) {
                let before: String = self.pending[..pos].to_string();
                let tag_len = tag.len();
                self.emit(before, &mut events);
                self.pending.drain(..pos + tag_len);
                self.inside = !self.inside;
                continue;
            }

            // Hold back a suffix that could be the start of the tag
            let keep = partial_suffix_len(&self.pending, tag);
            let ready_len = self.pending.len() - keep;
            let ready: String = self.pending.drain(..ready_len).collect();
            self.emit(ready, &mut events);
            break;
        }

        events
    }

    /// Release whatever is still held back.
    pub fn flush(&mut self) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(rest, &mut events);
        events
    }

    fn emit(&self, text: String, events: &mut Vec<ModelEvent>) {
        if text.is_empty() {
            return;
        }
        events.push(if self.inside {
            ModelEvent::ReasoningDelta(text)
        } else {
            ModelEvent::TextDelta(text)
        });
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| k <= text.len() && text.ends_with(&tag[..k]))
        .unwrap_or(0)
}

/// Model wrapper applying a [`TagSplitter`] to the inner model's text.
pub struct ExtractReasoning {
    inner: Arc<dyn Model>,
    tag: String,
}

impl ExtractReasoning {
    pub fn new(inner: Arc<dyn Model>, tag: impl Into<String>) -> Self {
        Self {
            inner,
            tag: tag.into(),
        }
    }
}

#[async_trait]
impl Model for ExtractReasoning {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn run(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let mut upstream = self.inner.run(request).await?;
        let mut splitter = TagSplitter::new(&self.tag);
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(item) = upstream.next().await {
                let events = match item {
                    Ok(ModelEvent::TextDelta(text)) => splitter.push(&text),
                    Ok(other) => {
                        let mut events = splitter.flush();
                        events.push(other);
                        events
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            for event in splitter.flush() {
                let _ = tx.send(Ok(event)).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
