//! Stream multiplexer.
//!
//! [`create_ui_stream`] runs an `execute` closure on its own task and hands
//! it a [`UiStreamWriter`]. The closure, and every sub-stream merged through
//! clones of the writer, feed one channel. The resulting [`UiStream`] has a
//! single consumer and ends once every writer clone is gone.

use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use stepweave_core::message::{Message, generate_id};
use stepweave_core::stream::{UiEvent, UiEventReceiver, UiStreamWriter};
use tracing::{debug, warn};

use crate::assembler::MessageAssembler;

/// Events closing a response that stopped early: a text block telling the
/// user what happened, the `error` event and the final `finish`.
pub fn interruption_events(cause: &str) -> Vec<UiEvent> {
    let id = generate_id();
    vec![
        UiEvent::text_start(&id),
        UiEvent::text_delta(
            &id,
            format!("\n\nSomething went wrong and the response stopped: {cause}"),
        ),
        UiEvent::text_end(&id),
        UiEvent::error(cause),
        UiEvent::finish("error"),
    ]
}

/// Start `execute` and return the merged stream of everything it writes.
///
/// An `Err` returned by `execute`, or a panic inside it, is reported on the
/// stream as an interruption instead of failing the transport.
pub fn create_ui_stream<F, Fut, E>(execute: F) -> UiStream
where
    F: FnOnce(UiStreamWriter) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (writer, rx) = UiStreamWriter::channel();
    let handle = tokio::spawn(execute(writer.clone()));

    tokio::spawn(async move {
        let cause = match handle.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(error = %cause, "Stream execution failed");
        for event in interruption_events(&cause) {
            writer.write(event);
        }
    });

    UiStream {
        rx,
        cleanup: Vec::new(),
    }
}

/// The consumer side of a merged run stream.
pub struct UiStream {
    rx: UiEventReceiver,
    cleanup: Vec<BoxFuture<'static, ()>>,
}

impl UiStream {
    /// Run `action` in the background once the stream has ended.
    #[must_use]
    pub fn on_finish(mut self, action: impl Future<Output = ()> + Send + 'static) -> Self {
        self.cleanup.push(Box::pin(action));
        self
    }

    /// Next event, `None` once every producer is done.
    pub async fn next(&mut self) -> Option<UiEvent> {
        self.rx.recv().await
    }

    /// Consume the stream to its end and return the assembled messages.
    ///
    /// `on_event` sees every event in order. Finish actions are spawned once
    /// the last event has been read.
    pub async fn drive(
        mut self,
        mut assembler: MessageAssembler,
        mut on_event: impl FnMut(&UiEvent),
    ) -> Vec<Message> {
        let mut count = 0usize;
        while let Some(event) = self.rx.recv().await {
            assembler.push(&event);
            on_event(&event);
            count += 1;
        }
        debug!(events = count, cleanup = self.cleanup.len(), "UI stream finished");

        for action in self.cleanup.drain(..) {
            tokio::spawn(action);
        }
        assembler.finish()
    }

    /// Collect every event, running finish actions at the end.
    pub async fn collect(self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        self.drive(MessageAssembler::new(), |e| events.push(e.clone()))
            .await;
        events
    }
}
