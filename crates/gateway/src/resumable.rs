//! Resumable streams.
//!
//! The driver task of a turn appends every event to a [`StreamBuffer`];
//! SSE responses only tail it. A client that disconnects drops its tail and
//! nothing else, and a reconnecting client tails the same buffer again from
//! its last cursor. Buffers of finished streams stay in the
//! [`StreamRegistry`] for the configured retention and are swept lazily.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stepweave_core::stream::UiEvent;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct Log {
    events: Vec<UiEvent>,
    finished_at: Option<Instant>,
}

/// Append-only event log of one stream.
pub struct StreamBuffer {
    id: String,
    chat_id: String,
    log: Mutex<Log>,
    notify: watch::Sender<()>,
}

impl StreamBuffer {
    pub fn new(id: impl Into<String>, chat_id: impl Into<String>) -> Arc<Self> {
        let (notify, _) = watch::channel(());
        Arc::new(Self {
            id: id.into(),
            chat_id: chat_id.into(),
            log: Mutex::new(Log::default()),
            notify,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn push(&self, event: UiEvent) {
        {
            let mut log = self.lock();
            if log.finished_at.is_some() {
                return;
            }
            log.events.push(event);
        }
        self.notify.send_modify(|_| {});
    }

    /// Mark the stream complete. Tails end after the last event.
    pub fn close(&self) {
        self.lock().finished_at.get_or_insert_with(Instant::now);
        self.notify.send_modify(|_| {});
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished_at.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow the log from `cursor` to the end of the stream.
    ///
    /// Items are `(cursor after the event, event)`, so a client resuming
    /// with the last cursor it saw continues with the next event.
    pub fn tail(self: &Arc<Self>, cursor: usize) -> BoxStream<'static, (usize, UiEvent)> {
        let rx = self.notify.subscribe();
        futures::stream::unfold(
            (Arc::clone(self), cursor, rx),
            |(buffer, cursor, mut rx)| async move {
                loop {
                    let (next, finished) = {
                        let log = buffer.lock();
                        (log.events.get(cursor).cloned(), log.finished_at.is_some())
                    };
                    if let Some(event) = next {
                        return Some(((cursor + 1, event), (buffer, cursor + 1, rx)));
                    }
                    if finished || rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }

    fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.lock()
            .finished_at
            .is_some_and(|at| now.duration_since(at) >= retention)
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Live and recently finished streams by stream id.
pub struct StreamRegistry {
    retention: Duration,
    streams: tokio::sync::Mutex<HashMap<String, Arc<StreamBuffer>>>,
}

impl StreamRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            streams: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, buffer: Arc<StreamBuffer>) {
        let mut streams = self.streams.lock().await;
        Self::sweep_locked(&mut streams, self.retention);
        debug!(stream_id = %buffer.id(), chat_id = %buffer.chat_id(), "Registered resumable stream");
        streams.insert(buffer.id().to_string(), buffer);
    }

    pub async fn get(&self, stream_id: &str) -> Option<Arc<StreamBuffer>> {
        let mut streams = self.streams.lock().await;
        Self::sweep_locked(&mut streams, self.retention);
        streams.get(stream_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    fn sweep_locked(streams: &mut HashMap<String, Arc<StreamBuffer>>, retention: Duration) {
        let now = Instant::now();
        let before = streams.len();
        streams.retain(|_, buffer| !buffer.expired(now, retention));
        let swept = before - streams.len();
        if swept > 0 {
            debug!(swept, "Expired resumable streams");
        }
    }
}
