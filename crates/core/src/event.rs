//! Domain events broadcast between bounded contexts.
//!
//! Events are published when a run starts, a step completes, a tool is
//! executed, a run stops or its messages are persisted. Other components
//! (the `/api/events` feed, tests) subscribe without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Something that happened in a run or to a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    RunStarted {
        run_id: String,
        chat_id: String,
        model: String,
        timestamp: DateTime<Utc>,
    },

    StepCompleted {
        run_id: String,
        step: usize,
        tool_calls: usize,
        timestamp: DateTime<Utc>,
    },

    ToolExecuted {
        run_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    RunStopped {
        run_id: String,
        reason: String,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// Finished messages of a run were written to the store.
    MessagesPersisted {
        chat_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::RunStopped { .. } => "run_stopped",
            Self::MessagesPersisted { .. } => "messages_persisted",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

/// Fan-out of [`DomainEvent`]s to any number of listeners.
///
/// Slow listeners lag and lose the oldest events; publishers never wait.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
        }
    }

    pub fn publish(&self, event: DomainEvent) {
        trace!(kind = event.kind(), "Domain event");
        // Err only means nobody is listening.
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
