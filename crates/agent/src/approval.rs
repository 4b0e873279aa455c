//! Approval gate for tool calls that need human confirmation.
//!
//! The loop registers an approval id and parks the call on a oneshot
//! receiver. The transport answers through [`ApprovalGate::respond`], which
//! wakes exactly that call. Every approval id is answered at most once.
//!
//! Answered ids are remembered for a retention period so a late second
//! answer is told apart from an unknown id. Expired entries are swept
//! lazily on each answer.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// The user's answer to an approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("No pending approval with id {0}")]
    Unknown(String),

    #[error("Approval {0} was already answered")]
    AlreadyResolved(String),
}

/// A tool call waiting on its approval id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedCall {
    pub tool_call_id: String,
    /// Chat of the run that parked the call.
    pub chat_id: Option<String>,
}

struct Pending {
    call: ParkedCall,
    tx: oneshot::Sender<ApprovalDecision>,
}

struct Resolved {
    chat_id: Option<String>,
    at: Instant,
}

/// Shared registry of parked tool calls.
pub struct ApprovalGate {
    retention: Duration,
    pending: Mutex<HashMap<String, Pending>>,
    resolved: Mutex<HashMap<String, Resolved>>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate remembering answered ids for `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention,
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Park a call until its approval id is answered.
    pub async fn register(
        &self,
        approval_id: &str,
        tool_call_id: &str,
        chat_id: Option<&str>,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let call = ParkedCall {
            tool_call_id: tool_call_id.to_string(),
            chat_id: chat_id.map(str::to_string),
        };
        self.pending
            .lock()
            .await
            .insert(approval_id.to_string(), Pending { call, tx });
        rx
    }

    /// Answer a pending approval. Returns the tool call id it belonged to.
    pub async fn respond(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<String, ApprovalError> {
        let Some(pending) = self.pending.lock().await.remove(approval_id) else {
            if self.resolved_entries().await.contains_key(approval_id) {
                return Err(ApprovalError::AlreadyResolved(approval_id.to_string()));
            }
            return Err(ApprovalError::Unknown(approval_id.to_string()));
        };

        let ParkedCall { tool_call_id, chat_id } = pending.call;
        self.resolved_entries().await.insert(
            approval_id.to_string(),
            Resolved {
                chat_id,
                at: Instant::now(),
            },
        );
        debug!(approval_id, tool_call_id = %tool_call_id, approved = decision.approved, "Approval answered");

        // The run may have stopped in the meantime; the answer is still recorded.
        let _ = pending.tx.send(decision);
        Ok(tool_call_id)
    }

    /// The call parked on an approval id.
    pub async fn parked(&self, approval_id: &str) -> Option<ParkedCall> {
        self.pending
            .lock()
            .await
            .get(approval_id)
            .map(|p| p.call.clone())
    }

    /// Chat an approval id belongs to, whether still pending or recently
    /// answered.
    pub async fn chat_of(&self, approval_id: &str) -> Option<String> {
        if let Some(pending) = self.pending.lock().await.get(approval_id) {
            return pending.call.chat_id.clone();
        }
        self.resolved_entries()
            .await
            .get(approval_id)
            .and_then(|r| r.chat_id.clone())
    }

    /// The pending approval id of a tool call, if it is parked.
    pub async fn pending_for_call(&self, tool_call_id: &str) -> Option<String> {
        self.pending
            .lock()
            .await
            .iter()
            .find(|(_, p)| p.call.tool_call_id == tool_call_id)
            .map(|(id, _)| id.clone())
    }

    /// Drop a pending approval without answering it.
    pub async fn withdraw(&self, approval_id: &str) -> bool {
        self.pending.lock().await.remove(approval_id).is_some()
    }

    pub async fn is_pending(&self, approval_id: &str) -> bool {
        self.pending.lock().await.contains_key(approval_id)
    }

    /// Number of answered ids still remembered.
    pub async fn resolved_len(&self) -> usize {
        self.resolved_entries().await.len()
    }

    /// The answered ids, with expired entries swept.
    async fn resolved_entries(&self) -> tokio::sync::MutexGuard<'_, HashMap<String, Resolved>> {
        let mut resolved = self.resolved.lock().await;
        let now = Instant::now();
        let before = resolved.len();
        resolved.retain(|_, r| now.duration_since(r.at) < self.retention);
        let swept = before - resolved.len();
        if swept > 0 {
            debug!(swept, "Expired answered approvals");
        }
        resolved
    }
}
