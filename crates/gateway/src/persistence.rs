//! Reconciling finished messages with the store.
//!
//! Writes of one chat are serialised behind a per-chat lock and every write
//! is an upsert keyed by message id, so persisting the same finished
//! messages twice changes nothing. A write never moves a stored tool call
//! backwards in its lifecycle: a finished message that would is skipped.
//!
//! Approval-flow continuations are rebuilt from the stored copy of the
//! carried message. The client contributes only its answers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use stepweave_core::error::StoreError;
use stepweave_core::message::{Approval, Message, Role, ToolState};
use stepweave_core::store::{ChatStore, UpsertOutcome};
use tracing::{debug, info, warn};

use crate::error::ChatError;

/// One async lock per chat id.
#[derive(Default)]
pub struct ChatLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatLocks {
    pub fn for_chat(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop locks nobody holds any more.
        if locks.len() > 1_000 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(chat_id.to_string()).or_default())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Messages skipped because the stored copy is further along.
    pub stale: usize,
}

/// Write the finished messages of a turn.
///
/// New messages are appended and known ids replaced in place, unless a
/// tool call in the stored copy cannot reach its state in the finished
/// copy.
pub async fn persist_finished(
    store: &dyn ChatStore,
    locks: &ChatLocks,
    chat_id: &str,
    finished: Vec<Message>,
) -> Result<PersistReport, StoreError> {
    let lock = locks.for_chat(chat_id);
    let _guard = lock.lock().await;

    let stored: HashMap<String, Message> = store
        .messages(chat_id)
        .await?
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();

    let mut report = PersistReport::default();
    for message in finished.into_iter().filter(|m| !m.parts.is_empty()) {
        if let Some(current) = stored.get(&message.id)
            && let Some((call_id, from, to)) = regression(current, &message)
        {
            warn!(
                chat_id,
                message_id = %message.id,
                tool_call_id = %call_id,
                stored = %from,
                finished = %to,
                "Skipping stale message"
            );
            report.stale += 1;
            continue;
        }
        let id = message.id.clone();
        match store.upsert_message(chat_id, message).await? {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Replaced => report.replaced += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
        debug!(chat_id, message_id = %id, "Persisted finished message");
    }

    info!(
        chat_id,
        inserted = report.inserted,
        replaced = report.replaced,
        unchanged = report.unchanged,
        stale = report.stale,
        "Persisted turn"
    );
    Ok(report)
}

/// First tool call whose stored state cannot advance to the incoming one.
fn regression<'a>(stored: &'a Message, incoming: &Message) -> Option<(&'a str, ToolState, ToolState)> {
    stored.tool_invocations().find_map(|current| {
        let next = incoming.tool_invocation(&current.tool_call_id)?;
        (!current.state.can_reach(next.state))
            .then_some((current.tool_call_id.as_str(), current.state, next.state))
    })
}

/// A continuation rebuilt from the store.
#[derive(Debug)]
pub struct Continuation {
    /// Stored conversation up to the resumed message, which carries the
    /// client's answers.
    pub history: Vec<Message>,
    /// The resumed message, when it has answered calls to run.
    pub seed: Option<Message>,
    pub approval_ids: Vec<String>,
}

/// Check a carried assistant message against the store and rebuild it.
///
/// Every answered call must be stored under the same message as
/// `approval-requested`, with the same approval id, tool name and input.
/// A call already resolved is a conflict. The rebuilt message is the
/// stored one with only the approval answers taken from the client.
pub fn resume_from_store(stored: Vec<Message>, carried: &Message) -> Result<Continuation, ChatError> {
    if carried.role != Role::Assistant {
        return Err(ChatError::BadRequest(
            "the last message of an approval flow must be the assistant message".into(),
        ));
    }
    let Some(index) = stored.iter().position(|m| m.id == carried.id) else {
        return Err(ChatError::BadRequest(format!(
            "message {} is not part of this chat",
            carried.id
        )));
    };
    let mut history = stored;
    history.truncate(index + 1);
    let mut resumed = history[index].clone();

    let mut approval_ids = Vec::new();
    for answered in carried
        .tool_invocations()
        .filter(|inv| inv.state == ToolState::ApprovalResponded)
    {
        let call_id = &answered.tool_call_id;
        let Some(current) = resumed.tool_invocation(call_id) else {
            return Err(ChatError::BadRequest(format!("unknown tool call {call_id}")));
        };
        if current.state.is_terminal() || current.state == ToolState::ApprovalResponded {
            return Err(ChatError::Conflict(format!(
                "tool call {call_id} was already resolved"
            )));
        }
        if current.state != ToolState::ApprovalRequested {
            return Err(ChatError::BadRequest(format!(
                "tool call {call_id} is not waiting for approval"
            )));
        }
        let (Some(expected), Some(answer)) = (current.approval.as_ref(), answered.approval.as_ref()) else {
            return Err(ChatError::BadRequest(format!(
                "tool call {call_id} has no approval"
            )));
        };
        let Some(approved) = answer.approved else {
            return Err(ChatError::BadRequest(format!(
                "tool call {call_id} has no answer"
            )));
        };
        if expected.id != answer.id
            || current.tool_name != answered.tool_name
            || current.input != answered.input
        {
            return Err(ChatError::BadRequest(format!(
                "tool call {call_id} does not match the stored call"
            )));
        }

        let mut resolved = current.clone();
        resolved.state = ToolState::ApprovalResponded;
        resolved.approval = Some(Approval {
            id: expected.id.clone(),
            approved: Some(approved),
            reason: answer.reason.clone(),
        });
        approval_ids.push(expected.id.clone());
        resumed.upsert_tool_invocation(resolved);
    }

    let seed = (!approval_ids.is_empty()).then(|| resumed.clone());
    history[index] = resumed;
    Ok(Continuation {
        history,
        seed,
        approval_ids,
    })
}

/// Approval ids currently being continued.
#[derive(Default)]
pub struct ApprovalClaims {
    claimed: Arc<Mutex<HashSet<String>>>,
}

/// Releases its approval ids when dropped.
pub struct Claim {
    ids: Vec<String>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl ApprovalClaims {
    /// Claim every id or none of them.
    pub fn claim(&self, ids: Vec<String>) -> Result<Claim, ChatError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(taken) = ids.iter().find(|id| claimed.contains(*id)) {
            return Err(ChatError::Conflict(format!(
                "approval {taken} is already being continued"
            )));
        }
        claimed.extend(ids.iter().cloned());
        Ok(Claim {
            ids,
            claimed: Arc::clone(&self.claimed),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            claimed.remove(id);
        }
    }
}
