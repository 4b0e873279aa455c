//! Chat API handlers.
//!
//! - `POST   /api/chat`               start a turn or continue after approvals
//! - `GET    /api/chat/{id}/stream`   rejoin the latest stream of a chat
//! - `POST   /api/chat/approval`      answer a parked tool call
//! - `DELETE /api/chat?id=`           delete a chat
//! - `GET    /api/chat/{id}/messages` stored messages of a chat

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use stepweave_agent::{AgentLoop, ApprovalDecision, MessageAssembler, create_ui_stream};
use stepweave_core::event::DomainEvent;
use stepweave_core::message::{Message, Role, ToolState, generate_id};
use stepweave_core::store::{Chat, Visibility};
use stepweave_core::stream::{UiEvent, UiStreamWriter};
use stepweave_tools::teardown;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::auth::{AuthUser, check_entitlement};
use crate::error::ChatError;
use crate::persistence::{Continuation, persist_finished, resume_from_store};
use crate::resumable::StreamBuffer;

/// Response header carrying the resumable stream id.
pub const STREAM_ID_HEADER: &str = "x-stream-id";

const DEFAULT_TITLE: &str = "New chat";
const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: String,

    /// New user message of a normal turn
    #[serde(default)]
    pub message: Option<Message>,

    /// Whole conversation of an approval-flow continuation
    #[serde(default)]
    pub messages: Option<Vec<Message>>,

    #[serde(default)]
    pub selected_chat_model: Option<String>,

    #[serde(default)]
    pub selected_visibility_type: Visibility,
}

enum Input {
    Message(Message),
    Continuation(Vec<Message>),
}

impl ChatRequest {
    fn into_input(self) -> Result<(String, Input), ChatError> {
        if self.id.trim().is_empty() {
            return Err(ChatError::BadRequest("id is required".into()));
        }
        let input = match (self.message, self.messages) {
            (Some(message), None) => {
                if message.role != Role::User || message.parts.is_empty() {
                    return Err(ChatError::BadRequest(
                        "message must be a non-empty user message".into(),
                    ));
                }
                Input::Message(message)
            }
            (None, Some(messages)) => {
                if messages.last().is_none_or(|m| m.role != Role::Assistant) {
                    return Err(ChatError::BadRequest(
                        "messages must end with the assistant message being continued".into(),
                    ));
                }
                Input::Continuation(messages)
            }
            _ => {
                return Err(ChatError::BadRequest(
                    "exactly one of message or messages is required".into(),
                ));
            }
        };
        Ok((self.id, input))
    }
}

/// `POST /api/chat`: run a turn and stream it as SSE.
pub async fn post_chat(
    State(state): State<SharedState>,
    user: AuthUser,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ChatError> {
    let Json(request) = body.map_err(|e| ChatError::BadRequest(e.body_text()))?;
    let model_id = request.selected_chat_model.clone();
    let visibility = request.selected_visibility_type;
    let (chat_id, input) = request.into_input()?;

    check_entitlement(state.store.as_ref(), &state.config.gateway.entitlements, &user).await?;

    let chat = state.store.get_chat(&chat_id).await?;
    let mut title = None;
    match (&chat, &input) {
        (Some(chat), _) if chat.user_id != user.id => return Err(ChatError::Forbidden),
        (Some(_), _) => {}
        (None, Input::Continuation(_)) => return Err(ChatError::NotFound),
        (None, Input::Message(message)) => {
            let mut chat = Chat::new(&chat_id, &user.id, DEFAULT_TITLE);
            chat.visibility = visibility;
            state.store.save_chat(chat).await?;
            title = Some(title_from(message));
        }
    }

    let (history, seed, claim) = match input {
        Input::Message(message) => {
            let mut history = state.store.messages(&chat_id).await?;
            state.store.upsert_message(&chat_id, message.clone()).await?;
            history.push(message);
            (history, None, None)
        }
        Input::Continuation(messages) => {
            let Some(carried) = messages.into_iter().last() else {
                return Err(ChatError::BadRequest("messages must not be empty".into()));
            };
            if let Some(response) = answer_live_run(&state, &chat_id, &carried).await? {
                return Ok(response);
            }
            let Continuation {
                history,
                seed,
                approval_ids,
            } = resume_from_store(state.store.messages(&chat_id).await?, &carried)?;
            let claim = if approval_ids.is_empty() {
                None
            } else {
                Some(state.claims.claim(approval_ids)?)
            };
            (history, seed, claim)
        }
    };

    let model = state.models.resolve(model_id.as_deref());
    let lease = state.tools.lease().await;
    let agent = AgentLoop::from_config(model, Arc::clone(&lease.registry), &state.config.agent)
        .with_approvals(Arc::clone(&state.approvals))
        .with_event_bus(Arc::clone(&state.event_bus))
        .with_user(user.id.clone())
        .with_chat(chat_id.clone());

    let stream_id = generate_id();
    let buffer = StreamBuffer::new(&stream_id, &chat_id);
    if state.config.resumable.enabled {
        state.store.create_stream_id(&stream_id, &chat_id).await?;
        state.streams.register(Arc::clone(&buffer)).await;
    }

    info!(
        chat_id = %chat_id,
        stream_id = %stream_id,
        user_id = %user.id,
        continuation = seed.is_some(),
        messages = history.len(),
        "Starting chat turn"
    );

    let title_state = Arc::clone(&state);
    let title_chat = chat_id.clone();
    let ui = create_ui_stream(move |writer: UiStreamWriter| async move {
        if let Some(title) = title {
            writer.write(UiEvent::transient("chat-title", json!(title)));
            if let Err(e) = title_state.store.update_chat_title(&title_chat, &title).await {
                warn!(chat_id = %title_chat, error = %e, "Failed to store chat title");
            }
        }
        agent.run(history, writer).await;
        Ok::<(), Infallible>(())
    })
    .on_finish(teardown(lease.owned));

    let driver_buffer = Arc::clone(&buffer);
    tokio::spawn(async move {
        let assembler = match seed {
            Some(message) => MessageAssembler::continuing(message),
            None => MessageAssembler::new(),
        };
        let sink = Arc::clone(&driver_buffer);
        let finished = ui.drive(assembler, |event| sink.push(event.clone())).await;

        match persist_finished(state.store.as_ref(), &state.locks, &chat_id, finished).await {
            Ok(report) => state.event_bus.publish(DomainEvent::MessagesPersisted {
                chat_id: chat_id.clone(),
                count: report.inserted + report.replaced,
                timestamp: chrono::Utc::now(),
            }),
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "Failed to persist finished messages");
                state.event_bus.publish(DomainEvent::ErrorOccurred {
                    context: format!("persist chat {chat_id}"),
                    error_message: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }
        driver_buffer.close();
        drop(claim);
    });

    Ok(sse_response(&buffer, 0, Some(stream_id)))
}

/// Route the answers of a continuation to calls still parked in a live run.
///
/// Returns `None` when none of the answered calls is parked, leaving the
/// continuation to be rebuilt from the store. Otherwise every answered call
/// must be parked in this chat; the answers wake the run and the response
/// follows its stream.
async fn answer_live_run(
    state: &SharedState,
    chat_id: &str,
    carried: &Message,
) -> Result<Option<Response>, ChatError> {
    let mut answers = Vec::new();
    let mut parked = 0;
    for inv in carried
        .tool_invocations()
        .filter(|inv| inv.state == ToolState::ApprovalResponded)
    {
        let Some(approval) = inv.approval.as_ref() else {
            continue;
        };
        if let Some(call) = state.approvals.parked(&approval.id).await {
            if call.tool_call_id != inv.tool_call_id || call.chat_id.as_deref() != Some(chat_id) {
                return Err(ChatError::BadRequest(format!(
                    "approval {} belongs to another tool call",
                    approval.id
                )));
            }
            parked += 1;
        }
        let approved = approval.approved.ok_or_else(|| {
            ChatError::BadRequest(format!("tool call {} has no answer", inv.tool_call_id))
        })?;
        let decision = ApprovalDecision {
            approved,
            reason: approval.reason.clone(),
        };
        answers.push((approval.id.clone(), decision));
    }

    if parked == 0 {
        return Ok(None);
    }
    if parked < answers.len() {
        return Err(ChatError::Conflict(
            "some answered calls are no longer waiting for approval".into(),
        ));
    }

    let approval_ids: Vec<String> = answers.iter().map(|(id, _)| id.clone()).collect();
    let _claim = state.claims.claim(approval_ids.clone())?;
    for (approval_id, decision) in answers {
        let approved = decision.approved;
        let tool_call_id = state.approvals.respond(&approval_id, decision).await?;
        info!(
            chat_id,
            approval_id = %approval_id,
            tool_call_id = %tool_call_id,
            approved,
            "Continuation answered a live run"
        );
    }

    let buffer = match state.store.stream_ids(chat_id).await?.pop() {
        Some(id) => state.streams.get(&id).await,
        None => None,
    };
    let response = match buffer.filter(|b| b.chat_id() == chat_id) {
        Some(buffer) => sse_response(&buffer, 0, Some(buffer.id().to_string())),
        None => (StatusCode::ACCEPTED, Json(json!({ "answered": approval_ids }))).into_response(),
    };
    Ok(Some(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeQuery {
    #[serde(default)]
    pub cursor: Option<usize>,

    #[serde(default)]
    pub stream_id: Option<String>,
}

/// `GET /api/chat/{id}/stream`: replay from the cursor and follow the rest.
///
/// Answers `204 No Content` when there is nothing to resume.
pub async fn resume_stream(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(chat_id): Path<String>,
    query: Result<Query<ResumeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, ChatError> {
    let Query(query) = query.map_err(|e| ChatError::BadRequest(e.body_text()))?;
    owned_chat(&state, &user, &chat_id).await?;

    if !state.config.resumable.enabled {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let stream_id = match query.stream_id {
        Some(id) => Some(id),
        None => state.store.stream_ids(&chat_id).await?.pop(),
    };
    let buffer = match stream_id {
        Some(id) => state.streams.get(&id).await,
        None => None,
    };
    let Some(buffer) = buffer.filter(|b| b.chat_id() == chat_id) else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(query.cursor)
        .unwrap_or(0);

    info!(chat_id = %chat_id, stream_id = %buffer.id(), cursor, "Resuming stream");
    Ok(sse_response(&buffer, cursor, None))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub approval_id: String,
    pub tool_call_id: String,
    pub approved: bool,
}

/// `POST /api/chat/approval`: wake a parked tool call.
///
/// Only the owner of the chat whose run parked the call may answer it.
pub async fn respond_approval(
    State(state): State<SharedState>,
    user: AuthUser,
    body: Result<Json<ApprovalRequest>, JsonRejection>,
) -> Result<Json<ApprovalResponse>, ChatError> {
    let Json(request) = body.map_err(|e| ChatError::BadRequest(e.body_text()))?;
    if let Some(chat_id) = state.approvals.chat_of(&request.approval_id).await {
        owned_chat(&state, &user, &chat_id).await?;
    }

    let decision = ApprovalDecision {
        approved: request.approved,
        reason: request.reason,
    };
    let tool_call_id = state
        .approvals
        .respond(&request.approval_id, decision)
        .await?;

    info!(
        approval_id = %request.approval_id,
        tool_call_id = %tool_call_id,
        approved = request.approved,
        user_id = %user.id,
        "Approval answered"
    );
    Ok(Json(ApprovalResponse {
        approval_id: request.approval_id,
        tool_call_id,
        approved: request.approved,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub id: Option<String>,
}

/// `DELETE /api/chat?id=`
pub async fn delete_chat(
    State(state): State<SharedState>,
    user: AuthUser,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Chat>, ChatError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChatError::BadRequest("id is required".into()))?;

    match state.store.get_chat(&id).await? {
        Some(chat) if chat.user_id == user.id => {}
        _ => return Err(ChatError::Forbidden),
    }

    let deleted = state.store.delete_chat(&id).await?.ok_or(ChatError::NotFound)?;
    info!(chat_id = %id, user_id = %user.id, "Deleted chat");
    Ok(Json(deleted))
}

/// `GET /api/chat/{id}/messages`
pub async fn list_messages(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Message>>, ChatError> {
    owned_chat(&state, &user, &chat_id).await?;
    Ok(Json(state.store.messages(&chat_id).await?))
}

async fn owned_chat(state: &SharedState, user: &AuthUser, chat_id: &str) -> Result<Chat, ChatError> {
    match state.store.get_chat(chat_id).await? {
        None => Err(ChatError::NotFound),
        Some(chat) if chat.user_id != user.id => Err(ChatError::Forbidden),
        Some(chat) => Ok(chat),
    }
}

fn sse_response(buffer: &Arc<StreamBuffer>, cursor: usize, stream_id: Option<String>) -> Response {
    let events = buffer.tail(cursor).map(|(cursor, event)| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().id(cursor.to_string()).data(data))
    });
    let sse = Sse::new(events);
    match stream_id {
        Some(id) => ([(STREAM_ID_HEADER, id)], sse).into_response(),
        None => sse.into_response(),
    }
}

/// Chat title from the first line of a user message.
pub fn title_from(message: &Message) -> String {
    let text = message.text_content();
    let line = text.lines().map(str::trim).find(|l| !l.is_empty());
    match line {
        Some(line) if line.chars().count() > MAX_TITLE_CHARS => {
            let cut: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
            format!("{}...", cut.trim_end())
        }
        Some(line) => line.to_string(),
        None => DEFAULT_TITLE.to_string(),
    }
}
