//! Request-level errors of the chat API.
//!
//! Every error renders as `{ "code": "<type>:<surface>", "message": …,
//! "cause": … }` with the matching HTTP status. Failures inside a running
//! turn never come through here; they travel on the event stream.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stepweave_agent::ApprovalError;
use stepweave_core::error::StoreError;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("The request couldn't be processed. Please check your input and try again.")]
    BadRequest(String),

    #[error("You need to sign in before continuing.")]
    Unauthorized,

    #[error("This chat belongs to another user.")]
    Forbidden,

    #[error("The requested chat was not found.")]
    NotFound,

    #[error("You have exceeded your maximum number of messages for the day.")]
    RateLimit,

    #[error("We're having trouble sending your message. Please try again later.")]
    Offline(String),

    #[error("This approval was already answered.")]
    Conflict(String),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request:api",
            Self::Unauthorized => "unauthorized:chat",
            Self::Forbidden => "forbidden:chat",
            Self::NotFound => "not_found:chat",
            Self::RateLimit => "rate_limit:chat",
            Self::Offline(_) => "offline:chat",
            Self::Conflict(_) => "conflict:approval",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Offline(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    /// Detail shown next to the fixed message.
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::BadRequest(cause) | Self::Offline(cause) | Self::Conflict(cause) => Some(cause),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<&'a str>,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let Self::Offline(cause) = &self {
            warn!(cause = %cause, "Chat request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            cause: self.cause(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ChatNotFound(_) => Self::NotFound,
            other => Self::Offline(other.to_string()),
        }
    }
}

impl From<ApprovalError> for ChatError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::Unknown(_) => Self::BadRequest(e.to_string()),
            ApprovalError::AlreadyResolved(_) => Self::Conflict(e.to_string()),
        }
    }
}
