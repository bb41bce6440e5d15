use axum::{http::StatusCode, response::IntoResponse};

use crate::{auth::AuthError, store::StoreError};

pub type AppResult<T> = Result<T, AppErr>;

/* ── HTTP / startup errors ── */
#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("Unauthorized: {0}")]
    Auth(#[from] AuthError),

    #[error("Store: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let (code, body) = match self {
            AppErr::Bad(msg)  => (StatusCode::BAD_REQUEST, msg),
            AppErr::Auth(e)   => (StatusCode::UNAUTHORIZED, e.to_string()),
            AppErr::Store(e)  => {
                tracing::error!(error = %e, "store failure on http route");
                (StatusCode::SERVICE_UNAVAILABLE, "message store unavailable".to_string())
            }
        };
        (code, body).into_response()
    }
}

/* ── in-room operation errors, reported only to the requester ── */
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not in room {0}")]
    NotInRoom(String),
}

impl ChatError {
    /// Stable wire code for the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotAuthenticated    => "NotAuthenticated",
            ChatError::InvalidMessage(_)   => "InvalidMessage",
            ChatError::Unauthorized(_)     => "Unauthorized",
            ChatError::SendFailed(_)       => "SendFailed",
            // clients only ever see SendFailed for store trouble
            ChatError::StoreUnavailable(_) => "SendFailed",
            ChatError::NotInRoom(_)        => "NotInRoom",
        }
    }

    /// Text sent to the client. Store detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::StoreUnavailable(_) => "message could not be saved, please retry".into(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ChatError::InvalidMessage(format!("unknown message {id}")),
            StoreError::Unavailable(detail) => ChatError::StoreUnavailable(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_surfaces_as_send_failed() {
        let err: ChatError = StoreError::Unavailable("disk on fire".into()).into();
        assert_eq!(err.code(), "SendFailed");
        assert!(!err.client_message().contains("disk"));
    }

    #[test]
    fn missing_message_is_invalid() {
        let err: ChatError = StoreError::NotFound(42).into();
        assert_eq!(err, ChatError::InvalidMessage("unknown message 42".into()));
    }
}
