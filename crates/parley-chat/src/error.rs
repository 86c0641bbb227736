//! Error types for the chat controller.

use parley_core::error::ParleyError;

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any state changed.
    Validation,
    /// Remote store unreachable, timed out, or answered with a failure.
    Network,
    /// Background mirror write failed; logged only.
    RemoteWrite,
    /// Streamed bytes could not be decoded into text.
    ProtocolDecode,
    /// Audio could not be played.
    Playback,
    /// Local cache unavailable.
    Storage,
}

/// Errors from the chat controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("title cannot be empty")]
    EmptyTitle,
    #[error("select a collection before sending a message")]
    NoCollection,
    #[error("a response is already in progress")]
    ExchangeInProgress,
    #[error("collection cannot change once the conversation has started")]
    CollectionLocked,
    #[error("cannot delete the last remaining session")]
    LastSession,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: String,
        max: String,
    },
    #[error("another action is in progress: {0}")]
    UtilityBusy(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("no data received for {0} seconds")]
    StreamTimeout(u64),
    #[error("{operation} failed: {message}")]
    RemoteWrite {
        operation: &'static str,
        message: String,
    },
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),
    #[error("playback error: {0}")]
    Playback(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::EmptyMessage
            | ChatError::EmptyTitle
            | ChatError::NoCollection
            | ChatError::ExchangeInProgress
            | ChatError::CollectionLocked
            | ChatError::LastSession
            | ChatError::SessionNotFound(_)
            | ChatError::MessageNotFound(_)
            | ChatError::OutOfRange { .. }
            | ChatError::UtilityBusy(_) => ErrorKind::Validation,
            ChatError::Network(_) | ChatError::Remote { .. } | ChatError::StreamTimeout(_) => {
                ErrorKind::Network
            }
            ChatError::RemoteWrite { .. } => ErrorKind::RemoteWrite,
            ChatError::ProtocolDecode(_) => ErrorKind::ProtocolDecode,
            ChatError::Playback(_) => ErrorKind::Playback,
            ChatError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<ParleyError> for ChatError {
    fn from(err: ParleyError) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ChatError::ProtocolDecode(err.to_string());
        }
        match err.status() {
            Some(status) => ChatError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ChatError::Network(err.to_string()),
        }
    }
}
