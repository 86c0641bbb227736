use serde::{Deserialize, Serialize};

use crate::types::{ExchangeState, Notice, SessionId, StreamingDraft, UtilityToken};

/// State changes published by the chat controller.
///
/// The presentation layer subscribes to these and re-reads whatever
/// snapshot it needs; events are notifications, not the source of truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ChatEvent {
    /// Session list or active session changed.
    SessionsChanged {
        active_session_id: Option<SessionId>,
    },

    /// A session's pending id was replaced by the server-assigned id.
    SessionIdAssigned {
        pending_id: SessionId,
        server_id: SessionId,
    },

    /// Exchange lifecycle moved.
    ExchangeStateChanged { state: ExchangeState },

    /// Partial assistant reply after a channel read.
    DraftUpdated { draft: StreamingDraft },

    /// The draft was discarded or committed.
    DraftCleared { session_id: SessionId },

    /// An assistant message was committed from the draft.
    MessageCommitted {
        session_id: SessionId,
        message_id: String,
    },

    /// The utility slot changed occupant.
    UtilityChanged { token: Option<UtilityToken> },

    /// A notice appeared, or `None` when it cleared.
    NoticeChanged { notice: Option<Notice> },

    /// Standing user defaults or the collection cache changed.
    SettingsChanged,
}
