//! Seams to the remote chat backend and the audio device.
//!
//! The controller only talks to these traits, so the HTTP adapter can be
//! swapped for a fake in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::types::{Collection, Message, Session, SessionId, SourceRef, UserSettings};

use crate::error::ChatError;
use crate::session_store::SessionPatch;

/// Text chunks read from the push channel, already UTF-8 decoded.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Request opening a streamed answer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatStreamRequest {
    pub query: String,
    pub collection_id: i64,
    pub temperature: f64,
    pub top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    /// Ask the server to send a sources frame ahead of the text.
    pub fetch_sources: bool,
}

/// Request for on-demand source retrieval.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourcesRequest {
    pub query: String,
    pub collection_id: i64,
    pub temperature: f64,
    pub top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

/// Authoritative store of sessions, messages, and user settings.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All sessions of the current user, newest first, with messages.
    async fn list_sessions(&self) -> Result<Vec<Session>, ChatError>;

    /// Create a session and return the id the server assigned.
    async fn create_session(&self, session: &Session) -> Result<SessionId, ChatError>;

    async fn patch_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), ChatError>;

    async fn delete_session(&self, id: &SessionId) -> Result<(), ChatError>;

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<(), ChatError>;

    async fn get_user_settings(&self) -> Result<UserSettings, ChatError>;

    async fn save_user_settings(&self, settings: &UserSettings)
        -> Result<UserSettings, ChatError>;

    async fn reset_user_settings(&self) -> Result<UserSettings, ChatError>;

    async fn list_collections(&self) -> Result<Vec<Collection>, ChatError>;

    /// Open the push channel for one answer.
    async fn open_chat_stream(&self, request: &ChatStreamRequest)
        -> Result<ChunkStream, ChatError>;

    async fn fetch_sources(&self, request: &SourcesRequest) -> Result<Vec<SourceRef>, ChatError>;

    async fn translate(&self, text: &str) -> Result<String, ChatError>;

    /// Synthesize `text` with `voice`; returns WAV bytes.
    async fn synthesize_speech(&self, text: &str, voice: &str) -> Result<Vec<u8>, ChatError>;
}

/// Plays synthesized audio.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play `wav` to completion, returning early once `cancel` fires.
    async fn play(&self, wav: Vec<u8>, cancel: CancellationToken) -> Result<(), ChatError>;
}

/// Player that discards audio. Used when no output device is configured.
#[derive(Debug, Default)]
pub struct NullPlayer;

#[async_trait]
impl AudioPlayer for NullPlayer {
    async fn play(&self, wav: Vec<u8>, _cancel: CancellationToken) -> Result<(), ChatError> {
        debug!(bytes = wav.len(), "Discarding synthesized audio");
        Ok(())
    }
}

/// Run a remote write in the background. Failures are logged only; local
/// state stays authoritative.
pub(crate) fn spawn_remote_write<F>(operation: &'static str, write: F)
where
    F: Future<Output = Result<(), ChatError>> + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(operation, "No async runtime; remote write skipped");
        return;
    };
    handle.spawn(async move {
        match write.await {
            Ok(()) => debug!(operation, "Remote write completed"),
            Err(e) => {
                let err = ChatError::RemoteWrite {
                    operation,
                    message: e.to_string(),
                };
                warn!(error = %err, "Remote write failed; keeping local state");
            }
        }
    });
}

fn skip_pending(id: &SessionId, operation: &'static str) -> bool {
    if id.is_pending() {
        debug!(session_id = %id, operation, "Session not yet on server; skipping remote write");
        return true;
    }
    false
}

pub(crate) fn mirror_session_patch(remote: &Arc<dyn RemoteStore>, id: &SessionId, patch: SessionPatch) {
    if patch.is_empty() || skip_pending(id, "patch session") {
        return;
    }
    let remote = Arc::clone(remote);
    let id = id.clone();
    spawn_remote_write("patch session", async move {
        remote.patch_session(&id, &patch).await
    });
}

pub(crate) fn mirror_message(remote: &Arc<dyn RemoteStore>, id: &SessionId, message: Message) {
    if skip_pending(id, "append message") {
        return;
    }
    let remote = Arc::clone(remote);
    let id = id.clone();
    spawn_remote_write("append message", async move {
        remote.append_message(&id, &message).await
    });
}

pub(crate) fn mirror_delete(remote: &Arc<dyn RemoteStore>, id: &SessionId) {
    if skip_pending(id, "delete session") {
        return;
    }
    let remote = Arc::clone(remote);
    let id = id.clone();
    spawn_remote_write("delete session", async move {
        remote.delete_session(&id).await
    });
}
