//! Chat controller: the single entry point the presentation layer drives.
//!
//! Owns the session store, the settings synchronizer, the utility mutex,
//! and at most one streaming exchange. State changes are published as
//! [`ChatEvent`]s; snapshots are read through the accessor methods.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::config::{ChatConfig, ParleyConfig};
use parley_core::events::ChatEvent;
use parley_core::types::{
    Collection, ExchangeState, Message, Notice, Session, SessionId, StreamingDraft, UserSettings,
    UtilityKind, UtilityToken,
};
use parley_storage::{Database, KvStore};

use crate::error::ChatError;
use crate::frame::{Frame, FrameDecoder};
use crate::notice::Notifier;
use crate::remote::{
    mirror_delete, mirror_message, mirror_session_patch, spawn_remote_write, AudioPlayer,
    ChatStreamRequest, RemoteStore, SourcesRequest,
};
use crate::session_store::{Attachment, SessionPatch, SessionStore};
use crate::settings::{SettingsPatch, SettingsSynchronizer};
use crate::utility::{UtilityMutex, UtilityOutcome};

/// Suffix marking a truncated title.
const TITLE_ELLIPSIS: &str = "...";

/// How a [`ChatController::send`] call ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The assistant reply was appended to the session.
    Committed {
        session_id: SessionId,
        message_id: String,
    },
    /// `stop()` ended the exchange; nothing was committed.
    Stopped,
    /// The session was deleted while the reply streamed.
    Discarded,
}

/// Title for a session derived from its first user message.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() > max_chars {
        let mut title: String = text.chars().take(max_chars).collect();
        title.push_str(TITLE_ELLIPSIS);
        title
    } else {
        text.to_string()
    }
}

#[derive(Debug)]
struct ActiveExchange {
    state: ExchangeState,
    session_id: SessionId,
    cancel: CancellationToken,
    draft: Option<StreamingDraft>,
}

/// Releases the exchange slot on every exit path of `send`, including the
/// caller dropping the future.
struct ExchangeGuard<'a> {
    controller: &'a ChatController,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.controller.finish_exchange();
    }
}

pub struct ChatController {
    config: ChatConfig,
    idle_timeout: Duration,
    store: Arc<SessionStore>,
    settings: SettingsSynchronizer,
    remote: Arc<dyn RemoteStore>,
    player: Arc<dyn AudioPlayer>,
    utilities: Arc<UtilityMutex>,
    notices: Arc<Notifier>,
    exchange: Mutex<Option<ActiveExchange>>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatController {
    /// Build a controller and hydrate it from the cache.
    pub fn new(
        config: &ParleyConfig,
        kv: KvStore,
        remote: Arc<dyn RemoteStore>,
        player: Arc<dyn AudioPlayer>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.chat.event_capacity.max(1));
        let store = Arc::new(SessionStore::new(kv.clone()));
        let settings = SettingsSynchronizer::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            kv,
            config.defaults.clone(),
            events.clone(),
        );
        let controller = Self {
            config: config.chat.clone(),
            idle_timeout: config.remote.stream_idle_timeout(),
            store,
            settings,
            remote,
            player,
            utilities: Arc::new(UtilityMutex::new(Some(events.clone()))),
            notices: Arc::new(Notifier::new(config.chat.notice_ttl(), events.clone())),
            exchange: Mutex::new(None),
            events,
        };
        controller.hydrate();
        controller
    }

    /// Open the on-disk cache under `general.data_dir`, namespaced by
    /// `general.namespace`, and build a controller over it.
    pub fn open(
        config: &ParleyConfig,
        remote: Arc<dyn RemoteStore>,
        player: Arc<dyn AudioPlayer>,
    ) -> Result<Self, ChatError> {
        let path = config.general.cache_db_path();
        let db = Database::new(&path)?;
        info!(
            path = %path.display(),
            namespace = %config.general.namespace,
            "Opened cache database"
        );
        let kv = KvStore::new(Arc::new(db), config.general.namespace.clone());
        Ok(Self::new(config, kv, remote, player))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn sessions(&self) -> Vec<Session> {
        self.store.sessions()
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.store.session(id)
    }

    pub fn active_session(&self) -> Option<Session> {
        self.store.active_session()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.store.active_id()
    }

    /// The partial assistant reply, while one is streaming.
    pub fn draft(&self) -> Option<StreamingDraft> {
        self.exchange
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|ex| ex.draft.clone()))
    }

    pub fn exchange_state(&self) -> ExchangeState {
        self.exchange
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|ex| ex.state))
            .unwrap_or(ExchangeState::Idle)
    }

    /// Whether a send is waiting for or reading a reply.
    pub fn is_loading(&self) -> bool {
        self.exchange_state() != ExchangeState::Idle
    }

    pub fn active_utility(&self) -> Option<UtilityToken> {
        self.utilities.current()
    }

    pub fn notice(&self) -> Option<Notice> {
        self.notices.current()
    }

    pub fn user_settings(&self) -> UserSettings {
        self.settings.user_settings()
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.settings.collections()
    }

    pub fn selected_collection(&self) -> Option<i64> {
        self.settings.selected_collection()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Populate sessions, defaults, and collections from the cache.
    pub fn hydrate(&self) {
        self.settings.hydrate();
        if let Err(e) = self.store.hydrate(&self.settings.generation_defaults()) {
            error!(error = %e, "Failed to hydrate sessions");
        }
        self.publish_sessions();
    }

    /// Fetch authoritative state from the remote store. On failure the
    /// cache-hydrated sessions stay in place.
    pub async fn load(&self) -> Result<(), ChatError> {
        self.settings.load_user_settings().await;
        let result = match self.remote.list_sessions().await {
            Ok(remote) => self
                .store
                .replace_all(remote, &self.settings.generation_defaults()),
            Err(e) => {
                warn!(error = %e, "Failed to fetch sessions; keeping cached state");
                Err(e)
            }
        };
        self.settings.load_collections().await;
        self.publish_sessions();
        self.surface(result)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Start a new session, optimistically active before the server
    /// confirms it.
    pub async fn new_chat(&self) -> Result<SessionId, ChatError> {
        let result = self.new_chat_inner().await;
        self.surface(result)
    }

    async fn new_chat_inner(&self) -> Result<SessionId, ChatError> {
        let defaults = self.settings.generation_defaults();
        let session = Session::new(&defaults);
        let pending = session.id.clone();
        let previous = self.store.insert_active(session.clone())?;
        info!(session_id = %pending, "Created local session");
        self.publish_sessions();

        match self.remote.create_session(&session).await {
            Ok(server_id) => {
                if let Err(e) = self.store.assign_server_id(&pending, server_id.clone()) {
                    warn!(
                        session_id = %pending,
                        server_id = %server_id,
                        error = %e,
                        "Session vanished before id assignment"
                    );
                    return Err(ChatError::SessionNotFound(pending.to_string()));
                }
                info!(pending_id = %pending, server_id = %server_id, "Session confirmed by server");
                let _ = self.events.send(ChatEvent::SessionIdAssigned {
                    pending_id: pending,
                    server_id: server_id.clone(),
                });
                self.publish_sessions();
                self.replay_local_edits(&session, &server_id);
                Ok(server_id)
            }
            Err(e) => {
                if self.store.rollback(&pending, previous, &defaults)? {
                    warn!(error = %e, "Session create failed; rolled back");
                    self.publish_sessions();
                    Err(e)
                } else {
                    warn!(session_id = %pending, error = %e, "Session create failed; kept local only");
                    Ok(pending)
                }
            }
        }
    }

    /// Push edits made while the session only existed locally.
    fn replay_local_edits(&self, created: &Session, server_id: &SessionId) {
        let Some(current) = self.store.session(server_id) else {
            return;
        };
        let patch = SessionPatch::from_session(&current);
        let patch_changed = patch != SessionPatch::from_session(created);
        let messages: Vec<Message> = current
            .messages
            .into_iter()
            .filter(|m| m.is_user() || !m.text.is_empty())
            .collect();
        if !patch_changed && messages.is_empty() {
            return;
        }
        debug!(
            session_id = %server_id,
            messages = messages.len(),
            "Replaying local edits to server"
        );
        let remote = Arc::clone(&self.remote);
        let id = server_id.clone();
        spawn_remote_write("replay session", async move {
            if patch_changed {
                remote.patch_session(&id, &patch).await?;
            }
            for message in &messages {
                remote.append_message(&id, message).await?;
            }
            Ok(())
        });
    }

    pub fn select_session(&self, id: &SessionId) -> Result<(), ChatError> {
        let result = self.store.select(id);
        if result.is_ok() {
            debug!(session_id = %id, "Session selected");
            self.publish_sessions();
        }
        self.surface(result)
    }

    pub fn rename_session(&self, id: &SessionId, title: &str) -> Result<Session, ChatError> {
        let result = self.rename_session_inner(id, title);
        self.surface(result)
    }

    fn rename_session_inner(&self, id: &SessionId, title: &str) -> Result<Session, ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::EmptyTitle);
        }
        let patch = SessionPatch::title(title);
        let updated = self.store.patch(id, &patch)?;
        mirror_session_patch(&self.remote, &updated.id, patch);
        self.publish_sessions();
        Ok(updated)
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<(), ChatError> {
        let result = self.store.delete(id).map(|removed| {
            info!(session_id = %removed.id, "Session deleted");
            mirror_delete(&self.remote, &removed.id);
            self.publish_sessions();
        });
        self.surface(result)
    }

    // =========================================================================
    // Streaming exchange
    // =========================================================================

    /// Send a user message to the active session and stream the reply.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, ChatError> {
        let result = self.send_inner(text).await;
        self.surface(result)
    }

    async fn send_inner(&self, text: &str) -> Result<SendOutcome, ChatError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let session = self
            .store
            .active_session()
            .ok_or_else(|| ChatError::SessionNotFound("active".to_string()))?;
        let collection_id = session.collection_id.ok_or(ChatError::NoCollection)?;

        let cancel = CancellationToken::new();
        {
            let mut slot = self.lock_exchange()?;
            if slot.is_some() {
                return Err(ChatError::ExchangeInProgress);
            }
            *slot = Some(ActiveExchange {
                state: ExchangeState::Sending,
                session_id: session.id.clone(),
                cancel: cancel.clone(),
                draft: None,
            });
        }
        let _guard = ExchangeGuard { controller: self };
        let _ = self.events.send(ChatEvent::ExchangeStateChanged {
            state: ExchangeState::Sending,
        });

        let first_message = !session.has_user_message();
        let user_message = Message::user(query);
        self.store.append_message(&session.id, user_message.clone())?;
        if first_message {
            let patch = SessionPatch::title(derive_title(query, self.config.title_max_chars));
            self.store.patch(&session.id, &patch)?;
            mirror_session_patch(&self.remote, &session.id, patch);
        }
        mirror_message(&self.remote, &session.id, user_message);
        self.publish_sessions();

        let mut draft = StreamingDraft::new(session.id.clone());
        self.publish_draft(&draft);

        let request = ChatStreamRequest {
            query: query.to_string(),
            collection_id,
            temperature: session.temperature,
            top_k: session.top_k,
            custom_prompt: Some(session.custom_prompt.clone()).filter(|p| !p.is_empty()),
            fetch_sources: self.config.fetch_sources_inline,
        };
        info!(
            session_id = %session.id,
            collection_id,
            query_len = query.chars().count(),
            "Opening chat stream"
        );

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SendOutcome::Stopped),
            opened = self.remote.open_chat_stream(&request) => opened?,
        };
        self.transition(ExchangeState::Streaming);

        let mut decoder = FrameDecoder::new();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(session_id = %session.id, "Exchange stopped; draft discarded");
                    return Ok(SendOutcome::Stopped);
                }
                read = tokio::time::timeout(self.idle_timeout, stream.next()) => read,
            };
            match read {
                Err(_) => return Err(ChatError::StreamTimeout(self.idle_timeout.as_secs())),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(chunk))) => {
                    let frames = decoder.feed(&chunk);
                    apply_frames(&mut draft, frames);
                    self.publish_draft(&draft);
                }
            }
            if decoder.saw_end() {
                break;
            }
        }
        drop(stream);
        apply_frames(&mut draft, decoder.flush());
        if decoder.dropped() > 0 {
            debug!(dropped = decoder.dropped(), "Malformed frames skipped");
        }

        self.transition(ExchangeState::Committing);
        self.commit(draft)
    }

    fn commit(&self, draft: StreamingDraft) -> Result<SendOutcome, ChatError> {
        let session_id = self.store.resolve(&draft.session_id);
        let message = draft.into_message();
        let message_id = message.id.clone();
        let has_text = !message.text.is_empty();

        match self.store.append_message(&session_id, message.clone()) {
            Ok(()) => {}
            Err(ChatError::SessionNotFound(_)) => {
                warn!(session_id = %session_id, "Session deleted mid-stream; reply dropped");
                return Ok(SendOutcome::Discarded);
            }
            Err(e) => return Err(e),
        }
        if has_text {
            mirror_message(&self.remote, &session_id, message);
        }
        info!(session_id = %session_id, message_id = %message_id, "Reply committed");
        let _ = self.events.send(ChatEvent::MessageCommitted {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });
        self.publish_sessions();
        Ok(SendOutcome::Committed {
            session_id,
            message_id,
        })
    }

    /// Stop the streaming exchange. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let Ok(slot) = self.exchange.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(exchange) if !exchange.cancel.is_cancelled() => {
                info!(session_id = %exchange.session_id, "Stopping exchange");
                exchange.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn lock_exchange(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<ActiveExchange>>, ChatError> {
        self.exchange
            .lock()
            .map_err(|e| ChatError::Storage(format!("exchange lock poisoned: {}", e)))
    }

    fn transition(&self, target: ExchangeState) {
        let Ok(mut slot) = self.exchange.lock() else {
            return;
        };
        let Some(exchange) = slot.as_mut() else {
            return;
        };
        if !exchange.state.can_transition_to(&target) {
            warn!(from = %exchange.state, to = %target, "Invalid exchange transition");
            return;
        }
        exchange.state = target;
        drop(slot);
        let _ = self
            .events
            .send(ChatEvent::ExchangeStateChanged { state: target });
    }

    fn publish_draft(&self, draft: &StreamingDraft) {
        if let Ok(mut slot) = self.exchange.lock() {
            if let Some(exchange) = slot.as_mut() {
                exchange.draft = Some(draft.clone());
            }
        }
        let _ = self.events.send(ChatEvent::DraftUpdated {
            draft: draft.clone(),
        });
    }

    fn finish_exchange(&self) {
        let finished = match self.exchange.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(exchange) = finished else {
            return;
        };
        exchange.cancel.cancel();
        if exchange.draft.is_some() {
            let _ = self.events.send(ChatEvent::DraftCleared {
                session_id: exchange.session_id,
            });
        }
        let _ = self.events.send(ChatEvent::ExchangeStateChanged {
            state: ExchangeState::Idle,
        });
    }

    // =========================================================================
    // Utilities
    // =========================================================================

    /// Read a message aloud. Invoking it again on the same message stops
    /// playback.
    pub async fn play_speech(&self, message_id: &str) -> Result<UtilityOutcome<()>, ChatError> {
        let result = self.play_speech_inner(message_id).await;
        self.surface(result)
    }

    async fn play_speech_inner(&self, message_id: &str) -> Result<UtilityOutcome<()>, ChatError> {
        let (session, message) = self.locate(message_id)?;
        let remote = Arc::clone(&self.remote);
        let player = Arc::clone(&self.player);
        let voice = session.vocal_voice;
        let text = message.text;
        self.utilities
            .run(UtilityToken::new(message_id, UtilityKind::Tts), |cancel| async move {
                let wav = remote.synthesize_speech(&text, &voice).await?;
                debug!(bytes = wav.len(), voice = %voice, "Playing synthesized speech");
                player.play(wav, cancel).await
            })
            .await
    }

    /// Translate a message and attach the translation to it.
    pub async fn translate_message(
        &self,
        message_id: &str,
    ) -> Result<UtilityOutcome<String>, ChatError> {
        let result = self.translate_message_inner(message_id).await;
        self.surface(result)
    }

    async fn translate_message_inner(
        &self,
        message_id: &str,
    ) -> Result<UtilityOutcome<String>, ChatError> {
        let (session, message) = self.locate(message_id)?;
        let remote = Arc::clone(&self.remote);
        let text = message.text;
        let outcome = self
            .utilities
            .run(
                UtilityToken::new(message_id, UtilityKind::Translate),
                |_cancel| async move { remote.translate(&text).await },
            )
            .await?;
        if let UtilityOutcome::Completed(translation) = &outcome {
            self.store.attach(
                &session.id,
                message_id,
                Attachment::Translation(translation.clone()),
            )?;
            self.publish_sessions();
        }
        Ok(outcome)
    }

    /// Retrieve the sources behind a message and attach them to it.
    pub async fn fetch_sources(
        &self,
        message_id: &str,
    ) -> Result<UtilityOutcome<usize>, ChatError> {
        let result = self.fetch_sources_inner(message_id).await;
        self.surface(result)
    }

    async fn fetch_sources_inner(
        &self,
        message_id: &str,
    ) -> Result<UtilityOutcome<usize>, ChatError> {
        let (session, message) = self.locate(message_id)?;
        let collection_id = session.collection_id.ok_or(ChatError::NoCollection)?;
        let query = if message.is_user() {
            message.text.clone()
        } else {
            session
                .question_for(message_id)
                .map(|m| m.text.clone())
                .unwrap_or_else(|| message.text.clone())
        };
        let request = SourcesRequest {
            query,
            collection_id,
            temperature: session.temperature,
            top_k: session.top_k,
            custom_prompt: Some(session.custom_prompt.clone()).filter(|p| !p.is_empty()),
        };
        let remote = Arc::clone(&self.remote);
        let outcome = self
            .utilities
            .run(
                UtilityToken::new(message_id, UtilityKind::Sources),
                |_cancel| async move { remote.fetch_sources(&request).await },
            )
            .await?;
        Ok(match outcome {
            UtilityOutcome::Completed(sources) => {
                let count = sources.len();
                self.store
                    .attach(&session.id, message_id, Attachment::Sources(sources))?;
                self.publish_sessions();
                UtilityOutcome::Completed(count)
            }
            UtilityOutcome::Stopped => UtilityOutcome::Stopped,
            UtilityOutcome::ToggledOff => UtilityOutcome::ToggledOff,
        })
    }

    fn locate(&self, message_id: &str) -> Result<(Session, Message), ChatError> {
        self.store
            .find_message(message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Session, ChatError> {
        let result = self.settings.apply(patch);
        if result.is_ok() {
            self.publish_sessions();
        }
        self.surface(result)
    }

    pub fn select_collection(&self, collection_id: i64) -> Result<Session, ChatError> {
        let result = self.settings.select_collection(collection_id);
        if result.is_ok() {
            self.publish_sessions();
        }
        self.surface(result)
    }

    pub async fn save_defaults(&self) -> Result<UserSettings, ChatError> {
        let result = self.settings.save_defaults().await;
        self.surface(result)
    }

    pub async fn reset_defaults(&self) -> Result<UserSettings, ChatError> {
        let result = self.settings.reset_defaults().await;
        self.surface(result)
    }

    pub async fn load_user_settings(&self) -> UserSettings {
        self.settings.load_user_settings().await
    }

    pub async fn load_collections(&self) -> Vec<Collection> {
        let collections = self.settings.load_collections().await;
        self.publish_sessions();
        collections
    }

    // =========================================================================
    // Notices
    // =========================================================================

    pub fn dismiss_notice(&self) -> bool {
        self.notices.dismiss()
    }

    fn surface<T>(&self, result: Result<T, ChatError>) -> Result<T, ChatError> {
        if let Err(e) = &result {
            warn!(error = %e, kind = ?e.kind(), "Chat operation failed");
            self.notices.raise(e.to_string());
        }
        result
    }

    fn publish_sessions(&self) {
        let _ = self.events.send(ChatEvent::SessionsChanged {
            active_session_id: self.store.active_id(),
        });
    }
}

impl std::fmt::Debug for ChatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatController")
            .field("store", &self.store)
            .field("exchange_state", &self.exchange_state())
            .finish()
    }
}

/// Fold decoded frames into the draft.
fn apply_frames(draft: &mut StreamingDraft, frames: Vec<Frame>) {
    for frame in frames {
        match frame {
            Frame::Chunk { content } => draft.append(&content),
            Frame::Sources { sources } => draft.replace_sources(sources),
            Frame::Error { message } => {
                warn!(session_id = %draft.session_id, message = %message, "Server reported an error in stream");
            }
        }
    }
}
