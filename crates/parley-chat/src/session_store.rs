//! In-memory session list mirrored to the local cache.
//!
//! Every mutation goes through a function in [`transitions`] and the result
//! is written back to the `sessions` and `active-session-id` cache keys
//! before the lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use parley_core::types::{GenerationDefaults, Message, Session, SessionId, SourceRef};
use parley_storage::{CacheKey, KvStore};

use crate::error::ChatError;

// =============================================================================
// Patches
// =============================================================================

/// Field-level update to a session. `None` leaves the field unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub collection_id: Option<i64>,
    pub temperature: Option<f64>,
    pub top_k: Option<u32>,
    pub vocal_voice: Option<String>,
    pub custom_prompt: Option<String>,
}

impl SessionPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn collection(collection_id: i64) -> Self {
        Self {
            collection_id: Some(collection_id),
            ..Self::default()
        }
    }

    /// Every mutable field of `session`, for replaying local edits once a
    /// pending session gets its server id.
    pub fn from_session(session: &Session) -> Self {
        Self {
            title: Some(session.title.clone()),
            collection_id: session.collection_id,
            temperature: Some(session.temperature),
            top_k: Some(session.top_k),
            vocal_voice: Some(session.vocal_voice.clone()),
            custom_prompt: Some(session.custom_prompt.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, session: &mut Session) {
        if let Some(title) = &self.title {
            session.title = title.clone();
        }
        if let Some(collection_id) = self.collection_id {
            session.collection_id = Some(collection_id);
        }
        if let Some(temperature) = self.temperature {
            session.temperature = temperature;
        }
        if let Some(top_k) = self.top_k {
            session.top_k = top_k;
        }
        if let Some(voice) = &self.vocal_voice {
            session.vocal_voice = voice.clone();
        }
        if let Some(prompt) = &self.custom_prompt {
            session.custom_prompt = prompt.clone();
        }
    }
}

/// Result of a utility operation attached to an existing message.
#[derive(Clone, Debug, PartialEq)]
pub enum Attachment {
    Translation(String),
    Sources(Vec<SourceRef>),
}

// =============================================================================
// Transitions
// =============================================================================

/// Side-effect-free mutations of a session list, keyed by session id.
pub mod transitions {
    use super::*;

    fn find_mut<'a>(sessions: &'a mut [Session], id: &SessionId) -> Result<&'a mut Session, ChatError> {
        sessions
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))
    }

    pub fn append_message(
        sessions: &mut [Session],
        id: &SessionId,
        message: Message,
    ) -> Result<(), ChatError> {
        find_mut(sessions, id)?.messages.push(message);
        Ok(())
    }

    pub fn patch_session(
        sessions: &mut [Session],
        id: &SessionId,
        patch: &SessionPatch,
    ) -> Result<Session, ChatError> {
        let session = find_mut(sessions, id)?;
        patch.apply_to(session);
        Ok(session.clone())
    }

    pub fn attach_to_message(
        sessions: &mut [Session],
        id: &SessionId,
        message_id: &str,
        attachment: Attachment,
    ) -> Result<(), ChatError> {
        let message = find_mut(sessions, id)?
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        match attachment {
            Attachment::Translation(text) => message.translation = Some(text),
            Attachment::Sources(sources) => message.sources = Some(sources),
        }
        Ok(())
    }

    /// Remove `id`, returning the removed session and its former index.
    pub fn remove_session(
        sessions: &mut Vec<Session>,
        id: &SessionId,
    ) -> Result<(usize, Session), ChatError> {
        let index = sessions
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))?;
        Ok((index, sessions.remove(index)))
    }

    pub fn replace_id(
        sessions: &mut [Session],
        from: &SessionId,
        to: SessionId,
    ) -> Result<(), ChatError> {
        find_mut(sessions, from)?.id = to;
        Ok(())
    }

    /// Insert `session` at the front, or overwrite the session with its id.
    pub fn upsert_session(sessions: &mut Vec<Session>, session: Session) {
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.insert(0, session),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Default)]
struct StoreState {
    sessions: Vec<Session>,
    active: Option<SessionId>,
    /// Pending id -> server id, for work that captured the id before
    /// reconciliation.
    aliases: HashMap<SessionId, SessionId>,
}

impl StoreState {
    fn resolve(&self, id: &SessionId) -> SessionId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.sessions.iter().any(|s| &s.id == id)
    }

    /// Keep the list non-empty and the active id pointing into it.
    fn settle(&mut self, defaults: &GenerationDefaults) {
        if self.sessions.is_empty() {
            let session = Session::new(defaults);
            debug!(session_id = %session.id, "Synthesized default session");
            self.sessions.push(session);
        }
        let active_valid = self.active.as_ref().is_some_and(|id| self.contains(id));
        if !active_valid {
            self.active = self.sessions.first().map(|s| s.id.clone());
        }
    }
}

/// Session list, active session, and pending-id aliases.
pub struct SessionStore {
    state: Mutex<StoreState>,
    kv: KvStore,
}

impl SessionStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            kv,
        }
    }

    /// Load sessions and the active id from the cache. An empty cache
    /// yields one default session.
    pub fn hydrate(&self, defaults: &GenerationDefaults) -> Result<(), ChatError> {
        let sessions: Vec<Session> = self.kv.load_or_default(CacheKey::Sessions);
        let active: Option<SessionId> = self.kv.load_or_default(CacheKey::ActiveSessionId);
        let mut state = self.lock()?;
        state.sessions = sessions;
        state.active = active;
        state.settle(defaults);
        info!(
            sessions = state.sessions.len(),
            active = ?state.active,
            "Hydrated sessions from cache"
        );
        self.mirror(&state);
        Ok(())
    }

    /// Adopt the remote session list as authoritative.
    ///
    /// The previously active id survives if the remote list still has it.
    /// Pending sessions holding messages never reached the server and are
    /// kept in front of the remote list.
    pub fn replace_all(
        &self,
        remote: Vec<Session>,
        defaults: &GenerationDefaults,
    ) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        let unsynced: Vec<Session> = state
            .sessions
            .iter()
            .filter(|s| s.id.is_pending() && !s.messages.is_empty())
            .cloned()
            .collect();
        let kept = unsynced.len();
        state.sessions = unsynced;
        state.sessions.extend(remote);
        state.settle(defaults);
        info!(
            sessions = state.sessions.len(),
            unsynced = kept,
            active = ?state.active,
            "Reconciled sessions with remote"
        );
        self.mirror(&state);
        Ok(())
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state
            .lock()
            .map(|s| s.sessions.clone())
            .unwrap_or_default()
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        let state = self.state.lock().ok()?;
        let id = state.resolve(id);
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.state.lock().ok().and_then(|s| s.active.clone())
    }

    pub fn active_session(&self) -> Option<Session> {
        let state = self.state.lock().ok()?;
        let active = state.active.as_ref()?;
        state.sessions.iter().find(|s| &s.id == active).cloned()
    }

    /// The current id of a session, following a pending-id alias.
    pub fn resolve(&self, id: &SessionId) -> SessionId {
        match self.state.lock() {
            Ok(state) => state.resolve(id),
            Err(_) => id.clone(),
        }
    }

    /// Session and message for a message id, searching every session.
    pub fn find_message(&self, message_id: &str) -> Option<(Session, Message)> {
        let state = self.state.lock().ok()?;
        state.sessions.iter().find_map(|s| {
            s.message(message_id)
                .map(|m| (s.clone(), m.clone()))
        })
    }

    /// Insert a new session and make it active. Returns the previously
    /// active id.
    pub fn insert_active(&self, session: Session) -> Result<Option<SessionId>, ChatError> {
        let mut state = self.lock()?;
        let previous = state.active.replace(session.id.clone());
        transitions::upsert_session(&mut state.sessions, session);
        self.mirror(&state);
        Ok(previous)
    }

    pub fn select(&self, id: &SessionId) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        let id = state.resolve(id);
        if !state.contains(&id) {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        state.active = Some(id);
        self.mirror(&state);
        Ok(())
    }

    pub fn append_message(&self, id: &SessionId, message: Message) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        let id = state.resolve(id);
        transitions::append_message(&mut state.sessions, &id, message)?;
        self.mirror(&state);
        Ok(())
    }

    pub fn patch(&self, id: &SessionId, patch: &SessionPatch) -> Result<Session, ChatError> {
        let mut state = self.lock()?;
        let id = state.resolve(id);
        let updated = transitions::patch_session(&mut state.sessions, &id, patch)?;
        self.mirror(&state);
        Ok(updated)
    }

    pub fn attach(
        &self,
        id: &SessionId,
        message_id: &str,
        attachment: Attachment,
    ) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        let id = state.resolve(id);
        transitions::attach_to_message(&mut state.sessions, &id, message_id, attachment)?;
        self.mirror(&state);
        Ok(())
    }

    /// Delete a session. The last remaining session cannot be deleted;
    /// deleting the active session promotes the first remaining one.
    pub fn delete(&self, id: &SessionId) -> Result<Session, ChatError> {
        let mut state = self.lock()?;
        let id = state.resolve(id);
        if !state.contains(&id) {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        if state.sessions.len() <= 1 {
            return Err(ChatError::LastSession);
        }
        let (_, removed) = transitions::remove_session(&mut state.sessions, &id)?;
        if state.active.as_ref() == Some(&id) {
            state.active = state.sessions.first().map(|s| s.id.clone());
        }
        state.aliases.retain(|_, target| target != &id);
        self.mirror(&state);
        Ok(removed)
    }

    /// Swap a pending id for the server id and remember the alias.
    pub fn assign_server_id(&self, pending: &SessionId, server: SessionId) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        transitions::replace_id(&mut state.sessions, pending, server.clone())?;
        if state.active.as_ref() == Some(pending) {
            state.active = Some(server.clone());
        }
        state.aliases.insert(pending.clone(), server);
        self.mirror(&state);
        Ok(())
    }

    /// Undo an optimistic create if the session is still empty. Returns
    /// whether the session was removed.
    pub fn rollback(
        &self,
        pending: &SessionId,
        previous_active: Option<SessionId>,
        defaults: &GenerationDefaults,
    ) -> Result<bool, ChatError> {
        let mut state = self.lock()?;
        let untouched = state
            .sessions
            .iter()
            .find(|s| &s.id == pending)
            .is_some_and(|s| s.messages.is_empty());
        if !untouched {
            return Ok(false);
        }
        transitions::remove_session(&mut state.sessions, pending)?;
        if state.active.as_ref() == Some(pending) {
            state.active = previous_active;
        }
        state.settle(defaults);
        self.mirror(&state);
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, ChatError> {
        self.state
            .lock()
            .map_err(|e| ChatError::Storage(format!("session lock poisoned: {}", e)))
    }

    /// Write the list and active id to the cache. Cache failures are logged;
    /// the in-memory state stays current.
    fn mirror(&self, state: &StoreState) {
        if let Err(e) = self.kv.set(CacheKey::Sessions, &state.sessions) {
            warn!(error = %e, "Failed to cache sessions");
        }
        if let Err(e) = self.kv.set(CacheKey::ActiveSessionId, &state.active) {
            warn!(error = %e, "Failed to cache active session id");
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("namespace", &self.kv.namespace())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
