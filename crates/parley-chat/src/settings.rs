//! Session generation settings and standing user defaults.
//!
//! Edits to the active session apply locally first and are mirrored to the
//! per-session endpoint in the background. Standing defaults and the
//! collection list come from the remote store and fall back to the cache.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{info, warn};

use parley_core::config::DefaultsConfig;
use parley_core::events::ChatEvent;
use parley_core::types::{
    Collection, GenerationDefaults, Session, SessionId, UserSettings, TEMPERATURE_RANGE,
    TOP_K_RANGE,
};
use parley_storage::{CacheKey, KvStore};

use crate::error::ChatError;
use crate::remote::{mirror_session_patch, RemoteStore};
use crate::session_store::{SessionPatch, SessionStore};

/// Local edit to the active session's generation settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SettingsPatch {
    pub temperature: Option<f64>,
    pub top_k: Option<u32>,
    pub vocal_voice: Option<String>,
    pub custom_prompt: Option<String>,
}

impl SettingsPatch {
    pub fn validate(&self) -> Result<(), ChatError> {
        if let Some(temperature) = self.temperature {
            if !TEMPERATURE_RANGE.contains(&temperature) {
                return Err(ChatError::OutOfRange {
                    field: "temperature",
                    min: TEMPERATURE_RANGE.start().to_string(),
                    max: TEMPERATURE_RANGE.end().to_string(),
                });
            }
        }
        if let Some(top_k) = self.top_k {
            if !TOP_K_RANGE.contains(&top_k) {
                return Err(ChatError::OutOfRange {
                    field: "topK",
                    min: TOP_K_RANGE.start().to_string(),
                    max: TOP_K_RANGE.end().to_string(),
                });
            }
        }
        Ok(())
    }

    fn to_session_patch(&self) -> SessionPatch {
        SessionPatch {
            temperature: self.temperature,
            top_k: self.top_k,
            vocal_voice: self.vocal_voice.clone(),
            custom_prompt: self.custom_prompt.clone(),
            ..SessionPatch::default()
        }
    }
}

pub struct SettingsSynchronizer {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteStore>,
    kv: KvStore,
    fallback: DefaultsConfig,
    user_settings: Mutex<UserSettings>,
    collections: Mutex<Vec<Collection>>,
    events: broadcast::Sender<ChatEvent>,
}

impl SettingsSynchronizer {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteStore>,
        kv: KvStore,
        fallback: DefaultsConfig,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        let configured = UserSettings {
            default_temperature: fallback.temperature,
            default_top_k: fallback.top_k,
            preferred_collection_id: None,
        };
        Self {
            store,
            remote,
            kv,
            fallback,
            user_settings: Mutex::new(configured),
            collections: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Read cached defaults and collections.
    pub fn hydrate(&self) {
        let configured = self.user_settings();
        let cached = self.kv.load_or(CacheKey::UserSettings, configured);
        self.set_user_settings(self.within_bounds(cached));
        let collections: Vec<Collection> = self.kv.load_or_default(CacheKey::Collections);
        if let Ok(mut current) = self.collections.lock() {
            *current = collections;
        }
    }

    pub fn user_settings(&self) -> UserSettings {
        self.user_settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.collections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn selected_collection(&self) -> Option<i64> {
        self.kv.load_or(CacheKey::SelectedCollectionId, None)
    }

    /// Settings a freshly created session starts with.
    pub fn generation_defaults(&self) -> GenerationDefaults {
        let settings = self.user_settings();
        GenerationDefaults {
            temperature: settings.default_temperature,
            top_k: settings.default_top_k,
            vocal_voice: self.fallback.vocal_voice.clone(),
            custom_prompt: self.kv.load_or(CacheKey::CustomPrompt, String::new()),
            collection_id: self
                .selected_collection()
                .or(settings.preferred_collection_id),
        }
    }

    /// Apply a validated edit to the active session.
    pub fn apply(&self, patch: &SettingsPatch) -> Result<Session, ChatError> {
        patch.validate()?;
        let id = self.active_id()?;
        let session_patch = patch.to_session_patch();
        let updated = self.store.patch(&id, &session_patch)?;
        if let Some(prompt) = &patch.custom_prompt {
            if let Err(e) = self.kv.set(CacheKey::CustomPrompt, prompt) {
                warn!(error = %e, "Failed to cache custom prompt");
            }
        }
        mirror_session_patch(&self.remote, &updated.id, session_patch);
        Ok(updated)
    }

    /// Bind the active session to a collection. Locked once the session has
    /// a user message.
    pub fn select_collection(&self, collection_id: i64) -> Result<Session, ChatError> {
        let session = self
            .store
            .active_session()
            .ok_or_else(|| ChatError::SessionNotFound("active".to_string()))?;
        if session.has_user_message() {
            if session.collection_id == Some(collection_id) {
                return Ok(session);
            }
            return Err(ChatError::CollectionLocked);
        }
        let patch = SessionPatch::collection(collection_id);
        let updated = self.store.patch(&session.id, &patch)?;
        if let Err(e) = self
            .kv
            .set(CacheKey::SelectedCollectionId, &Some(collection_id))
        {
            warn!(error = %e, "Failed to cache selected collection");
        }
        info!(session_id = %updated.id, collection_id, "Collection selected");
        mirror_session_patch(&self.remote, &updated.id, patch);
        Ok(updated)
    }

    /// Persist the active session's temperature, topK, and collection as
    /// standing defaults.
    pub async fn save_defaults(&self) -> Result<UserSettings, ChatError> {
        let session = self
            .store
            .active_session()
            .ok_or_else(|| ChatError::SessionNotFound("active".to_string()))?;
        let desired = UserSettings {
            default_temperature: session.temperature,
            default_top_k: session.top_k,
            preferred_collection_id: session.collection_id,
        };
        let saved = self.remote.save_user_settings(&desired).await?;
        info!(
            temperature = saved.default_temperature,
            top_k = saved.default_top_k,
            "Saved user defaults"
        );
        Ok(self.cache_user_settings(saved))
    }

    pub async fn reset_defaults(&self) -> Result<UserSettings, ChatError> {
        let reset = self.remote.reset_user_settings().await?;
        info!("Reset user defaults");
        Ok(self.cache_user_settings(reset))
    }

    /// Fetch standing defaults; on failure keep the cached value.
    pub async fn load_user_settings(&self) -> UserSettings {
        match self.remote.get_user_settings().await {
            Ok(settings) => self.cache_user_settings(settings),
            Err(e) => {
                warn!(error = %e, "Failed to load user defaults; using cached");
                self.user_settings()
            }
        }
    }

    /// Fetch the collection list; on failure keep the cached list.
    ///
    /// An unbound, unstarted active session is bound to the preferred
    /// collection, or the first one available.
    pub async fn load_collections(&self) -> Vec<Collection> {
        let collections = match self.remote.list_collections().await {
            Ok(collections) => {
                if let Err(e) = self.kv.set(CacheKey::Collections, &collections) {
                    warn!(error = %e, "Failed to cache collections");
                }
                if let Ok(mut current) = self.collections.lock() {
                    *current = collections.clone();
                }
                let _ = self.events.send(ChatEvent::SettingsChanged);
                collections
            }
            Err(e) => {
                warn!(error = %e, "Failed to load collections; using cached");
                self.collections()
            }
        };
        self.bind_default_collection(&collections);
        collections
    }

    fn bind_default_collection(&self, collections: &[Collection]) {
        let Some(session) = self.store.active_session() else {
            return;
        };
        if session.collection_id.is_some() || session.has_user_message() {
            return;
        }
        let preferred = self
            .selected_collection()
            .or(self.user_settings().preferred_collection_id)
            .filter(|id| collections.iter().any(|c| c.id == *id));
        let Some(collection_id) = preferred.or(collections.first().map(|c| c.id)) else {
            return;
        };
        if let Err(e) = self.select_collection(collection_id) {
            warn!(error = %e, collection_id, "Failed to bind default collection");
        }
    }

    fn active_id(&self) -> Result<SessionId, ChatError> {
        self.store
            .active_id()
            .ok_or_else(|| ChatError::SessionNotFound("active".to_string()))
    }

    fn cache_user_settings(&self, settings: UserSettings) -> UserSettings {
        let settings = self.within_bounds(settings);
        if let Err(e) = self.kv.set(CacheKey::UserSettings, &settings) {
            warn!(error = %e, "Failed to cache user defaults");
        }
        self.set_user_settings(settings.clone());
        let _ = self.events.send(ChatEvent::SettingsChanged);
        settings
    }

    /// Replace out-of-range defaults with the configured ones.
    fn within_bounds(&self, mut settings: UserSettings) -> UserSettings {
        if !TEMPERATURE_RANGE.contains(&settings.default_temperature) {
            warn!(
                temperature = settings.default_temperature,
                fallback = self.fallback.temperature,
                "Default temperature out of range; using configured value"
            );
            settings.default_temperature = self.fallback.temperature;
        }
        if !TOP_K_RANGE.contains(&settings.default_top_k) {
            warn!(
                top_k = settings.default_top_k,
                fallback = self.fallback.top_k,
                "Default topK out of range; using configured value"
            );
            settings.default_top_k = self.fallback.top_k;
        }
        settings
    }

    fn set_user_settings(&self, settings: UserSettings) {
        if let Ok(mut current) = self.user_settings.lock() {
            *current = settings;
        }
    }
}
