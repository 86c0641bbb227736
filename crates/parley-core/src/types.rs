use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Valid range for the generation temperature.
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;

/// Valid range for the retrieval depth.
pub const TOP_K_RANGE: RangeInclusive<u32> = 20..=50;

/// Prefix marking a session id the server has not assigned yet.
const PENDING_PREFIX: &str = "local-";

/// Title given to sessions before the first user message names them.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a chat session.
///
/// Either a local pending sentinel (`local-<uuid>`) created optimistically,
/// or the stringified integer id assigned by the remote store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// A fresh local id awaiting server assignment.
    pub fn pending() -> Self {
        Self(format!("{}{}", PENDING_PREFIX, Uuid::new_v4()))
    }

    pub fn from_server(id: i64) -> Self {
        Self(id.to_string())
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_PREFIX)
    }

    /// The server integer id, if this id has been assigned by the server.
    pub fn server_id(&self) -> Option<i64> {
        if self.is_pending() {
            return None;
        }
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    #[serde(alias = "ai")]
    Assistant,
}

/// A retrieved passage backing an assistant answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "source")]
    pub source_name: String,
    #[serde(default)]
    pub content: String,
    /// Range: 0.0 (unrelated) to 1.0 (identical).
    #[serde(default)]
    pub similarity_score: f64,
}

/// One message in a session.
///
/// Assistant messages are append-only once committed; only `translation`
/// and `sources` may be attached afterward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: Sender::User,
            text: text.into(),
            created_at: Utc::now(),
            translation: None,
            sources: None,
        }
    }

    pub fn assistant(text: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: Sender::Assistant,
            text: text.into(),
            created_at: Utc::now(),
            translation: None,
            sources: if sources.is_empty() {
                None
            } else {
                Some(sources)
            },
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Per-session generation parameters, also used as defaults for new sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_k: u32,
    pub vocal_voice: String,
    pub custom_prompt: String,
    pub collection_id: Option<i64>,
}

/// One conversation thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    /// Write-once after the first user message.
    pub collection_id: Option<i64>,
    pub temperature: f64,
    pub top_k: u32,
    pub vocal_voice: String,
    #[serde(default)]
    pub custom_prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    /// A new, empty session with a pending id.
    pub fn new(defaults: &GenerationDefaults) -> Self {
        Self {
            id: SessionId::pending(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            collection_id: defaults.collection_id,
            temperature: defaults.temperature,
            top_k: defaults.top_k,
            vocal_voice: defaults.vocal_voice.clone(),
            custom_prompt: defaults.custom_prompt.clone(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(Message::is_user)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// The closest user message before `message_id`, i.e. the question an
    /// assistant message answers.
    pub fn question_for(&self, message_id: &str) -> Option<&Message> {
        let index = self.messages.iter().position(|m| m.id == message_id)?;
        self.messages[..index].iter().rev().find(|m| m.is_user())
    }
}

/// Transient assistant message while a response is still streaming.
///
/// Never persisted. `text` only ever grows within one exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamingDraft {
    pub id: String,
    pub session_id: SessionId,
    pub text: String,
    pub sources: Vec<SourceRef>,
}

impl StreamingDraft {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            text: String::new(),
            sources: Vec::new(),
        }
    }

    pub fn append(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Sources frames carry the full list, not a delta.
    pub fn replace_sources(&mut self, sources: Vec<SourceRef>) {
        self.sources = sources;
    }

    /// Materialize the committed assistant message, keeping the draft id.
    pub fn into_message(self) -> Message {
        let mut message = Message::assistant(self.text, self.sources);
        message.id = self.id;
        message
    }
}

/// Lifecycle of one send/stream exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Idle,
    /// User message appended, draft created.
    Sending,
    /// Channel open, frames decoding.
    Streaming,
    /// Channel closed, final message being assembled.
    Committing,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeState::Idle => write!(f, "Idle"),
            ExchangeState::Sending => write!(f, "Sending"),
            ExchangeState::Streaming => write!(f, "Streaming"),
            ExchangeState::Committing => write!(f, "Committing"),
        }
    }
}

impl ExchangeState {
    /// Returns whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &ExchangeState) -> bool {
        matches!(
            (self, target),
            (ExchangeState::Idle, ExchangeState::Sending)
                | (ExchangeState::Sending, ExchangeState::Streaming)
                | (ExchangeState::Streaming, ExchangeState::Committing)
                | (ExchangeState::Committing, ExchangeState::Idle)
                // Hard failure or stop
                | (ExchangeState::Sending, ExchangeState::Idle)
                | (ExchangeState::Streaming, ExchangeState::Idle)
        )
    }
}

// =============================================================================
// Utilities
// =============================================================================

/// Kind of per-message side effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilityKind {
    Tts,
    Translate,
    Sources,
}

impl UtilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtilityKind::Tts => "tts",
            UtilityKind::Translate => "translate",
            UtilityKind::Sources => "sources",
        }
    }
}

/// Occupant of the utility slot, rendered as `{message_id}-{kind}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtilityToken {
    pub message_id: String,
    pub kind: UtilityKind,
}

impl UtilityToken {
    pub fn new(message_id: impl Into<String>, kind: UtilityKind) -> Self {
        Self {
            message_id: message_id.into(),
            kind,
        }
    }
}

impl fmt::Display for UtilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.message_id, self.kind.as_str())
    }
}

// =============================================================================
// Settings and collections
// =============================================================================

/// Standing user defaults stored remotely and cached locally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub default_temperature: f64,
    pub default_top_k: u32,
    #[serde(default)]
    pub preferred_collection_id: Option<i64>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            default_temperature: 0.7,
            default_top_k: 20,
            preferred_collection_id: None,
        }
    }
}

/// A retrievable document grouping a session can be bound to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// An ephemeral user-visible error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Monotonic id; a newer notice supersedes an older one.
    pub id: u64,
    pub message: String,
}
