//! HTTP implementation of [`RemoteStore`] over reqwest.
//!
//! Wire types mirror the backend's JSON exactly and are converted to the
//! domain types at this boundary.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use parley_core::config::RemoteConfig;
use parley_core::types::{
    Collection, Message, Sender, Session, SessionId, SourceRef, UserSettings,
};

use crate::error::ChatError;
use crate::remote::{ChatStreamRequest, ChunkStream, RemoteStore, SourcesRequest};
use crate::session_store::SessionPatch;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SessionList {
    sessions: Vec<WireSession>,
}

#[derive(Debug, Deserialize)]
struct WireSession {
    id: i64,
    title: String,
    #[serde(rename = "collectionId", alias = "collection_id", default)]
    collection_id: Option<i64>,
    temperature: f64,
    #[serde(rename = "topK", alias = "top_k")]
    top_k: u32,
    #[serde(rename = "vocalVoice", alias = "vocal_voice")]
    vocal_voice: String,
    #[serde(rename = "customRAGPrompt", alias = "custom_rag_prompt", default)]
    custom_prompt: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    messages: Vec<WireMessage>,
}

impl WireSession {
    fn into_session(self) -> Session {
        Session {
            id: SessionId::from_server(self.id),
            title: self.title,
            collection_id: self.collection_id,
            temperature: self.temperature,
            top_k: self.top_k,
            vocal_voice: self.vocal_voice,
            custom_prompt: self.custom_prompt.unwrap_or_default(),
            created_at: parse_timestamp(self.created_at.as_deref()),
            messages: self.messages.into_iter().map(WireMessage::into_message).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(alias = "text")]
    content: String,
    sender: String,
    #[serde(default)]
    translation: Option<String>,
    #[serde(default)]
    sources: Option<Vec<SourceRef>>,
    #[serde(default)]
    created_at: Option<String>,
}

impl WireMessage {
    fn into_message(self) -> Message {
        Message {
            id: self.id.to_string(),
            sender: if self.sender == "user" {
                Sender::User
            } else {
                Sender::Assistant
            },
            text: self.content,
            created_at: parse_timestamp(self.created_at.as_deref()),
            translation: self.translation,
            sources: self.sources.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    content: &'a str,
    sender: &'static str,
    translation: Option<&'a str>,
    sources: Option<&'a [SourceRef]>,
}

impl<'a> NewMessage<'a> {
    fn from_message(message: &'a Message) -> Self {
        Self {
            content: &message.text,
            sender: match message.sender {
                Sender::User => "user",
                Sender::Assistant => "ai",
            },
            translation: message.translation.as_deref(),
            sources: message.sources.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct NewSession<'a> {
    title: &'a str,
    collection_id: Option<i64>,
    temperature: f64,
    top_k: u32,
    vocal_voice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_rag_prompt: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SessionUpdate<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vocal_voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_rag_prompt: Option<&'a str>,
}

impl<'a> SessionUpdate<'a> {
    fn from_patch(patch: &'a SessionPatch) -> Self {
        Self {
            title: patch.title.as_deref(),
            collection_id: patch.collection_id,
            temperature: patch.temperature,
            top_k: patch.top_k,
            vocal_voice: patch.vocal_voice.as_deref(),
            custom_rag_prompt: patch.custom_prompt.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingsEnvelope {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<UserSettings>,
}

#[derive(Debug, Deserialize)]
struct SourcesReply {
    #[serde(default)]
    sources: Vec<SourceRef>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TranslateBody<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateReply {
    translated_text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Parse the backend's timestamps, which may lack a UTC offset.
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => naive.and_utc(),
        Err(e) => {
            debug!(raw, error = %e, "Unparseable timestamp; using now");
            Utc::now()
        }
    }
}

// =============================================================================
// UTF-8 carry-over
// =============================================================================

/// Decodes a byte stream into text without splitting multi-byte characters
/// across reads.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Append `bytes` and return the longest decodable prefix. An incomplete
    /// trailing sequence is kept for the next call; invalid bytes are
    /// replaced.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    /// Bytes still waiting for the rest of a character.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// =============================================================================
// Client
// =============================================================================

/// [`RemoteStore`] backed by the chat backend's REST API.
///
/// Plain requests are bounded by `request_timeout` from send to the end of
/// the body. The chat stream is only bounded by `request_timeout` until its
/// headers arrive; after that the controller's idle watchdog applies.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self, ChatError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
            .timeout(self.request_timeout)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
            .timeout(self.request_timeout)
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.put(self.url(path)))
            .timeout(self.request_timeout)
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.delete(self.url(path)))
            .timeout(self.request_timeout)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ChatError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                detail: serde_json::Value::String(detail),
            }) => detail,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if body.is_empty() => status.to_string(),
            Err(_) => body,
        };
        Err(ChatError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ChatError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    async fn list_messages(&self, id: i64) -> Result<Vec<Message>, ChatError> {
        let list: MessageList = self
            .json(self.get(&format!("/chat/sessions/{}/messages", id)))
            .await?;
        Ok(list
            .messages
            .into_iter()
            .map(WireMessage::into_message)
            .collect())
    }

    fn settings_from(envelope: SettingsEnvelope) -> Result<UserSettings, ChatError> {
        match envelope.data {
            Some(settings) if envelope.success => Ok(settings),
            _ => Err(ChatError::Remote {
                status: 200,
                message: envelope.message,
            }),
        }
    }
}

fn server_id(id: &SessionId) -> Result<i64, ChatError> {
    id.server_id()
        .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_sessions(&self) -> Result<Vec<Session>, ChatError> {
        let list: SessionList = self.json(self.get("/chat/sessions")).await?;
        let mut sessions: Vec<Session> = list
            .sessions
            .into_iter()
            .map(WireSession::into_session)
            .collect();

        let ids: Vec<i64> = sessions.iter().filter_map(|s| s.id.server_id()).collect();
        let histories = join_all(ids.iter().map(|id| self.list_messages(*id))).await;
        // Any missing history fails the whole list.
        for (session, history) in sessions.iter_mut().zip(histories) {
            match history {
                Ok(messages) => session.messages = messages,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to load messages");
                    return Err(e);
                }
            }
        }
        info!(sessions = sessions.len(), "Fetched sessions from remote");
        Ok(sessions)
    }

    async fn create_session(&self, session: &Session) -> Result<SessionId, ChatError> {
        let body = NewSession {
            title: &session.title,
            collection_id: session.collection_id,
            temperature: session.temperature,
            top_k: session.top_k,
            vocal_voice: &session.vocal_voice,
            custom_rag_prompt: Some(session.custom_prompt.as_str()).filter(|p| !p.is_empty()),
        };
        let created: CreatedSession = self.json(self.post("/chat/sessions").json(&body)).await?;
        Ok(SessionId::from_server(created.id))
    }

    async fn patch_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), ChatError> {
        let path = format!("/chat/sessions/{}", server_id(id)?);
        self.send(self.put(&path).json(&SessionUpdate::from_patch(patch)))
            .await?;
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), ChatError> {
        let path = format!("/chat/sessions/{}", server_id(id)?);
        self.send(self.delete(&path)).await?;
        Ok(())
    }

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<(), ChatError> {
        let path = format!("/chat/sessions/{}/messages", server_id(id)?);
        self.send(self.post(&path).json(&NewMessage::from_message(message)))
            .await?;
        Ok(())
    }

    async fn get_user_settings(&self) -> Result<UserSettings, ChatError> {
        let envelope: SettingsEnvelope = self.json(self.get("/auth/settings")).await?;
        Self::settings_from(envelope)
    }

    async fn save_user_settings(
        &self,
        settings: &UserSettings,
    ) -> Result<UserSettings, ChatError> {
        let envelope: SettingsEnvelope =
            self.json(self.put("/auth/settings").json(settings)).await?;
        Self::settings_from(envelope)
    }

    async fn reset_user_settings(&self) -> Result<UserSettings, ChatError> {
        let envelope: SettingsEnvelope = self.json(self.post("/auth/settings/reset")).await?;
        Self::settings_from(envelope)
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, ChatError> {
        self.json(self.get("/collections/")).await
    }

    async fn open_chat_stream(
        &self,
        request: &ChatStreamRequest,
    ) -> Result<ChunkStream, ChatError> {
        // Bounded until headers arrive; the body is watched for idleness instead.
        let open = self.authorize(self.client.post(self.url("/rag/chat")).json(request));
        let response = tokio::time::timeout(self.request_timeout, self.send(open))
            .await
            .map_err(|_| ChatError::Network("chat stream did not open in time".to_string()))??;
        debug!(collection_id = request.collection_id, "Chat stream opened");
        let mut carry = Utf8Carry::default();
        let chunks = response.bytes_stream().map(move |item| match item {
            Ok(bytes) => Ok(carry.push(&bytes)),
            Err(e) => Err(ChatError::from(e)),
        });
        Ok(Box::pin(chunks))
    }

    async fn fetch_sources(&self, request: &SourcesRequest) -> Result<Vec<SourceRef>, ChatError> {
        let reply: SourcesReply = self.json(self.post("/rag/sources").json(request)).await?;
        match reply.error {
            Some(message) => Err(ChatError::Remote {
                status: 200,
                message,
            }),
            None => Ok(reply.sources),
        }
    }

    async fn translate(&self, text: &str) -> Result<String, ChatError> {
        let reply: TranslateReply = self
            .json(self.post("/rag/translate").json(&TranslateBody { text }))
            .await?;
        Ok(reply.translated_text)
    }

    async fn synthesize_speech(&self, text: &str, voice: &str) -> Result<Vec<u8>, ChatError> {
        let response = self
            .send(self.get("/rag/tts").query(&[("text", text), ("voice", voice)]))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }
}
