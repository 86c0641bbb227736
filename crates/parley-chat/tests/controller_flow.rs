//! End-to-end controller behaviour against a scripted in-memory remote.
//!
//! Each test builds its own controller over an in-memory cache and a fake
//! remote whose responses and stream bodies are scripted per test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use parley_chat::{
    AudioPlayer, ChatController, ChatError, ChatStreamRequest, ChunkStream, NullPlayer,
    RemoteStore, SendOutcome, SessionPatch, SettingsPatch, SourcesRequest, UtilityOutcome,
};
use parley_core::config::ParleyConfig;
use parley_core::events::ChatEvent;
use parley_core::types::{
    Collection, ExchangeState, Message, Sender, Session, SessionId, SourceRef, UserSettings,
    UtilityKind,
};
use parley_storage::{CacheKey, KvStore};

// =============================================================================
// Fakes
// =============================================================================

enum Tail {
    End,
    Hang,
    /// Ends once the gate is notified.
    Gate(Arc<Notify>),
    Fail(&'static str),
}

struct Script {
    chunks: Vec<String>,
    tail: Tail,
}

#[derive(Default)]
struct FakeRemote {
    /// `None` makes `list_sessions` fail.
    remote_sessions: Mutex<Option<Vec<Session>>>,
    scripts: Mutex<VecDeque<Script>>,
    next_id: AtomicI64,
    fail_create: AtomicBool,
    /// Holds `create_session` until notified.
    create_gate: Mutex<Option<Arc<Notify>>>,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<String>>,
    stream_requests: Mutex<Vec<ChatStreamRequest>>,
    sources_requests: Mutex<Vec<SourcesRequest>>,
    settings: Mutex<UserSettings>,
    collections: Mutex<Vec<Collection>>,
}

impl FakeRemote {
    fn script(&self, chunks: Vec<String>, tail: Tail) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script { chunks, tail });
    }

    fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn record(&self, write: String) -> Result<(), ChatError> {
        self.writes.lock().unwrap().push(write);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list_sessions(&self) -> Result<Vec<Session>, ChatError> {
        self.remote_sessions
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChatError::Network("offline".to_string()))
    }

    async fn create_session(&self, _session: &Session) -> Result<SessionId, ChatError> {
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ChatError::Network("offline".to_string()));
        }
        let id = 100 + self.next_id.fetch_add(1, Ordering::SeqCst);
        self.writes.lock().unwrap().push(format!("create {}", id));
        Ok(SessionId::from_server(id))
    }

    async fn patch_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), ChatError> {
        self.record(format!(
            "patch {} {}",
            id,
            patch.title.clone().unwrap_or_default()
        ))
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), ChatError> {
        self.record(format!("delete {}", id))
    }

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<(), ChatError> {
        self.record(format!("append {} {:?} {}", id, message.sender, message.text))
    }

    async fn get_user_settings(&self) -> Result<UserSettings, ChatError> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn save_user_settings(
        &self,
        settings: &UserSettings,
    ) -> Result<UserSettings, ChatError> {
        *self.settings.lock().unwrap() = settings.clone();
        Ok(settings.clone())
    }

    async fn reset_user_settings(&self) -> Result<UserSettings, ChatError> {
        *self.settings.lock().unwrap() = UserSettings::default();
        Ok(UserSettings::default())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, ChatError> {
        Ok(self.collections.lock().unwrap().clone())
    }

    async fn open_chat_stream(
        &self,
        request: &ChatStreamRequest,
    ) -> Result<ChunkStream, ChatError> {
        self.stream_requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChatError::Network("no stream scripted".to_string()))?;
        let head = stream::iter(script.chunks.into_iter().map(Ok::<String, ChatError>));
        let body: ChunkStream = match script.tail {
            Tail::End => Box::pin(head),
            Tail::Hang => Box::pin(head.chain(stream::pending())),
            Tail::Gate(gate) => Box::pin(head.chain(
                stream::once(async move { gate.notified().await })
                    .filter_map(|_| async { None::<Result<String, ChatError>> }),
            )),
            Tail::Fail(message) => Box::pin(head.chain(stream::once(async move {
                Err::<String, ChatError>(ChatError::Network(message.to_string()))
            }))),
        };
        Ok(body)
    }

    async fn fetch_sources(&self, request: &SourcesRequest) -> Result<Vec<SourceRef>, ChatError> {
        self.sources_requests.lock().unwrap().push(request.clone());
        Ok(vec![source("manual.pdf", 0.82)])
    }

    async fn translate(&self, text: &str) -> Result<String, ChatError> {
        Ok(format!("[fr] {}", text))
    }

    async fn synthesize_speech(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, ChatError> {
        Ok(vec![0x52, 0x49, 0x46, 0x46])
    }
}

/// Plays until cancelled.
#[derive(Default)]
struct HangingPlayer {
    started: AtomicUsize,
}

#[async_trait]
impl AudioPlayer for HangingPlayer {
    async fn play(&self, _wav: Vec<u8>, cancel: CancellationToken) -> Result<(), ChatError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Ok(())
    }
}

struct FailingPlayer;

#[async_trait]
impl AudioPlayer for FailingPlayer {
    async fn play(&self, _wav: Vec<u8>, _cancel: CancellationToken) -> Result<(), ChatError> {
        Err(ChatError::Playback("no output device".to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn source(name: &str, score: f64) -> SourceRef {
    SourceRef {
        source_name: name.to_string(),
        content: "excerpt".to_string(),
        similarity_score: score,
    }
}

fn chunk_frame(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"type": "chunk", "content": text})
    )
}

fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}

fn server_session(id: i64, collection_id: Option<i64>) -> Session {
    Session {
        id: SessionId::from_server(id),
        title: format!("Session {}", id),
        collection_id,
        temperature: 0.7,
        top_k: 20,
        vocal_voice: "en_female".to_string(),
        custom_prompt: String::new(),
        created_at: chrono::Utc::now(),
        messages: Vec::new(),
    }
}

fn seeded_kv(sessions: &[Session], active: i64) -> KvStore {
    let kv = KvStore::in_memory("test").unwrap();
    kv.set(CacheKey::Sessions, sessions).unwrap();
    kv.set(CacheKey::ActiveSessionId, &Some(SessionId::from_server(active)))
        .unwrap();
    kv
}

fn build(remote: &Arc<FakeRemote>, kv: KvStore) -> Arc<ChatController> {
    build_with(remote, kv, ParleyConfig::default(), Arc::new(NullPlayer))
}

fn build_with(
    remote: &Arc<FakeRemote>,
    kv: KvStore,
    config: ParleyConfig,
    player: Arc<dyn AudioPlayer>,
) -> Arc<ChatController> {
    let remote: Arc<dyn RemoteStore> = remote.clone();
    Arc::new(ChatController::new(&config, kv, remote, player))
}

/// Controller over one server session (id 42, collection 1).
fn ready() -> (Arc<FakeRemote>, Arc<ChatController>) {
    let remote = Arc::new(FakeRemote::default());
    let kv = seeded_kv(&[server_session(42, Some(1))], 42);
    let controller = build(&remote, kv);
    (remote, controller)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

fn messages(controller: &ChatController) -> Vec<Message> {
    controller.active_session().unwrap().messages
}

// =============================================================================
// Sending and streaming
// =============================================================================

#[tokio::test]
async fn test_send_streams_and_commits_reply() {
    let (remote, controller) = ready();
    let sources_frame = format!(
        "data: {}\n\n",
        serde_json::json!({
            "type": "sources",
            "sources": [{"source": "guide.pdf", "content": "x", "similarity_score": 0.9}]
        })
    );
    // Frames deliberately split across chunk boundaries.
    let whole = format!("{}{}{}{}", sources_frame, chunk_frame("Hel"), chunk_frame("lo"), done_frame());
    let (a, rest) = whole.split_at(17);
    let (b, c) = rest.split_at(rest.len() / 2);
    remote.script(vec![a.to_string(), b.to_string(), c.to_string()], Tail::End);

    let outcome = controller.send("  What is Rust?  ").await.unwrap();
    let SendOutcome::Committed { session_id, .. } = outcome.clone() else {
        panic!("expected commit, got {:?}", outcome);
    };
    assert_eq!(session_id, SessionId::from_server(42));

    let messages = messages(&controller);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[0].text, "What is Rust?");
    assert_eq!(messages[1].sender, Sender::Assistant);
    assert_eq!(messages[1].text, "Hello");
    assert_eq!(messages[1].sources.as_ref().unwrap()[0].source_name, "guide.pdf");
    assert_eq!(controller.active_session().unwrap().title, "What is Rust?");
    assert_eq!(controller.exchange_state(), ExchangeState::Idle);
    assert!(controller.draft().is_none());

    let request = remote.stream_requests.lock().unwrap()[0].clone();
    assert_eq!(request.query, "What is Rust?");
    assert_eq!(request.collection_id, 1);
    assert_eq!(request.top_k, 20);
    assert!(!request.fetch_sources);

    wait_until(|| remote.writes().len() >= 3).await;
    let writes = remote.writes();
    assert!(writes.contains(&"append 42 User What is Rust?".to_string()));
    assert!(writes.contains(&"patch 42 What is Rust?".to_string()));
    assert!(writes.contains(&"append 42 Assistant Hello".to_string()));
}

#[tokio::test]
async fn test_first_message_of_forty_chars_titles_session() {
    let (remote, controller) = ready();
    remote.script(vec![chunk_frame("ok"), done_frame()], Tail::End);
    let text = "abcdefghijklmnopqrstuvwxyz0123456789ABCD";

    controller.send(text).await.unwrap();
    assert_eq!(
        controller.active_session().unwrap().title,
        "abcdefghijklmnopqrstuvwxyz0123..."
    );
}

#[tokio::test]
async fn test_second_message_keeps_title() {
    let (remote, controller) = ready();
    remote.script(vec![chunk_frame("one"), done_frame()], Tail::End);
    remote.script(vec![chunk_frame("two"), done_frame()], Tail::End);

    controller.send("First question").await.unwrap();
    controller.send("Second question").await.unwrap();
    assert_eq!(controller.active_session().unwrap().title, "First question");
    assert_eq!(messages(&controller).len(), 4);
}

#[tokio::test]
async fn test_empty_message_rejected_without_network() {
    let (remote, controller) = ready();
    let result = controller.send("   ").await;
    assert!(matches!(result, Err(ChatError::EmptyMessage)));
    assert!(remote.stream_requests.lock().unwrap().is_empty());
    assert!(messages(&controller).is_empty());
    assert_eq!(controller.notice().unwrap().message, "message cannot be empty");
}

#[tokio::test]
async fn test_send_without_collection_rejected() {
    let remote = Arc::new(FakeRemote::default());
    let controller = build(&remote, seeded_kv(&[server_session(42, None)], 42));
    let result = controller.send("hello").await;
    assert!(matches!(result, Err(ChatError::NoCollection)));
    assert!(messages(&controller).is_empty());
    assert!(controller.notice().is_some());
}

#[tokio::test]
async fn test_malformed_frame_does_not_interrupt_stream() {
    let (remote, controller) = ready();
    remote.script(
        vec![
            chunk_frame("Hel"),
            "data: {\"type\":\"chunk\",\"content\":\n\n".to_string(),
            chunk_frame("lo"),
        ],
        Tail::End,
    );
    controller.send("hi").await.unwrap();
    assert_eq!(messages(&controller)[1].text, "Hello");
}

#[tokio::test]
async fn test_error_frame_logged_and_stream_continues() {
    let (remote, controller) = ready();
    remote.script(
        vec![
            chunk_frame("part one, "),
            "data: {\"type\":\"error\",\"message\":\"reranker slow\"}\n\n".to_string(),
            chunk_frame("part two"),
        ],
        Tail::End,
    );
    controller.send("hi").await.unwrap();
    assert_eq!(messages(&controller)[1].text, "part one, part two");
}

#[tokio::test]
async fn test_draft_text_never_shrinks() {
    let (remote, controller) = ready();
    let mut events = controller.subscribe();
    remote.script(
        vec![chunk_frame("a"), chunk_frame("bc"), chunk_frame("def"), done_frame()],
        Tail::End,
    );
    controller.send("grow").await.unwrap();

    let mut lengths = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChatEvent::DraftUpdated { draft } = event {
            lengths.push(draft.text.len());
        }
    }
    assert!(lengths.len() >= 4);
    assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*lengths.last().unwrap(), 6);
}

#[tokio::test]
async fn test_stream_error_discards_draft() {
    let (remote, controller) = ready();
    remote.script(vec![chunk_frame("partial")], Tail::Fail("connection reset"));

    let result = controller.send("question").await;
    assert!(matches!(result, Err(ChatError::Network(_))));
    let messages = messages(&controller);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_user());
    assert_eq!(controller.exchange_state(), ExchangeState::Idle);
    assert!(controller.draft().is_none());
    assert!(controller.notice().unwrap().message.contains("connection reset"));
}

#[tokio::test]
async fn test_open_failure_returns_to_idle() {
    let (_remote, controller) = ready();
    // No script: opening the channel fails.
    let result = controller.send("question").await;
    assert!(matches!(result, Err(ChatError::Network(_))));
    assert!(!controller.is_loading());
    assert_eq!(messages(&controller).len(), 1);
}

#[tokio::test]
async fn test_empty_reply_committed_locally_only() {
    let (remote, controller) = ready();
    remote.script(vec![done_frame()], Tail::End);

    controller.send("say nothing").await.unwrap();
    let messages = messages(&controller);
    assert_eq!(messages.len(), 2);
    assert!(messages[1].text.is_empty());

    wait_until(|| remote.writes().iter().any(|w| w.starts_with("append 42 User"))).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!remote.writes().iter().any(|w| w.contains("Assistant")));
}

#[tokio::test]
async fn test_stop_mid_stream_commits_nothing() {
    let (remote, controller) = ready();
    let mut events = controller.subscribe();
    remote.script(vec![chunk_frame("partial answer")], Tail::Hang);

    let sender = Arc::clone(&controller);
    let handle = tokio::spawn(async move { sender.send("long question").await });

    loop {
        if let ChatEvent::DraftUpdated { draft } = events.recv().await.unwrap() {
            if !draft.text.is_empty() {
                break;
            }
        }
    }
    assert_eq!(controller.exchange_state(), ExchangeState::Streaming);
    assert!(controller.stop());

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, SendOutcome::Stopped);
    assert_eq!(messages(&controller).len(), 1);
    assert!(controller.draft().is_none());
    assert!(!controller.is_loading());
    assert!(!controller.stop());
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let (_remote, controller) = ready();
    assert!(!controller.stop());
    assert!(!controller.stop());
}

#[tokio::test]
async fn test_second_send_while_streaming_rejected() {
    let (remote, controller) = ready();
    remote.script(vec![chunk_frame("...")], Tail::Hang);

    let sender = Arc::clone(&controller);
    let handle = tokio::spawn(async move { sender.send("first").await });
    wait_until(|| controller.exchange_state() == ExchangeState::Streaming).await;

    let result = controller.send("second").await;
    assert!(matches!(result, Err(ChatError::ExchangeInProgress)));
    assert_eq!(messages(&controller).len(), 1);

    controller.stop();
    assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_times_out() {
    let remote = Arc::new(FakeRemote::default());
    let mut config = ParleyConfig::default();
    config.remote.stream_idle_timeout_secs = 2;
    let controller = build_with(
        &remote,
        seeded_kv(&[server_session(42, Some(1))], 42),
        config,
        Arc::new(NullPlayer),
    );
    remote.script(vec![chunk_frame("stalled")], Tail::Hang);

    let result = controller.send("question").await;
    assert!(matches!(result, Err(ChatError::StreamTimeout(2))));
    assert_eq!(messages(&controller).len(), 1);
}

#[tokio::test]
async fn test_reply_commits_into_originating_session() {
    let remote = Arc::new(FakeRemote::default());
    let controller = build(
        &remote,
        seeded_kv(&[server_session(42, Some(1)), server_session(7, Some(1))], 42),
    );
    let gate = Arc::new(Notify::new());
    remote.script(vec![chunk_frame("answer")], Tail::Gate(Arc::clone(&gate)));

    let sender = Arc::clone(&controller);
    let handle = tokio::spawn(async move { sender.send("question").await });
    wait_until(|| controller.draft().is_some_and(|d| !d.text.is_empty())).await;

    controller.select_session(&SessionId::from_server(7)).unwrap();
    gate.notify_one();
    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        SendOutcome::Committed { ref session_id, .. } if *session_id == SessionId::from_server(42)
    ));

    let origin = controller.session(&SessionId::from_server(42)).unwrap();
    assert_eq!(origin.messages.len(), 2);
    assert_eq!(origin.messages[1].text, "answer");
    let other = controller.session(&SessionId::from_server(7)).unwrap();
    assert!(other.messages.is_empty());
    assert_eq!(controller.active_session_id(), Some(SessionId::from_server(7)));
}

#[tokio::test]
async fn test_reply_discarded_when_session_deleted_mid_stream() {
    let remote = Arc::new(FakeRemote::default());
    let controller = build(
        &remote,
        seeded_kv(&[server_session(42, Some(1)), server_session(7, Some(1))], 42),
    );
    let gate = Arc::new(Notify::new());
    remote.script(vec![chunk_frame("orphan")], Tail::Gate(Arc::clone(&gate)));

    let sender = Arc::clone(&controller);
    let handle = tokio::spawn(async move { sender.send("question").await });
    wait_until(|| controller.draft().is_some_and(|d| !d.text.is_empty())).await;

    controller.delete_session(&SessionId::from_server(42)).unwrap();
    gate.notify_one();
    assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Discarded);
    assert_eq!(controller.sessions().len(), 1);
    assert!(controller.session(&SessionId::from_server(7)).unwrap().messages.is_empty());
}

// =============================================================================
// Loading and sessions
// =============================================================================

#[tokio::test]
async fn test_load_failure_keeps_cached_active_session() {
    let remote = Arc::new(FakeRemote::default());
    let mut cached = server_session(42, Some(1));
    cached.messages.push(Message::user("cached question"));
    cached.messages.push(Message::assistant("cached answer", vec![]));
    let controller = build(&remote, seeded_kv(&[server_session(7, Some(1)), cached], 42));

    let result = controller.load().await;
    assert!(matches!(result, Err(ChatError::Network(_))));
    let active = controller.active_session().unwrap();
    assert_eq!(active.id, SessionId::from_server(42));
    assert_eq!(active.messages.len(), 2);
    assert_eq!(controller.sessions().len(), 2);
}

#[tokio::test]
async fn test_load_success_replaces_and_keeps_active() {
    let remote = Arc::new(FakeRemote::default());
    let controller = build(
        &remote,
        seeded_kv(&[server_session(7, Some(1)), server_session(42, Some(1))], 42),
    );
    let mut fresh = server_session(42, Some(1));
    fresh.title = "From server".to_string();
    *remote.remote_sessions.lock().unwrap() = Some(vec![server_session(9, Some(1)), fresh]);

    controller.load().await.unwrap();
    let ids: Vec<SessionId> = controller.sessions().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![SessionId::from_server(9), SessionId::from_server(42)]);
    assert_eq!(controller.active_session().unwrap().title, "From server");
}

#[tokio::test]
async fn test_load_binds_first_collection_to_fresh_session() {
    let remote = Arc::new(FakeRemote::default());
    *remote.collections.lock().unwrap() = vec![
        Collection {
            id: 5,
            name: "Docs".to_string(),
            description: None,
        },
        Collection {
            id: 6,
            name: "Notes".to_string(),
            description: None,
        },
    ];
    let controller = build(&remote, KvStore::in_memory("test").unwrap());
    assert_eq!(controller.active_session().unwrap().collection_id, None);

    let _ = controller.load().await;
    assert_eq!(controller.active_session().unwrap().collection_id, Some(5));
    assert_eq!(controller.collections().len(), 2);
}

#[tokio::test]
async fn test_new_chat_reconciles_server_id() {
    let (remote, controller) = ready();
    let mut events = controller.subscribe();

    let id = controller.new_chat().await.unwrap();
    assert_eq!(id, SessionId::from_server(100));
    assert_eq!(controller.active_session_id(), Some(id.clone()));
    assert_eq!(controller.sessions().len(), 2);
    assert!(remote.writes().contains(&"create 100".to_string()));

    let mut assigned = false;
    while let Ok(event) = events.try_recv() {
        if let ChatEvent::SessionIdAssigned { pending_id, server_id } = event {
            assert!(pending_id.is_pending());
            assert_eq!(server_id, id);
            assigned = true;
        }
    }
    assert!(assigned);
}

#[tokio::test]
async fn test_new_chat_failure_rolls_back() {
    let (remote, controller) = ready();
    remote.fail_create.store(true, Ordering::SeqCst);

    let result = controller.new_chat().await;
    assert!(matches!(result, Err(ChatError::Network(_))));
    assert_eq!(controller.sessions().len(), 1);
    assert_eq!(controller.active_session_id(), Some(SessionId::from_server(42)));
    assert!(controller.notice().is_some());
}

#[tokio::test]
async fn test_new_chat_errors_when_load_drops_pending_session() {
    let (remote, controller) = ready();
    *remote.remote_sessions.lock().unwrap() = Some(vec![server_session(42, Some(1))]);
    let gate = Arc::new(Notify::new());
    *remote.create_gate.lock().unwrap() = Some(Arc::clone(&gate));

    let creator = Arc::clone(&controller);
    let handle = tokio::spawn(async move { creator.new_chat().await });
    wait_until(|| controller.sessions().len() == 2).await;

    controller.load().await.unwrap();
    assert_eq!(controller.sessions().len(), 1);
    gate.notify_one();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(ChatError::SessionNotFound(_))));
    assert_eq!(controller.active_session_id(), Some(SessionId::from_server(42)));
    assert!(controller.session(&SessionId::from_server(100)).is_none());
}

#[tokio::test]
async fn test_delete_rules() {
    let remote = Arc::new(FakeRemote::default());
    let controller = build(
        &remote,
        seeded_kv(
            &[
                server_session(1, Some(1)),
                server_session(2, Some(1)),
                server_session(3, Some(1)),
            ],
            2,
        ),
    );

    controller.delete_session(&SessionId::from_server(3)).unwrap();
    assert_eq!(controller.active_session_id(), Some(SessionId::from_server(2)));

    controller.delete_session(&SessionId::from_server(2)).unwrap();
    assert_eq!(controller.active_session_id(), Some(SessionId::from_server(1)));

    let result = controller.delete_session(&SessionId::from_server(1));
    assert!(matches!(result, Err(ChatError::LastSession)));
    assert_eq!(controller.sessions().len(), 1);

    wait_until(|| remote.writes().len() == 2).await;
    let mut writes = remote.writes();
    writes.sort();
    assert_eq!(writes, vec!["delete 2".to_string(), "delete 3".to_string()]);
}

#[tokio::test]
async fn test_failed_remote_write_keeps_local_state() {
    let (remote, controller) = ready();
    remote.fail_writes.store(true, Ordering::SeqCst);

    let renamed = controller
        .rename_session(&SessionId::from_server(42), "  Renamed  ")
        .unwrap();
    assert_eq!(renamed.title, "Renamed");

    wait_until(|| !remote.writes().is_empty()).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(controller.active_session().unwrap().title, "Renamed");
    assert!(controller.notice().is_none());
}

#[tokio::test]
async fn test_rename_rejects_blank_title() {
    let (_remote, controller) = ready();
    let result = controller.rename_session(&SessionId::from_server(42), "   ");
    assert!(matches!(result, Err(ChatError::EmptyTitle)));
    assert_eq!(controller.active_session().unwrap().title, "Session 42");
}

#[tokio::test]
async fn test_state_survives_restart() {
    let remote = Arc::new(FakeRemote::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    remote.script(vec![chunk_frame("persisted"), done_frame()], Tail::End);
    {
        let db = Arc::new(parley_storage::Database::new(&path).unwrap());
        let kv = KvStore::new(db, "parley");
        kv.set(CacheKey::Sessions, &[server_session(42, Some(1))]).unwrap();
        let controller = build(&remote, kv);
        controller.send("remember this").await.unwrap();
    }

    let db = Arc::new(parley_storage::Database::new(&path).unwrap());
    let controller = build(&remote, KvStore::new(db, "parley"));
    let messages = messages(&controller);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "persisted");
}

#[tokio::test]
async fn test_open_uses_configured_data_dir_and_namespace() {
    let remote = Arc::new(FakeRemote::default());
    *remote.remote_sessions.lock().unwrap() = Some(vec![server_session(42, Some(1))]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = ParleyConfig::default();
    config.general.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    config.general.namespace = "alice".to_string();

    let open = |config: &ParleyConfig| {
        let shared: Arc<dyn RemoteStore> = remote.clone();
        ChatController::open(config, shared, Arc::new(NullPlayer)).unwrap()
    };
    {
        let controller = open(&config);
        controller.load().await.unwrap();
    }
    assert!(dir.path().join("data").join("cache.db").exists());

    let reopened = open(&config);
    assert!(reopened.session(&SessionId::from_server(42)).is_some());

    config.general.namespace = "bob".to_string();
    let other = open(&config);
    assert!(other.session(&SessionId::from_server(42)).is_none());
}

// =============================================================================
// Settings
// =============================================================================

#[tokio::test]
async fn test_collection_locked_after_first_message() {
    let (remote, controller) = ready();
    controller.select_collection(2).unwrap();
    assert_eq!(controller.active_session().unwrap().collection_id, Some(2));

    remote.script(vec![chunk_frame("ok")], Tail::End);
    controller.send("question").await.unwrap();

    let result = controller.select_collection(3);
    assert!(matches!(result, Err(ChatError::CollectionLocked)));
    assert_eq!(controller.active_session().unwrap().collection_id, Some(2));
    assert_eq!(controller.selected_collection(), Some(2));
}

#[tokio::test]
async fn test_update_settings_validates_and_applies() {
    let (remote, controller) = ready();

    let result = controller.update_settings(&SettingsPatch {
        top_k: Some(60),
        ..SettingsPatch::default()
    });
    assert!(matches!(result, Err(ChatError::OutOfRange { .. })));
    assert_eq!(controller.active_session().unwrap().top_k, 20);

    let updated = controller
        .update_settings(&SettingsPatch {
            temperature: Some(1.3),
            top_k: Some(35),
            custom_prompt: Some("Answer briefly.".to_string()),
            ..SettingsPatch::default()
        })
        .unwrap();
    assert_eq!(updated.top_k, 35);
    assert_eq!(updated.custom_prompt, "Answer briefly.");

    remote.script(vec![chunk_frame("ok")], Tail::End);
    controller.send("question").await.unwrap();
    let request = remote.stream_requests.lock().unwrap()[0].clone();
    assert_eq!(request.top_k, 35);
    assert!((request.temperature - 1.3).abs() < f64::EPSILON);
    assert_eq!(request.custom_prompt.as_deref(), Some("Answer briefly."));
}

#[tokio::test]
async fn test_save_and_reset_defaults() {
    let (remote, controller) = ready();
    controller
        .update_settings(&SettingsPatch {
            temperature: Some(0.3),
            top_k: Some(40),
            ..SettingsPatch::default()
        })
        .unwrap();

    let saved = controller.save_defaults().await.unwrap();
    assert_eq!(saved.default_top_k, 40);
    assert_eq!(saved.preferred_collection_id, Some(1));
    assert_eq!(controller.user_settings(), saved);
    assert_eq!(remote.settings.lock().unwrap().default_top_k, 40);

    let new_id = controller.new_chat().await.unwrap();
    let fresh = controller.session(&new_id).unwrap();
    assert_eq!(fresh.top_k, 40);

    let reset = controller.reset_defaults().await.unwrap();
    assert_eq!(reset, UserSettings::default());
    assert_eq!(controller.user_settings(), UserSettings::default());
}

#[tokio::test]
async fn test_out_of_range_remote_defaults_fall_back_to_config() {
    let (remote, controller) = ready();
    *remote.settings.lock().unwrap() = UserSettings {
        default_temperature: 0.9,
        default_top_k: 5,
        preferred_collection_id: None,
    };

    let _ = controller.load().await;
    let settings = controller.user_settings();
    assert_eq!(settings.default_temperature, 0.9);
    assert_eq!(settings.default_top_k, ParleyConfig::default().defaults.top_k);

    let new_id = controller.new_chat().await.unwrap();
    let fresh = controller.session(&new_id).unwrap();
    assert!((20..=50).contains(&fresh.top_k));
    assert_eq!(fresh.temperature, 0.9);
}

#[tokio::test]
async fn test_loaded_defaults_out_of_range_use_config() {
    let (remote, controller) = ready();
    *remote.settings.lock().unwrap() = UserSettings {
        default_temperature: 4.0,
        default_top_k: 200,
        preferred_collection_id: None,
    };

    let loaded = controller.load_user_settings().await;
    let defaults = ParleyConfig::default().defaults;
    assert_eq!(loaded.default_temperature, defaults.temperature);
    assert_eq!(loaded.default_top_k, defaults.top_k);
    assert_eq!(controller.user_settings(), loaded);
}

// =============================================================================
// Utilities
// =============================================================================

fn with_conversation(
    player: Arc<dyn AudioPlayer>,
) -> (Arc<FakeRemote>, Arc<ChatController>, String, String) {
    let remote = Arc::new(FakeRemote::default());
    let mut session = server_session(42, Some(1));
    let question = Message::user("What is borrowing?");
    let answer = Message::assistant("A reference without ownership.", vec![]);
    let (question_id, answer_id) = (question.id.clone(), answer.id.clone());
    session.messages = vec![question, answer];
    let controller = build_with(
        &remote,
        seeded_kv(&[session], 42),
        ParleyConfig::default(),
        player,
    );
    (remote, controller, question_id, answer_id)
}

#[tokio::test]
async fn test_translate_attaches_translation() {
    let (_remote, controller, _question, answer) = with_conversation(Arc::new(NullPlayer));
    let outcome = controller.translate_message(&answer).await.unwrap();
    assert_eq!(
        outcome,
        UtilityOutcome::Completed("[fr] A reference without ownership.".to_string())
    );
    assert_eq!(
        messages(&controller)[1].translation.as_deref(),
        Some("[fr] A reference without ownership.")
    );
    assert!(controller.active_utility().is_none());
}

#[tokio::test]
async fn test_fetch_sources_uses_preceding_question() {
    let (remote, controller, _question, answer) = with_conversation(Arc::new(NullPlayer));
    let outcome = controller.fetch_sources(&answer).await.unwrap();
    assert_eq!(outcome, UtilityOutcome::Completed(1));

    let request = remote.sources_requests.lock().unwrap()[0].clone();
    assert_eq!(request.query, "What is borrowing?");
    assert_eq!(request.collection_id, 1);
    let sources = messages(&controller)[1].sources.clone().unwrap();
    assert_eq!(sources[0].source_name, "manual.pdf");
}

#[tokio::test]
async fn test_unknown_message_rejected() {
    let (_remote, controller, _question, _answer) = with_conversation(Arc::new(NullPlayer));
    let result = controller.translate_message("nope").await;
    assert!(matches!(result, Err(ChatError::MessageNotFound(_))));
}

#[tokio::test]
async fn test_speech_toggles_off_and_blocks_other_utilities() {
    let player = Arc::new(HangingPlayer::default());
    let (_remote, controller, question, answer) = with_conversation(player.clone());

    let speaker = Arc::clone(&controller);
    let target = answer.clone();
    let handle = tokio::spawn(async move { speaker.play_speech(&target).await });
    wait_until(|| player.started.load(Ordering::SeqCst) == 1).await;

    let token = controller.active_utility().unwrap();
    assert_eq!(token.kind, UtilityKind::Tts);
    assert_eq!(token.message_id, answer);

    let busy = controller.translate_message(&question).await;
    assert!(matches!(busy, Err(ChatError::UtilityBusy(_))));
    assert!(controller.notice().is_some());

    let toggled = controller.play_speech(&answer).await.unwrap();
    assert_eq!(toggled, UtilityOutcome::ToggledOff);
    assert_eq!(handle.await.unwrap().unwrap(), UtilityOutcome::Stopped);
    assert!(controller.active_utility().is_none());
}

#[tokio::test]
async fn test_speech_on_other_message_replaces_playback() {
    let player = Arc::new(HangingPlayer::default());
    let (_remote, controller, question, answer) = with_conversation(player.clone());

    let speaker = Arc::clone(&controller);
    let first_target = answer.clone();
    let first = tokio::spawn(async move { speaker.play_speech(&first_target).await });
    wait_until(|| player.started.load(Ordering::SeqCst) == 1).await;

    let speaker = Arc::clone(&controller);
    let second_target = question.clone();
    let second = tokio::spawn(async move { speaker.play_speech(&second_target).await });
    wait_until(|| player.started.load(Ordering::SeqCst) == 2).await;

    assert_eq!(first.await.unwrap().unwrap(), UtilityOutcome::Stopped);
    assert_eq!(controller.active_utility().unwrap().message_id, question);

    controller.play_speech(&question).await.unwrap();
    assert_eq!(second.await.unwrap().unwrap(), UtilityOutcome::Stopped);
    assert!(controller.active_utility().is_none());
}

#[tokio::test]
async fn test_playback_failure_clears_slot_with_notice() {
    let (_remote, controller, _question, answer) = with_conversation(Arc::new(FailingPlayer));
    let result = controller.play_speech(&answer).await;
    assert!(matches!(result, Err(ChatError::Playback(_))));
    assert!(controller.active_utility().is_none());
    assert!(controller.notice().unwrap().message.contains("no output device"));
    assert!(controller.dismiss_notice());
    assert!(controller.notice().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_notice_clears_after_ttl() {
    let (_remote, controller) = ready();
    let _ = controller.send("").await;
    assert!(controller.notice().is_some());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(controller.notice().is_none());
}
