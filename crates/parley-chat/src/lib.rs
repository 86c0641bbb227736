//! Streaming chat controller for Parley.
//!
//! Manages conversation sessions mirrored across memory, the local cache,
//! and a remote store; streams assistant replies over a server-push
//! channel; and serializes per-message utility operations.

pub mod controller;
pub mod error;
pub mod frame;
pub mod http;
pub mod notice;
pub mod remote;
pub mod session_store;
pub mod settings;
pub mod utility;

pub use controller::{derive_title, ChatController, SendOutcome};
pub use error::{ChatError, ErrorKind};
pub use frame::{Frame, FrameDecoder};
pub use http::HttpRemote;
pub use remote::{
    AudioPlayer, ChatStreamRequest, ChunkStream, NullPlayer, RemoteStore, SourcesRequest,
};
pub use session_store::{Attachment, SessionPatch, SessionStore};
pub use settings::{SettingsPatch, SettingsSynchronizer};
pub use utility::{Acquire, UtilityGuard, UtilityMutex, UtilityOutcome};
