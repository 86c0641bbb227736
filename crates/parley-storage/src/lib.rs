//! Parley Storage crate - SQLite-backed local cache.
//!
//! Provides a WAL-mode SQLite database with migrations and a namespaced
//! key-value store the chat controller mirrors its state into.

pub mod db;
pub mod kv;
pub mod migrations;

pub use db::Database;
pub use kv::{CacheKey, KvStore};
