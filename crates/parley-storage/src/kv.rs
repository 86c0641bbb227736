//! Namespaced key-value store over the cache database.
//!
//! Values are stored as JSON text. Reads that hit a missing or corrupt
//! entry degrade to a caller-supplied default instead of failing.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use parley_core::error::ParleyError;

use crate::db::Database;

/// Keys the chat controller persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Sessions,
    ActiveSessionId,
    Collections,
    UserSettings,
    SelectedCollectionId,
    CustomPrompt,
}

impl CacheKey {
    pub const ALL: [CacheKey; 6] = [
        CacheKey::Sessions,
        CacheKey::ActiveSessionId,
        CacheKey::Collections,
        CacheKey::UserSettings,
        CacheKey::SelectedCollectionId,
        CacheKey::CustomPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKey::Sessions => "sessions",
            CacheKey::ActiveSessionId => "active-session-id",
            CacheKey::Collections => "collections",
            CacheKey::UserSettings => "user-settings",
            CacheKey::SelectedCollectionId => "selected-collection-id",
            CacheKey::CustomPrompt => "custom-prompt",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key-value store scoped to one namespace.
#[derive(Clone, Debug)]
pub struct KvStore {
    db: Arc<Database>,
    namespace: String,
}

impl KvStore {
    pub fn new(db: Arc<Database>, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    /// In-memory store (for testing).
    pub fn in_memory(namespace: impl Into<String>) -> Result<Self, ParleyError> {
        Ok(Self::new(Arc::new(Database::in_memory()?), namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read the raw JSON text stored under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, ParleyError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![self.namespace, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ParleyError::Storage(format!("Failed to read '{}': {}", key, e)))
        })
    }

    /// Insert or overwrite the raw JSON text under `key`.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), ParleyError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_entries (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (namespace, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![self.namespace, key, value, Utc::now().timestamp()],
            )
            .map_err(|e| ParleyError::Storage(format!("Failed to write '{}': {}", key, e)))?;
            Ok(())
        })
    }

    /// Remove `key`. Returns whether an entry existed.
    pub fn remove(&self, key: &str) -> Result<bool, ParleyError> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    rusqlite::params![self.namespace, key],
                )
                .map_err(|e| ParleyError::Storage(format!("Failed to remove '{}': {}", key, e)))?;
            Ok(removed > 0)
        })
    }

    pub fn contains(&self, key: &str) -> Result<bool, ParleyError> {
        Ok(self.get_raw(key)?.is_some())
    }

    /// All keys in this namespace, sorted.
    pub fn keys(&self) -> Result<Vec<String>, ParleyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key")
                .map_err(|e| ParleyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![self.namespace], |row| row.get::<_, String>(0))
                .map_err(|e| ParleyError::Storage(e.to_string()))?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|e| ParleyError::Storage(e.to_string()))?);
            }
            Ok(keys)
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: CacheKey) -> Result<Option<T>, ParleyError> {
        match self.get_raw(key.as_str())? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: CacheKey, value: &T) -> Result<(), ParleyError> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key.as_str(), &raw)
    }

    /// Read `key`, degrading to `default` when absent, unreadable, or corrupt.
    pub fn load_or<T: DeserializeOwned>(&self, key: CacheKey, default: T) -> T {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value unusable, using default");
                default
            }
        }
    }

    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: CacheKey) -> T {
        self.load_or(key, T::default())
    }
}
