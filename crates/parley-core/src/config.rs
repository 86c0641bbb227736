use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ParleyError, Result};

/// Top-level configuration for the Parley chat controller.
///
/// Loaded from `~/.parley/config.toml` by the embedding application. Each
/// section corresponds to one concern of the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl ParleyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ParleyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the local cache database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Namespace prefix for persisted cache keys.
    pub namespace: String,
}

impl GeneralConfig {
    /// `data_dir` with a leading `~/` expanded to the home directory.
    pub fn data_path(&self) -> PathBuf {
        let data_dir = self.data_dir.as_str();
        if let Some(rest) = data_dir
            .strip_prefix("~/")
            .or_else(|| data_dir.strip_prefix("~\\"))
        {
            let home = std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(rest)
        } else {
            PathBuf::from(data_dir)
        }
    }

    /// Location of the local cache database.
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_path().join("cache.db")
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.parley/data".to_string(),
            log_level: "info".to_string(),
            namespace: "parley".to_string(),
        }
    }
}

/// Remote session/message store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the remote API, without trailing slash.
    pub base_url: String,
    /// Bound on each plain request, and on opening the chat stream. The
    /// stream body is only bounded by `stream_idle_timeout_secs`.
    pub request_timeout_secs: u64,
    /// Maximum silence between two reads of the push channel.
    pub stream_idle_timeout_secs: u64,
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 300,
            stream_idle_timeout_secs: 600,
        }
    }
}

/// Chat controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Characters of the first user message used as the session title.
    pub title_max_chars: usize,
    /// Seconds a user-visible notice stays up before clearing itself.
    pub notice_ttl_secs: u64,
    /// Ask the push channel to emit a `sources` frame with every answer.
    pub fetch_sources_inline: bool,
    /// Capacity of the controller event broadcast channel.
    pub event_capacity: usize,
}

impl ChatConfig {
    pub fn notice_ttl(&self) -> Duration {
        Duration::from_secs(self.notice_ttl_secs)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 30,
            notice_ttl_secs: 5,
            fetch_sources_inline: false,
            event_capacity: 256,
        }
    }
}

/// Generation defaults applied to new sessions when no stored user
/// defaults exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub temperature: f64,
    pub top_k: u32,
    pub vocal_voice: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 20,
            vocal_voice: "en_female".to_string(),
        }
    }
}
