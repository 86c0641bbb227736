use thiserror::Error;

/// Top-level error type for the Parley workspace.
///
/// Subsystem crates define their own error types and implement
/// `From<ParleyError>` so that the `?` operator works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParleyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for ParleyError {
    fn from(err: toml::de::Error) -> Self {
        ParleyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ParleyError {
    fn from(err: toml::ser::Error) -> Self {
        ParleyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Parley operations.
pub type Result<T> = std::result::Result<T, ParleyError>;
