use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("operation canceled")]
    Canceled,
}

impl StoreError {
    /// Read-path failures the degrade-to-empty policy may absorb. Cursor and
    /// filter problems are caller mistakes and always surface.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
