//! Error types for call persistence.

/// Errors that can occur while reading or writing call records.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A database operation failed.
    #[error("call database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No call exists with the given id.
    #[error("call not found: {0}")]
    NotFound(String),

    /// JSON serialization or deserialization failed.
    #[error("call serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
