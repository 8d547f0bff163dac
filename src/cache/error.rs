use thiserror::Error;

/// Failure reported by a [`BlobStore`](super::store::BlobStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store request failed: {message}")]
    Transient { message: String },
    #[error("store request timed out")]
    Timeout,
    #[error("store rejected request with status {status}")]
    Rejected { status: u16 },
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

/// Errors raised inside the artifact cache.
///
/// None of these reach the rendering caller: reads degrade to a miss and writes
/// are recorded by the background tracker.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed stored record for `{key}`: {message}")]
    Serialization { key: String, message: String },
    #[error("stored record for `{key}` has unknown kind `{kind}`")]
    UnknownKind { key: String, kind: String },
    #[error("purge of tags {tags:?} failed: {message}")]
    Purge { tags: Vec<String>, message: String },
    #[error("background task failed: {message}")]
    Background { message: String },
}

impl CacheError {
    pub fn serialization(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn unknown_kind(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnknownKind {
            key: key.into(),
            kind: kind.into(),
        }
    }

    pub fn purge(tags: &[String], message: impl Into<String>) -> Self {
        Self::Purge {
            tags: tags.to_vec(),
            message: message.into(),
        }
    }

    pub fn background(message: impl Into<String>) -> Self {
        Self::Background {
            message: message.into(),
        }
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Timeout) => "store_timeout",
            Self::Store(_) => "store_transient",
            Self::Serialization { .. } => "serialization",
            Self::UnknownKind { .. } => "unknown_kind",
            Self::Purge { .. } => "purge",
            Self::Background { .. } => "background",
        }
    }
}
