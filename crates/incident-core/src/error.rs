use thiserror::Error;

/// Failure reported by a [`crate::store::RemoteStore`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {0} already exists")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store request timed out after {0} ms")]
    Timeout(u64),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Why a photo could not be turned into an embeddable payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to decode source image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error("write rejected: {0}")]
    Store(#[from] StoreError),
}

/// Terminal failure of a live subscription. Delivered at most once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("failed to open listener: {0}")]
    Listen(StoreError),
    #[error("subscription cancelled by store: {0}")]
    Cancelled(String),
}

/// A remote entry that was left out of the published view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("skipped entry {key}: {reason}")]
pub struct SkippedEntry {
    pub key: String,
    pub reason: String,
}
