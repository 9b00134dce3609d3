//! Error kinds for each pipeline stage. The relay matches on these to decide
//! between skipping an item, abandoning a batch, or stopping the process.
use thiserror::Error;

/// Why an HTTP exchange with a remote API failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailure {
    Transport,
    Unauthorized,
    RateLimited,
    Status,
    Decode,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source account @{0} not found")]
    AccountNotFound(String),
    #[error("fetch failed ({kind:?}): {message}")]
    Fetch { kind: HttpFailure, message: String },
}

impl SourceError {
    pub fn fetch(kind: HttpFailure, message: impl Into<String>) -> Self {
        SourceError::Fetch {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaResolutionError {
    #[error("media {0} has no kind")]
    MissingKind(String),
    #[error("media {0} has no usable url")]
    MissingUrl(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to fetch media {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("destination rejected media upload ({kind:?}): {message}")]
    Register { kind: HttpFailure, message: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("destination rejected post ({kind:?}): {message}")]
    Rejected { kind: HttpFailure, message: String },
}

impl PublishError {
    pub fn new(kind: HttpFailure, message: impl Into<String>) -> Self {
        PublishError::Rejected {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Persisted state exists but cannot be read back. Never treat as empty.
    #[error("cursor state is corrupt: {0}")]
    Corrupt(String),
    #[error("cursor state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cursor database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt(_))
    }
}
