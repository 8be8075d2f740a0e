use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid user id: {0:?}")]
pub struct InvalidUserId(pub String);

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("message {0} is already indexed")]
    Duplicate(String),

    #[error("cannot serialize labels: {0}")]
    Serialization(String),

    #[error("index insert failed: {0}")]
    Database(#[source] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open search index at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Insert(#[from] InsertError),

    #[error("search index query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("search index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot seal message content: {0}")]
    Encrypt(#[from] EncryptError),

    #[error("search index handle is closed")]
    Closed,

    #[error("no search index is open")]
    NoActiveIndex,
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid initialization vector ({0} bytes)")]
    InvalidIv(usize),

    #[error("decryption failed")]
    Failed,

    #[error("decrypted content is not valid UTF-8")]
    NotUtf8,

    #[error("cannot read content file {path}: {source}")]
    ContentFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entry has no content")]
    NoContent,
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("encryption failed")]
    Failed,

    #[error("cannot write content file {path}: {source}")]
    ContentFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DeleteError {
    /// The index is still in use (an open handle is leased by a reader).
    #[error("search index for {0} is in use")]
    Locked(String),

    #[error("cannot remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close search index: {0}")]
    Close(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum SizeQueryError {
    #[error("cannot query size of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host memory size unavailable")]
    MemoryUnavailable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl StoreError {
    /// Whether the caller should treat the index as missing and rebuild it.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Open { .. })
    }
}
