use std::fmt;
use std::path::PathBuf;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::core::error::InvalidUserId;

/// Ordered, de-duplicated label identifiers of one message.
pub type LabelSet = IndexSet<String>;

/// Location value stored when the mailbox location is not known.
pub const UNKNOWN_LOCATION: i64 = -1;

/// Account identifier. Used verbatim inside index file names, so it is
/// restricted to characters that are safe in a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidUserId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidUserId(raw));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '+'));
        if !valid {
            return Err(InvalidUserId(raw));
        }
        Ok(UserId(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidUserId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UserId::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Where the ciphertext of a message body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    /// Metadata-only row (body not downloaded yet).
    None,
    Inline { ciphertext: Vec<u8>, iv: Vec<u8> },
    /// Ciphertext too large to keep in the row; stored in a side file.
    File { path: PathBuf, iv: Vec<u8> },
}

/// One row of the search index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub message_id: String,
    pub time: i64,
    pub label_ids: LabelSet,
    pub is_starred: Option<bool>,
    pub unread: bool,
    pub location: i64,
    pub order: Option<i64>,
    pub decryption_failed: bool,
    pub content: EntryContent,
    /// Ciphertext length in bytes, -1 when unknown.
    pub content_size: i64,
}

impl IndexEntry {
    /// Metadata-only entry; attach a body with [`crate::core::content::seal_entry`].
    pub fn new(message_id: impl Into<String>, time: i64) -> Self {
        IndexEntry {
            message_id: message_id.into(),
            time,
            label_ids: LabelSet::new(),
            is_starred: None,
            unread: false,
            location: UNKNOWN_LOCATION,
            order: None,
            decryption_failed: false,
            content: EntryContent::None,
            content_size: -1,
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.content, EntryContent::None)
    }
}

/// Decrypted working copy of an index entry held by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub message_id: String,
    pub time: i64,
    pub order: Option<i64>,
    pub label_ids: LabelSet,
    pub is_starred: Option<bool>,
    pub unread: bool,
    pub location: i64,
    /// Plaintext body; `None` for metadata-only and undecryptable rows.
    pub body: Option<String>,
}

/// Rough per-entry bookkeeping overhead (map slot, struct, allocations).
const CACHED_MESSAGE_OVERHEAD: u64 = 256;

impl CachedMessage {
    pub fn from_entry(entry: &IndexEntry, body: Option<String>) -> Self {
        CachedMessage {
            message_id: entry.message_id.clone(),
            time: entry.time,
            order: entry.order,
            label_ids: entry.label_ids.clone(),
            is_starred: entry.is_starred,
            unread: entry.unread,
            location: entry.location,
            body,
        }
    }

    /// Estimated in-memory footprint, used against the cache byte budget.
    pub fn estimated_size(&self) -> u64 {
        let labels: usize = self.label_ids.iter().map(|l| l.len()).sum();
        let body = self.body.as_ref().map_or(0, |b| b.len());
        CACHED_MESSAGE_OVERHEAD + (self.message_id.len() + labels + body) as u64
    }
}

/// Snapshot of one user's index, for diagnostics and settings screens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub exists: bool,
    pub entries: u64,
    pub size_on_disk: Option<u64>,
    pub free_disk_space: Option<u64>,
    pub oldest_time: Option<i64>,
    pub cached_entries: usize,
    pub cache_partial: bool,
}
