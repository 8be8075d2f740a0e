use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension};

use super::schema::ENTRY_COLUMNS;
use crate::core::error::{InsertError, StoreError};
use crate::core::labels::{decode_labels, encode_labels};
use crate::core::models::{EntryContent, IndexEntry};

/// Position after the last row of a batch; batches walk newest to oldest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCursor {
    pub time: i64,
    pub message_id: String,
}

impl BatchCursor {
    pub fn after(entry: &IndexEntry) -> Self {
        BatchCursor {
            time: entry.time,
            message_id: entry.message_id.clone(),
        }
    }
}

/// Oldest row removed while shrinking.
pub(super) struct RemovedRow {
    pub size: i64,
    pub content_file: Option<PathBuf>,
}

/// Expects columns in `ENTRY_COLUMNS` order:
///   0: ID, 1: Time, 2: MessageOrder, 3: LabelIDs, 4: IsStarred, 5: Unread,
///   6: Location, 7: DecryptionFailed, 8: EncryptionIV, 9: EncryptedContent,
///   10: EncryptedContentFile, 11: Size
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
    let iv: Option<Vec<u8>> = row.get(8)?;
    let inline: Option<Vec<u8>> = row.get(9)?;
    let file: Option<String> = row.get(10)?;

    let content = match (file, inline) {
        (Some(path), _) => EntryContent::File {
            path: PathBuf::from(path),
            iv: iv.unwrap_or_default(),
        },
        (None, Some(ciphertext)) => EntryContent::Inline {
            ciphertext,
            iv: iv.unwrap_or_default(),
        },
        (None, None) => EntryContent::None,
    };

    Ok(IndexEntry {
        message_id: row.get(0)?,
        time: row.get(1)?,
        order: row.get(2)?,
        label_ids: decode_labels(&row.get::<_, String>(3)?),
        is_starred: row.get(4)?,
        unread: row.get::<_, i32>(5)? != 0,
        location: row.get(6)?,
        decryption_failed: row.get::<_, i32>(7)? != 0,
        content,
        content_size: row.get(11)?,
    })
}

fn content_columns(content: &EntryContent) -> (Option<&[u8]>, Option<&[u8]>, Option<String>) {
    match content {
        EntryContent::None => (None, None, None),
        EntryContent::Inline { ciphertext, iv } => (Some(iv), Some(ciphertext), None),
        EntryContent::File { path, iv } => {
            (Some(iv), None, Some(path.to_string_lossy().into_owned()))
        }
    }
}

fn is_duplicate_key(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(super) fn do_insert(conn: &Connection, entry: &IndexEntry) -> Result<i64, InsertError> {
    let labels = encode_labels(&entry.label_ids)?;
    let (iv, inline, file) = content_columns(&entry.content);

    conn.execute(
        "INSERT INTO SearchableMessage (ID, Time, MessageOrder, LabelIDs, IsStarred, Unread,
             Location, HasBody, DecryptionFailed, EncryptionIV, EncryptedContent,
             EncryptedContentFile, Size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            entry.message_id,
            entry.time,
            entry.order,
            labels,
            entry.is_starred,
            entry.unread as i32,
            entry.location,
            entry.has_body() as i32,
            entry.decryption_failed as i32,
            iv,
            inline,
            file,
            entry.content_size,
        ],
    )
    .map_err(|e| {
        if is_duplicate_key(&e) {
            InsertError::Duplicate(entry.message_id.clone())
        } else {
            InsertError::Database(e)
        }
    })?;

    Ok(conn.last_insert_rowid())
}

/// Path of the out-of-line content file of a row, if any.
pub(super) fn do_content_file(
    conn: &Connection,
    message_id: &str,
) -> Result<Option<PathBuf>, StoreError> {
    let file: Option<Option<String>> = conn
        .query_row(
            "SELECT EncryptedContentFile FROM SearchableMessage WHERE ID = ?1",
            [message_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(file.flatten().map(PathBuf::from))
}

pub(super) fn do_remove(conn: &Connection, message_id: &str) -> Result<bool, StoreError> {
    let removed = conn.execute("DELETE FROM SearchableMessage WHERE ID = ?1", [message_id])?;
    // ID is the primary key, so at most one row.
    Ok(removed == 1)
}

pub(super) fn do_update_content(
    conn: &Connection,
    message_id: &str,
    content: &EntryContent,
    size: i64,
) -> Result<bool, StoreError> {
    let (iv, inline, file) = content_columns(content);
    let updated = conn.execute(
        "UPDATE SearchableMessage
         SET EncryptionIV = ?1, EncryptedContent = ?2, EncryptedContentFile = ?3, Size = ?4,
             HasBody = ?5, DecryptionFailed = 0
         WHERE ID = ?6",
        rusqlite::params![
            iv,
            inline,
            file,
            size,
            !matches!(content, EntryContent::None) as i32,
            message_id
        ],
    )?;
    Ok(updated > 0)
}

pub(super) fn do_mark_decryption_failed(
    conn: &Connection,
    message_id: &str,
) -> Result<bool, StoreError> {
    let updated = conn.execute(
        "UPDATE SearchableMessage SET DecryptionFailed = 1 WHERE ID = ?1",
        [message_id],
    )?;
    Ok(updated > 0)
}

pub(super) fn do_count(conn: &Connection) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM SearchableMessage", [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

pub(super) fn do_get(conn: &Connection, message_id: &str) -> Result<Option<IndexEntry>, StoreError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM SearchableMessage WHERE ID = ?1");
    Ok(conn.query_row(&sql, [message_id], row_to_entry).optional()?)
}

/// Next `limit` rows strictly older than `after`, newest first.
pub(super) fn do_load_batch(
    conn: &Connection,
    after: Option<&BatchCursor>,
    limit: u32,
) -> Result<Vec<IndexEntry>, StoreError> {
    match after {
        None => {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM SearchableMessage
                 ORDER BY Time DESC, ID DESC
                 LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit], row_to_entry)?;
            collect(rows)
        }
        Some(cursor) => {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM SearchableMessage
                 WHERE Time < ?1 OR (Time = ?1 AND ID < ?2)
                 ORDER BY Time DESC, ID DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![cursor.time, cursor.message_id, limit],
                row_to_entry,
            )?;
            collect(rows)
        }
    }
}

pub(super) fn do_list_since(conn: &Connection, time: i64) -> Result<Vec<IndexEntry>, StoreError> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM SearchableMessage
         WHERE Time >= ?1
         ORDER BY Time DESC, ID DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([time], row_to_entry)?;
    collect(rows)
}

pub(super) fn do_oldest_time(conn: &Connection) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT Time FROM SearchableMessage ORDER BY Time ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub(super) fn do_oldest_message_id(conn: &Connection) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT ID FROM SearchableMessage ORDER BY Time ASC, ID ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub(super) fn do_remove_oldest(conn: &Connection) -> Result<Option<RemovedRow>, StoreError> {
    let oldest = conn
        .query_row(
            "SELECT ID, Size, EncryptedContentFile FROM SearchableMessage
             ORDER BY Time ASC, ID ASC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((message_id, size, file)) = oldest else {
        return Ok(None);
    };
    conn.execute("DELETE FROM SearchableMessage WHERE ID = ?1", [&message_id])?;
    log::debug!("Removed oldest index entry {message_id} ({size} bytes)");
    Ok(Some(RemovedRow {
        size,
        content_file: file.map(PathBuf::from),
    }))
}
