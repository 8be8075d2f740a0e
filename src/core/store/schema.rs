use rusqlite::Connection;

pub const TABLE: &str = "SearchableMessage";

/// Schema DDL run on every open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS SearchableMessage (
    ID TEXT PRIMARY KEY NOT NULL,
    Time INTEGER NOT NULL DEFAULT 0,
    MessageOrder INTEGER,
    LabelIDs TEXT NOT NULL DEFAULT '',
    IsStarred INTEGER,
    Unread INTEGER NOT NULL DEFAULT 0,
    Location INTEGER NOT NULL DEFAULT -1,
    HasBody INTEGER NOT NULL DEFAULT 0,
    DecryptionFailed INTEGER NOT NULL DEFAULT 0,
    EncryptionIV BLOB,
    EncryptedContent BLOB,
    EncryptedContentFile TEXT,
    Size INTEGER NOT NULL DEFAULT -1
);

CREATE INDEX IF NOT EXISTS idx_searchable_message_time
    ON SearchableMessage(Time DESC, ID DESC);
";

/// Column list shared by every query that materializes an `IndexEntry`.
///
/// Order matters, see `queries::row_to_entry`.
pub const ENTRY_COLUMNS: &str = "ID, Time, MessageOrder, LabelIDs, IsStarred, Unread, Location, \
     DecryptionFailed, EncryptionIV, EncryptedContent, EncryptedContentFile, Size";

/// Idempotent: safe to call on every open.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
