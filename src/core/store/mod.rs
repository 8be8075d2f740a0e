//! Per-user encrypted search index on SQLite.
//!
//! The `rusqlite::Connection` is owned by one background thread per open
//! index; every read and write goes through that thread, which makes it the
//! single writer. [`IndexHandle`] is the `Clone + Send + Sync` async facade
//! the rest of the crate talks to.

mod queries;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

pub use queries::BatchCursor;

use crate::core::error::{InsertError, StoreError};
use crate::core::models::{EntryContent, IndexEntry, UserId};

/// Side files SQLite keeps next to a WAL-mode database.
const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// The database file followed by its WAL and shared-memory side files.
pub fn store_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in SIDE_FILE_SUFFIXES {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

/// Bytes used by the database and its write-ahead log.
pub fn size_on_disk(path: &Path) -> std::io::Result<u64> {
    let mut total = std::fs::metadata(path)?.len();
    let wal = &store_files(path)[1];
    if let Ok(meta) = std::fs::metadata(wal) {
        total += meta.len();
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Commands sent from async world to the index thread
// ---------------------------------------------------------------------------

enum IndexCmd {
    Insert {
        entry: Box<IndexEntry>,
        reply: oneshot::Sender<Result<i64, InsertError>>,
    },
    Remove {
        message_id: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    UpdateContent {
        message_id: String,
        content: EntryContent,
        size: i64,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    MarkDecryptionFailed {
        message_id: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Get {
        message_id: String,
        reply: oneshot::Sender<Result<Option<IndexEntry>, StoreError>>,
    },
    Count {
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    LoadBatch {
        after: Option<BatchCursor>,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<IndexEntry>, StoreError>>,
    },
    ListSince {
        time: i64,
        reply: oneshot::Sender<Result<Vec<IndexEntry>, StoreError>>,
    },
    OldestTime {
        reply: oneshot::Sender<Result<Option<i64>, StoreError>>,
    },
    OldestMessageId {
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    Shrink {
        expected_size: u64,
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

// ---------------------------------------------------------------------------
// IndexHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IndexHandle {
    tx: mpsc::UnboundedSender<IndexCmd>,
    user_id: UserId,
    path: PathBuf,
    batch_reads: Arc<AtomicU64>,
    leases: Arc<AtomicUsize>,
}

/// Marks a handle as in use by a long-running reader (e.g. a cache build).
/// The index cannot be deleted while a lease is alive.
pub struct HandleLease {
    leases: Arc<AtomicUsize>,
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl IndexHandle {
    /// Open (or create) the index database at `path` and spawn its thread.
    ///
    /// A file that is not a readable SQLite database fails with
    /// [`StoreError::Open`].
    pub fn open(user_id: UserId, path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open_connection(path, busy_timeout)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let thread_path = path.to_path_buf();

        std::thread::Builder::new()
            .name(format!("search-index-{user_id}"))
            .spawn(move || Self::run_loop(conn, thread_path, rx))?;

        log::info!("Opened search index for {} at {}", user_id, path.display());
        Ok(IndexHandle {
            tx,
            user_id,
            path: path.to_path_buf(),
            batch_reads: Arc::new(AtomicU64::new(0)),
            leases: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of batch reads served through this handle (and its clones).
    pub fn batch_reads(&self) -> u64 {
        self.batch_reads.load(Ordering::Relaxed)
    }

    pub fn lease(&self) -> HandleLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        HandleLease {
            leases: Arc::clone(&self.leases),
        }
    }

    pub fn is_leased(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> IndexCmd,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    // -- async methods -------------------------------------------------------

    /// Returns the SQLite row id of the new entry.
    pub async fn insert(&self, entry: IndexEntry) -> Result<i64, StoreError> {
        let entry = Box::new(entry);
        Ok(self
            .request(|reply| IndexCmd::Insert { entry, reply })
            .await??)
    }

    /// `Ok(false)` when no entry had that id.
    pub async fn remove(&self, message_id: &str) -> Result<bool, StoreError> {
        let message_id = message_id.to_string();
        self.request(|reply| IndexCmd::Remove { message_id, reply })
            .await?
    }

    pub async fn update_content(
        &self,
        message_id: &str,
        content: EntryContent,
        size: i64,
    ) -> Result<bool, StoreError> {
        let message_id = message_id.to_string();
        self.request(|reply| IndexCmd::UpdateContent {
            message_id,
            content,
            size,
            reply,
        })
        .await?
    }

    pub async fn mark_decryption_failed(&self, message_id: &str) -> Result<bool, StoreError> {
        let message_id = message_id.to_string();
        self.request(|reply| IndexCmd::MarkDecryptionFailed { message_id, reply })
            .await?
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<IndexEntry>, StoreError> {
        let message_id = message_id.to_string();
        self.request(|reply| IndexCmd::Get { message_id, reply })
            .await?
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.request(|reply| IndexCmd::Count { reply }).await?
    }

    /// Up to `limit` entries older than `after`, newest first.
    pub async fn load_batch(
        &self,
        after: Option<BatchCursor>,
        limit: u32,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        self.batch_reads.fetch_add(1, Ordering::Relaxed);
        self.request(|reply| IndexCmd::LoadBatch {
            after,
            limit,
            reply,
        })
        .await?
    }

    pub async fn list_since(&self, time: i64) -> Result<Vec<IndexEntry>, StoreError> {
        self.request(|reply| IndexCmd::ListSince { time, reply })
            .await?
    }

    pub async fn oldest_time(&self) -> Result<Option<i64>, StoreError> {
        self.request(|reply| IndexCmd::OldestTime { reply }).await?
    }

    pub async fn oldest_message_id(&self) -> Result<Option<String>, StoreError> {
        self.request(|reply| IndexCmd::OldestMessageId { reply })
            .await?
    }

    /// Drop the oldest entries until the estimated size is below
    /// `expected_size` bytes; 0 empties the index. Returns the number of
    /// entries removed.
    pub async fn shrink(&self, expected_size: u64) -> Result<u64, StoreError> {
        self.request(|reply| IndexCmd::Shrink {
            expected_size,
            reply,
        })
        .await?
    }

    /// Checkpoint the WAL and close the connection. Every clone of this
    /// handle fails with [`StoreError::Closed`] afterwards.
    pub async fn close(&self) -> Result<(), StoreError> {
        match self.request(|reply| IndexCmd::Close { reply }).await {
            Err(StoreError::Closed) => Ok(()),
            other => other?,
        }
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, path: PathBuf, mut rx: mpsc::UnboundedReceiver<IndexCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                IndexCmd::Insert { entry, reply } => {
                    let _ = reply.send(queries::do_insert(&conn, &entry));
                }
                IndexCmd::Remove { message_id, reply } => {
                    let _ = reply.send(Self::do_remove(&conn, &message_id));
                }
                IndexCmd::UpdateContent {
                    message_id,
                    content,
                    size,
                    reply,
                } => {
                    let _ = reply.send(Self::do_update_content(&conn, &message_id, &content, size));
                }
                IndexCmd::MarkDecryptionFailed { message_id, reply } => {
                    let _ = reply.send(queries::do_mark_decryption_failed(&conn, &message_id));
                }
                IndexCmd::Get { message_id, reply } => {
                    let _ = reply.send(queries::do_get(&conn, &message_id));
                }
                IndexCmd::Count { reply } => {
                    let _ = reply.send(queries::do_count(&conn));
                }
                IndexCmd::LoadBatch {
                    after,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(queries::do_load_batch(&conn, after.as_ref(), limit));
                }
                IndexCmd::ListSince { time, reply } => {
                    let _ = reply.send(queries::do_list_since(&conn, time));
                }
                IndexCmd::OldestTime { reply } => {
                    let _ = reply.send(queries::do_oldest_time(&conn));
                }
                IndexCmd::OldestMessageId { reply } => {
                    let _ = reply.send(queries::do_oldest_message_id(&conn));
                }
                IndexCmd::Shrink {
                    expected_size,
                    reply,
                } => {
                    let _ = reply.send(Self::do_shrink(&conn, &path, expected_size));
                }
                IndexCmd::Close { reply } => {
                    let result = checkpoint(&conn);
                    drop(conn);
                    log::debug!("Search index closed: {}", path.display());
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        log::debug!("Search index thread exiting");
    }

    fn do_remove(conn: &Connection, message_id: &str) -> Result<bool, StoreError> {
        let content_file = queries::do_content_file(conn, message_id)?;
        let removed = queries::do_remove(conn, message_id)?;
        if removed {
            remove_content_file(content_file);
        }
        Ok(removed)
    }

    fn do_update_content(
        conn: &Connection,
        message_id: &str,
        content: &EntryContent,
        size: i64,
    ) -> Result<bool, StoreError> {
        let old_file = queries::do_content_file(conn, message_id)?;
        let updated = queries::do_update_content(conn, message_id, content, size)?;
        if updated {
            let new_file = match content {
                EntryContent::File { path, .. } => Some(path),
                _ => None,
            };
            if old_file.as_ref() != new_file {
                remove_content_file(old_file);
            }
        } else {
            log::warn!("Update content failed, no entry for message {message_id}");
        }
        Ok(updated)
    }

    fn do_shrink(conn: &Connection, path: &Path, expected_size: u64) -> Result<u64, StoreError> {
        let size = size_on_disk(path)?;
        if size < expected_size {
            return Ok(0);
        }
        log::info!("Shrinking search index from {size} to {expected_size} bytes");

        let mut deleted_bytes: u64 = 0;
        let mut removed = 0;
        while let Some(row) = queries::do_remove_oldest(conn)? {
            removed += 1;
            deleted_bytes += row.size.max(0) as u64;
            remove_content_file(row.content_file);
            if size.saturating_sub(deleted_bytes) < expected_size {
                break;
            }
        }

        conn.execute_batch("VACUUM")?;
        checkpoint(conn)?;
        log::info!(
            "Shrunk search index by {removed} entries, now {} bytes",
            size_on_disk(path)?
        );
        Ok(removed)
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let open_err = |source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).map_err(open_err)?;
    conn.busy_timeout(busy_timeout).map_err(open_err)?;
    // First statement that touches the file; a corrupt database fails here.
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
        .map_err(open_err)?;
    schema::create_schema(&conn).map_err(open_err)?;
    Ok(conn)
}

/// Flush the WAL into the main database file.
fn checkpoint(conn: &Connection) -> Result<(), StoreError> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}

fn remove_content_file(path: Option<PathBuf>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("Failed to remove content file {}: {}", path.display(), e);
        }
    }
}
