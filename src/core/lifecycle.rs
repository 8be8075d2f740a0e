use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::Mutex;

use crate::config::SearchConfig;
use crate::core::error::{DeleteError, SizeQueryError, StoreError};
use crate::core::models::UserId;
use crate::core::store::{self, IndexHandle};

pub const INDEX_PREFIX: &str = "encryptedSearchIndex";
pub const INDEX_EXTENSION: &str = "sqlite3";
const CONTENT_PREFIX: &str = "encryptedSearchContent";

/// At most one index is open; opening another user's closes the previous one.
pub struct IndexLifecycle {
    root: PathBuf,
    busy_timeout: Duration,
    active: Mutex<Option<IndexHandle>>,
}

impl IndexLifecycle {
    pub fn new(root: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        IndexLifecycle {
            root: root.into(),
            busy_timeout,
            active: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        Self::new(
            config.index_dir.clone(),
            Duration::from_secs(config.busy_timeout_secs),
        )
    }

    /// `<root>/encryptedSearchIndex_<user>.sqlite3`
    pub fn path_for(&self, user_id: &UserId) -> PathBuf {
        self.root
            .join(format!("{INDEX_PREFIX}_{user_id}.{INDEX_EXTENSION}"))
    }

    /// Directory holding the out-of-line content files of `user_id`.
    pub fn content_dir_for(&self, user_id: &UserId) -> PathBuf {
        self.root.join(format!("{CONTENT_PREFIX}_{user_id}"))
    }

    pub fn exists(&self, user_id: &UserId) -> bool {
        self.path_for(user_id).is_file()
    }

    /// Handle of the currently open index, if any.
    pub async fn active(&self) -> Option<IndexHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Open `user_id`'s index, creating it if needed, and make it the active one.
    pub async fn open(&self, user_id: &UserId) -> Result<IndexHandle, StoreError> {
        let mut active = self.active.lock().await;

        if let Some(handle) = active.as_ref() {
            if handle.user_id() == user_id && !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        if let Some(previous) = active.take() {
            log::info!("Switching search index from {} to {}", previous.user_id(), user_id);
            if let Err(e) = previous.close().await {
                log::warn!("Failed to close search index of {}: {}", previous.user_id(), e);
            }
        }

        let handle = IndexHandle::open(user_id.clone(), &self.path_for(user_id), self.busy_timeout)?;
        *active = Some(handle.clone());
        Ok(handle)
    }

    /// Like [`open`](Self::open), but a corrupt or unreadable index is deleted
    /// and recreated empty.
    pub async fn open_or_reset(&self, user_id: &UserId) -> Result<IndexHandle, StoreError> {
        match self.open(user_id).await {
            Err(e) if e.is_corruption() => {
                log::warn!("Search index of {user_id} is unusable, recreating it: {e}");
                if let Err(e) = self.delete(user_id).await {
                    log::error!("Failed to delete unusable search index of {user_id}: {e}");
                }
                self.open(user_id).await
            }
            other => other,
        }
    }

    /// Close the active index, if any.
    pub async fn close(&self) -> Result<(), StoreError> {
        match self.active.lock().await.take() {
            Some(handle) => handle.close().await,
            None => Ok(()),
        }
    }

    /// Number of entries; 0 when the index does not exist. Never creates it.
    pub async fn count(&self, user_id: &UserId) -> Result<u64, StoreError> {
        if let Some(handle) = self.active().await {
            if handle.user_id() == user_id {
                return handle.count().await;
            }
        }
        let path = self.path_for(user_id);
        if !path.is_file() {
            return Ok(0);
        }
        let open_err = |source| StoreError::Open {
            path: path.clone(),
            source,
        };
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(open_err)?;
        let sql = format!("SELECT COUNT(*) FROM {}", store::schema::TABLE);
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(open_err)?;
        Ok(count as u64)
    }

    /// `None` when the index does not exist.
    pub fn size_on_disk(&self, user_id: &UserId) -> Result<Option<u64>, SizeQueryError> {
        let path = self.path_for(user_id);
        if !path.is_file() {
            return Ok(None);
        }
        store::size_on_disk(&path)
            .map(Some)
            .map_err(|source| SizeQueryError::Io { path, source })
    }

    /// Free space on the volume holding the index directory.
    pub fn free_disk_space(&self) -> Result<u64, SizeQueryError> {
        let probe = nearest_existing(&self.root);
        fs2::available_space(&probe).map_err(|source| SizeQueryError::Io {
            path: probe.to_path_buf(),
            source,
        })
    }

    /// Close `user_id`'s index if open, then remove its files.
    ///
    /// Returns `Ok(false)` when there was nothing to delete. Fails with
    /// [`DeleteError::Locked`] while a reader holds a lease on the open handle.
    /// Removal continues past individual failures; the first one is reported.
    pub async fn delete(&self, user_id: &UserId) -> Result<bool, DeleteError> {
        {
            let mut active = self.active.lock().await;
            if let Some(handle) = active.as_ref().filter(|h| h.user_id() == user_id) {
                if handle.is_leased() {
                    return Err(DeleteError::Locked(user_id.to_string()));
                }
                handle.close().await.map_err(DeleteError::Close)?;
                *active = None;
            }
        }

        let path = self.path_for(user_id);
        let existed = path.is_file();
        let mut first_error = None;

        for file in store::store_files(&path) {
            match fs::remove_file(&file) {
                Ok(()) => log::debug!("Removed {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    log::error!("Failed to remove {}: {}", file.display(), source);
                    first_error.get_or_insert(DeleteError::Io { path: file, source });
                }
            }
        }

        let content_dir = self.content_dir_for(user_id);
        match fs::remove_dir_all(&content_dir) {
            Ok(()) => log::debug!("Removed {}", content_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                log::error!("Failed to remove {}: {}", content_dir.display(), source);
                first_error.get_or_insert(DeleteError::Io {
                    path: content_dir,
                    source,
                });
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if existed {
            log::info!("Deleted search index of {user_id}");
        } else {
            log::debug!("No search index to delete for {user_id}");
        }
        Ok(existed)
    }
}

fn nearest_existing(path: &Path) -> &Path {
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }
    probe
}
