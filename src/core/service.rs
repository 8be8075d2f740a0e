use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SearchConfig;
use crate::core::budget::CacheBudget;
use crate::core::cache::{CacheRef, SearchCache};
use crate::core::cipher::Cipher;
use crate::core::content::seal_entry;
use crate::core::error::{DeleteError, StoreError};
use crate::core::lifecycle::IndexLifecycle;
use crate::core::models::{EntryContent, IndexEntry, IndexStats, UserId};
use crate::core::store::IndexHandle;

struct ActiveUser {
    user_id: UserId,
    handle: IndexHandle,
    cipher: Arc<dyn Cipher>,
}

/// Owner of the index lifecycle and the cache. Construct one per process.
pub struct SearchService {
    config: SearchConfig,
    lifecycle: IndexLifecycle,
    cache: SearchCache,
    session: Mutex<Option<ActiveUser>>,
}

impl SearchService {
    /// Budget is derived from the host's memory.
    pub fn new(config: SearchConfig) -> Self {
        let budget = CacheBudget::detect(config.heap_fraction, config.estimated_entry_size);
        Self::with_budget(config, budget)
    }

    pub fn with_budget(config: SearchConfig, budget: CacheBudget) -> Self {
        SearchService {
            lifecycle: IndexLifecycle::from_config(&config),
            cache: SearchCache::new(budget),
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &IndexLifecycle {
        &self.lifecycle
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.session.lock().await.as_ref().map(|s| s.user_id.clone())
    }

    /// Make `user_id` the active account: open (or recreate) its index and
    /// start building its cache in the background. The previous user's cache
    /// is dropped and its index closed.
    pub async fn switch_user(
        &self,
        user_id: &UserId,
        cipher: Arc<dyn Cipher>,
    ) -> Result<IndexHandle, StoreError> {
        let mut session = self.session.lock().await;

        if let Some(active) = session.as_ref() {
            if &active.user_id == user_id && !active.handle.is_closed() {
                return Ok(active.handle.clone());
            }
        }
        if let Some(previous) = session.take() {
            log::info!("Switching search from {} to {}", previous.user_id, user_id);
            self.cache.delete_for(&previous.user_id).await;
        }

        let handle = self.lifecycle.open_or_reset(user_id).await?;
        let started = self
            .cache
            .start_build(user_id.clone(), handle.clone(), Arc::clone(&cipher))
            .await;
        log::debug!("Cache build for {user_id}: {started:?}");

        *session = Some(ActiveUser {
            user_id: user_id.clone(),
            handle: handle.clone(),
            cipher,
        });
        Ok(handle)
    }

    /// Wait for the active user's cache build and return a view of it.
    pub async fn cache_for_active(&self) -> Result<CacheRef, StoreError> {
        let (user_id, handle, cipher) = self.active().await?;
        Ok(self.cache.build_for(&user_id, handle, cipher).await)
    }

    /// Rebuild the active user's cache from scratch.
    pub async fn rebuild_cache(&self) -> Result<CacheRef, StoreError> {
        let (user_id, handle, cipher) = self.active().await?;
        self.cache.delete_for(&user_id).await;
        Ok(self.cache.build_for(&user_id, handle, cipher).await)
    }

    async fn active(&self) -> Result<(UserId, IndexHandle, Arc<dyn Cipher>), StoreError> {
        let session = self.session.lock().await;
        let active = session.as_ref().ok_or(StoreError::NoActiveIndex)?;
        Ok((
            active.user_id.clone(),
            active.handle.clone(),
            Arc::clone(&active.cipher),
        ))
    }

    /// Seal `body` (if any) into `entry` and add it to the active index. The
    /// cache is refreshed in place when it holds this user.
    pub async fn index_message(
        &self,
        entry: IndexEntry,
        body: Option<&str>,
    ) -> Result<(), StoreError> {
        let (user_id, handle, cipher) = self.active().await?;

        let entry = match body {
            Some(body) => seal_entry(
                entry,
                body,
                cipher.as_ref(),
                self.config.inline_content_threshold,
                &self.lifecycle.content_dir_for(&user_id),
            )?,
            None => entry,
        };

        if let Err(e) = handle.insert(entry.clone()).await {
            discard_content_file(&entry.content);
            return Err(e);
        }
        self.cache.update_entry(&user_id, &entry, cipher.as_ref());
        Ok(())
    }

    /// Replace the body of an indexed message. `Ok(false)` if it is not indexed.
    pub async fn update_message(&self, message_id: &str, body: &str) -> Result<bool, StoreError> {
        let (user_id, handle, cipher) = self.active().await?;

        let Some(entry) = handle.get(message_id).await? else {
            log::debug!("Not updating {message_id}, it is not indexed");
            return Ok(false);
        };
        let sealed = seal_entry(
            entry,
            body,
            cipher.as_ref(),
            self.config.inline_content_threshold,
            &self.lifecycle.content_dir_for(&user_id),
        )?;

        let updated = match handle
            .update_content(message_id, sealed.content.clone(), sealed.content_size)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                discard_content_file(&sealed.content);
                return Err(e);
            }
        };
        if updated {
            self.cache.update_entry(&user_id, &sealed, cipher.as_ref());
        } else {
            discard_content_file(&sealed.content);
        }
        Ok(updated)
    }

    /// `Ok(false)` if the message was not indexed.
    pub async fn remove_message(&self, message_id: &str) -> Result<bool, StoreError> {
        let (user_id, handle, _) = self.active().await?;
        let removed = handle.remove(message_id).await?;
        self.cache.invalidate_entry(&user_id, message_id);
        Ok(removed)
    }

    /// Drop `user_id`'s cache and delete its index files.
    pub async fn delete_index(&self, user_id: &UserId) -> Result<bool, DeleteError> {
        let mut session = self.session.lock().await;
        self.cache.delete_for(user_id).await;
        if session.as_ref().is_some_and(|s| &s.user_id == user_id) {
            *session = None;
        }
        self.lifecycle.delete(user_id).await
    }

    /// Shrink the active index to at most `expected_size` bytes on disk. The
    /// cache is rebuilt afterwards if anything was removed.
    pub async fn shrink(&self, expected_size: u64) -> Result<u64, StoreError> {
        let (_, handle, _) = self.active().await?;
        let removed = handle.shrink(expected_size).await?;
        if removed > 0 {
            self.rebuild_cache().await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self, user_id: &UserId) -> Result<IndexStats, StoreError> {
        let exists = self.lifecycle.exists(user_id);
        let entries = self.lifecycle.count(user_id).await?;

        let size_on_disk = self.lifecycle.size_on_disk(user_id).unwrap_or_else(|e| {
            log::warn!("{e}");
            None
        });
        let free_disk_space = match self.lifecycle.free_disk_space() {
            Ok(free) => Some(free),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        };
        let oldest_time = match self.lifecycle.active().await {
            Some(handle) if handle.user_id() == user_id => handle.oldest_time().await?,
            _ => None,
        };

        Ok(IndexStats {
            exists,
            entries,
            size_on_disk,
            free_disk_space,
            oldest_time,
            cached_entries: self.cache.len(user_id),
            cache_partial: self.cache.is_partial(user_id),
        })
    }

    /// Cancel any cache build and close the active index.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        if let Some(active) = self.session.lock().await.take() {
            self.cache.delete_for(&active.user_id).await;
        }
        self.lifecycle.close().await
    }
}

fn discard_content_file(content: &EntryContent) {
    if let EntryContent::File { path, .. } = content {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove content file {}: {}", path.display(), e);
        }
    }
}
