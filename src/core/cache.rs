//! Bounded in-memory cache of decrypted index entries for the active user.
//!
//! # Build policy
//!
//! A build pulls entries from the index newest first, `batch_size_entries` at
//! a time, decrypts them and adds them to the working set until the index is
//! exhausted or the byte budget is reached. The result is a most-recent window
//! of the mailbox, not necessarily a full mirror.
//!
//! - **Row failures**: an entry that cannot be decrypted is skipped, flagged in
//!   the index (`DecryptionFailed`) and the cache is marked partial.
//! - **Batch failures**: a store read error, or a batch in which no entry could
//!   be decrypted, ends the build at the last good batch. The cache still
//!   becomes `Built` (partial); a partially built cache beats no cache.
//! - **Cancellation**: switching to another user or deleting the cache cancels
//!   the in-flight build, which stops before its next batch.
//!
//! Builds run on a spawned tokio task. At most one is in flight; a request for
//! the user already being built is coalesced. Lookups are served from whatever
//! has been built so far.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::budget::CacheBudget;
use crate::core::cancel::{cancellation_pair, CancellationHandle, CancellationToken};
use crate::core::cipher::Cipher;
use crate::core::content::open_content;
use crate::core::error::DecryptError;
use crate::core::models::{CachedMessage, IndexEntry, UserId};
use crate::core::store::{BatchCursor, HandleLease, IndexHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Unbuilt,
    Building(UserId),
    Built { user_id: UserId, partial: bool },
}

/// What `start_build` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStart {
    /// Cache already built for this user; nothing was read.
    AlreadyBuilt,
    /// A build for this user is already running.
    Coalesced,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Unbuilt,
    Building,
    Built,
}

struct WorkingSet {
    user_id: Option<UserId>,
    state: BuildState,
    entries: HashMap<String, CachedMessage>,
    size_bytes: u64,
    /// Sticky until the next `clear`; a running build only ever sets it.
    partial: bool,
    /// Lowered byte limit left by `trim_to`.
    ceiling: Option<u64>,
    /// Oldest entry reached by the build.
    last_cached: Option<(String, i64)>,
}

impl WorkingSet {
    fn new() -> Self {
        WorkingSet {
            user_id: None,
            state: BuildState::Unbuilt,
            entries: HashMap::new(),
            size_bytes: 0,
            partial: false,
            ceiling: None,
            last_cached: None,
        }
    }

    fn is_current(&self, user_id: &UserId) -> bool {
        self.user_id.as_ref() == Some(user_id)
    }

    fn clear(&mut self) {
        *self = WorkingSet::new();
    }

    fn limit(&self, max_bytes: u64) -> u64 {
        self.ceiling.map_or(max_bytes, |ceiling| ceiling.min(max_bytes))
    }

    /// Insert or replace; `false` when the entry does not fit the budget.
    fn try_insert(&mut self, message: CachedMessage, max_bytes: u64) -> bool {
        let max_bytes = self.limit(max_bytes);
        let size = message.estimated_size();
        let replaced = self
            .entries
            .get(&message.message_id)
            .map_or(0, CachedMessage::estimated_size);
        if self.size_bytes - replaced + size > max_bytes {
            return false;
        }
        self.size_bytes = self.size_bytes - replaced + size;
        self.entries.insert(message.message_id.clone(), message);
        true
    }

    fn remove(&mut self, message_id: &str) -> bool {
        match self.entries.remove(message_id) {
            Some(old) => {
                self.size_bytes -= old.estimated_size();
                if self.last_cached.as_ref().is_some_and(|(id, _)| id == message_id) {
                    self.last_cached = self.oldest();
                }
                true
            }
            None => false,
        }
    }

    fn oldest(&self) -> Option<(String, i64)> {
        self.entries
            .values()
            .min_by(|a, b| a.time.cmp(&b.time).then_with(|| a.message_id.cmp(&b.message_id)))
            .map(|m| (m.message_id.clone(), m.time))
    }
}

struct InFlightBuild {
    user_id: UserId,
    cancel: CancellationHandle,
    task: JoinHandle<()>,
}

struct CacheInner {
    budget: CacheBudget,
    set: RwLock<WorkingSet>,
    status: watch::Sender<CacheStatus>,
    in_flight: Mutex<Option<InFlightBuild>>,
}

impl CacheInner {
    fn read(&self) -> RwLockReadGuard<'_, WorkingSet> {
        self.set.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorkingSet> {
        self.set.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-scoped search cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SearchCache {
    inner: Arc<CacheInner>,
}

impl SearchCache {
    pub fn new(budget: CacheBudget) -> Self {
        let (status, _) = watch::channel(CacheStatus::Unbuilt);
        SearchCache {
            inner: Arc::new(CacheInner {
                budget,
                set: RwLock::new(WorkingSet::new()),
                status,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.status.borrow().clone()
    }

    /// Completion signal: observe `Building` → `Built` transitions.
    pub fn subscribe(&self) -> watch::Receiver<CacheStatus> {
        self.inner.status.subscribe()
    }

    // -- build ---------------------------------------------------------------

    /// Start building the cache for `user_id` in the background.
    ///
    /// No-op when the cache is already built (or being built) for that user.
    /// A build for another user is cancelled and awaited first, then the
    /// working set is discarded.
    pub async fn start_build(
        &self,
        user_id: UserId,
        handle: IndexHandle,
        cipher: Arc<dyn Cipher>,
    ) -> BuildStart {
        let mut in_flight = self.inner.in_flight.lock().await;

        if self.is_built(&user_id) {
            log::debug!("Search cache already built for {user_id}");
            return BuildStart::AlreadyBuilt;
        }
        if let Some(build) = in_flight.as_ref() {
            if build.user_id == user_id && !build.task.is_finished() {
                log::debug!("Search cache build for {user_id} already running");
                return BuildStart::Coalesced;
            }
        }
        if let Some(previous) = in_flight.take() {
            Self::stop(previous).await;
        }

        {
            let mut set = self.inner.write();
            set.clear();
            set.user_id = Some(user_id.clone());
            set.state = BuildState::Building;
        }
        self.inner
            .status
            .send_replace(CacheStatus::Building(user_id.clone()));
        log::info!(
            "Building search cache for {} ({} entries per batch, {} byte budget)",
            user_id,
            self.inner.budget.batch_size_entries,
            self.inner.budget.max_cache_size_bytes
        );

        let (token, cancel) = cancellation_pair();
        let inner = Arc::clone(&self.inner);
        let build_user = user_id.clone();
        let lease = handle.lease();
        let task = tokio::spawn(run_build(inner, build_user, handle, lease, cipher, token));

        *in_flight = Some(InFlightBuild {
            user_id,
            cancel,
            task,
        });
        BuildStart::Started
    }

    /// Build the cache for `user_id` and wait for the build to finish.
    ///
    /// Build failures are not returned: the cache ends up `Built`, possibly
    /// partial. If the build is superseded by another user's, the returned
    /// reference reports `is_built() == false`.
    pub async fn build_for(
        &self,
        user_id: &UserId,
        handle: IndexHandle,
        cipher: Arc<dyn Cipher>,
    ) -> CacheRef {
        self.start_build(user_id.clone(), handle, cipher).await;
        self.wait_for_build(user_id).await;
        CacheRef {
            cache: self.clone(),
            user_id: user_id.clone(),
        }
    }

    /// Wait until no build for `user_id` is running. Returns whether the cache
    /// is built for that user.
    pub async fn wait_for_build(&self, user_id: &UserId) -> bool {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|status| !matches!(status, CacheStatus::Building(u) if u == user_id))
            .await;
        match settled {
            Ok(status) => {
                matches!(&*status, CacheStatus::Built { user_id: u, .. } if u == user_id)
            }
            Err(_) => false,
        }
    }

    async fn stop(build: InFlightBuild) {
        if !build.task.is_finished() {
            log::info!("Cancelling search cache build for {}", build.user_id);
        }
        build.cancel.cancel();
        if let Err(e) = build.task.await {
            log::error!("Search cache build for {} failed: {}", build.user_id, e);
        }
    }

    // -- teardown ------------------------------------------------------------

    /// Drop the cache of `user_id`. No-op unless `user_id` is the cached user.
    pub async fn delete_for(&self, user_id: &UserId) -> bool {
        let mut in_flight = self.inner.in_flight.lock().await;
        if !self.inner.read().is_current(user_id) {
            log::debug!("No search cache for {user_id} to delete");
            return false;
        }
        if let Some(build) = in_flight.take() {
            Self::stop(build).await;
        }
        self.inner.write().clear();
        self.inner.status.send_replace(CacheStatus::Unbuilt);
        log::info!("Deleted search cache of {user_id}");
        true
    }

    /// Drop the oldest entries until the working set fits in `max_bytes`.
    /// Hook for low-memory notifications; returns the number of evicted entries.
    ///
    /// `max_bytes` stays the limit until the cache is rebuilt, so a build in
    /// flight stops once it reaches it.
    pub fn trim_to(&self, max_bytes: u64) -> usize {
        let mut set = self.inner.write();
        let limit = set.limit(max_bytes);
        set.ceiling = Some(limit);
        if set.size_bytes <= limit {
            return 0;
        }
        let mut by_age: Vec<(i64, String)> = set
            .entries
            .values()
            .map(|m| (m.time, m.message_id.clone()))
            .collect();
        by_age.sort();

        let mut evicted = 0;
        for (_, message_id) in by_age {
            if set.size_bytes <= limit {
                break;
            }
            set.remove(&message_id);
            evicted += 1;
        }
        if evicted > 0 {
            set.partial = true;
            set.last_cached = set.oldest();
            log::info!(
                "Evicted {evicted} entries from search cache, {} bytes left",
                set.size_bytes
            );
        }
        evicted
    }

    // -- single-entry maintenance --------------------------------------------

    /// Remove one message from the working set. `false` if it was not cached.
    pub fn invalidate_entry(&self, user_id: &UserId, message_id: &str) -> bool {
        let mut set = self.inner.write();
        set.is_current(user_id) && set.remove(message_id)
    }

    /// Refresh (or add) one message without a rebuild. `false` when the cache
    /// belongs to another user, the entry cannot be decrypted or does not fit.
    pub fn update_entry(&self, user_id: &UserId, entry: &IndexEntry, cipher: &dyn Cipher) -> bool {
        let message = match decrypt_entry(entry, cipher) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Cannot refresh cached message {}: {}", entry.message_id, e);
                self.invalidate_entry(user_id, &entry.message_id);
                return false;
            }
        };

        let mut set = self.inner.write();
        if !set.is_current(user_id) || set.state == BuildState::Unbuilt {
            return false;
        }
        if set.try_insert(message, self.inner.budget.max_cache_size_bytes) {
            true
        } else {
            set.partial = true;
            false
        }
    }

    // -- queries -------------------------------------------------------------

    pub fn current_user(&self) -> Option<UserId> {
        self.inner.read().user_id.clone()
    }

    /// True once a build for `user_id` completed, including partial builds.
    pub fn is_built(&self, user_id: &UserId) -> bool {
        let set = self.inner.read();
        set.is_current(user_id) && set.state == BuildState::Built
    }

    pub fn is_partial(&self, user_id: &UserId) -> bool {
        let set = self.inner.read();
        set.is_current(user_id) && set.partial
    }

    pub fn len(&self, user_id: &UserId) -> usize {
        let set = self.inner.read();
        if set.is_current(user_id) {
            set.entries.len()
        } else {
            0
        }
    }

    pub fn is_empty(&self, user_id: &UserId) -> bool {
        self.len(user_id) == 0
    }

    pub fn size_bytes(&self, user_id: &UserId) -> u64 {
        let set = self.inner.read();
        if set.is_current(user_id) {
            set.size_bytes
        } else {
            0
        }
    }

    pub fn contains(&self, user_id: &UserId, message_id: &str) -> bool {
        let set = self.inner.read();
        set.is_current(user_id) && set.entries.contains_key(message_id)
    }

    pub fn get(&self, user_id: &UserId, message_id: &str) -> Option<CachedMessage> {
        let set = self.inner.read();
        if !set.is_current(user_id) {
            return None;
        }
        set.entries.get(message_id).cloned()
    }

    pub fn last_cached_id(&self, user_id: &UserId) -> Option<String> {
        let set = self.inner.read();
        if !set.is_current(user_id) {
            return None;
        }
        set.last_cached.as_ref().map(|(id, _)| id.clone())
    }

    pub fn last_cached_time(&self, user_id: &UserId) -> Option<i64> {
        let set = self.inner.read();
        if !set.is_current(user_id) {
            return None;
        }
        set.last_cached.as_ref().map(|(_, time)| *time)
    }

    /// Cached messages matching `predicate`, newest first.
    pub fn filter(
        &self,
        user_id: &UserId,
        predicate: impl Fn(&CachedMessage) -> bool,
    ) -> Vec<CachedMessage> {
        let set = self.inner.read();
        if !set.is_current(user_id) {
            return Vec::new();
        }
        let mut matches: Vec<CachedMessage> =
            set.entries.values().filter(|&m| predicate(m)).cloned().collect();
        matches.sort_by(|a, b| {
            b.time
                .cmp(&a.time)
                .then_with(|| b.message_id.cmp(&a.message_id))
        });
        matches
    }
}

/// View of the cache scoped to one user.
#[derive(Clone)]
pub struct CacheRef {
    cache: SearchCache,
    user_id: UserId,
}

impl CacheRef {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn is_built(&self) -> bool {
        self.cache.is_built(&self.user_id)
    }

    pub fn is_partial(&self) -> bool {
        self.cache.is_partial(&self.user_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len(&self.user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.cache.contains(&self.user_id, message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<CachedMessage> {
        self.cache.get(&self.user_id, message_id)
    }

    pub fn filter(&self, predicate: impl Fn(&CachedMessage) -> bool) -> Vec<CachedMessage> {
        self.cache.filter(&self.user_id, predicate)
    }
}

fn decrypt_entry(entry: &IndexEntry, cipher: &dyn Cipher) -> Result<CachedMessage, DecryptError> {
    if !entry.has_body() || entry.decryption_failed {
        return Ok(CachedMessage::from_entry(entry, None));
    }
    let body = open_content(entry, cipher)?;
    Ok(CachedMessage::from_entry(entry, Some(body)))
}

async fn run_build(
    inner: Arc<CacheInner>,
    user_id: UserId,
    handle: IndexHandle,
    lease: HandleLease,
    cipher: Arc<dyn Cipher>,
    token: CancellationToken,
) {
    let batch_size = inner.budget.batch_size_entries;
    let max_bytes = inner.budget.max_cache_size_bytes;
    let mut cursor: Option<BatchCursor> = None;
    let mut batches = 0u32;
    let mut skipped = 0usize;

    let stopped_early = loop {
        if token.is_cancelled() {
            log::info!("Search cache build for {user_id} cancelled after {batches} batches");
            return;
        }

        let batch = match handle.load_batch(cursor.clone(), batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Search cache build for {user_id} stopped, cannot read batch: {e}");
                break true;
            }
        };
        if batch.is_empty() {
            break false;
        }
        let fetched = batch.len();
        cursor = batch.last().map(BatchCursor::after);

        let mut decrypted = Vec::with_capacity(fetched);
        let mut failed = Vec::new();
        for entry in &batch {
            match decrypt_entry(entry, cipher.as_ref()) {
                Ok(message) => decrypted.push(message),
                Err(e) => {
                    log::warn!("Skipping message {} in search cache: {}", entry.message_id, e);
                    failed.push(entry.message_id.clone());
                }
            }
        }
        for message_id in &failed {
            if let Err(e) = handle.mark_decryption_failed(message_id).await {
                log::warn!("Cannot flag {message_id} as undecryptable: {e}");
            }
        }
        skipped += failed.len();

        if decrypted.is_empty() {
            log::warn!(
                "Search cache build for {user_id} stopped, no entry of batch {} could be decrypted",
                batches + 1
            );
            break true;
        }

        let full = {
            let mut set = inner.write();
            if token.is_cancelled() {
                return;
            }
            let mut full = false;
            for message in decrypted {
                let position = (message.message_id.clone(), message.time);
                if !set.try_insert(message, max_bytes) {
                    full = true;
                    break;
                }
                set.last_cached = Some(position);
            }
            full
        };
        batches += 1;

        if full {
            log::info!(
                "Search cache for {user_id} reached its {} byte budget",
                inner.read().limit(max_bytes)
            );
            break true;
        }
        if fetched < batch_size as usize {
            break false;
        }
    };

    // Built implies the index is no longer being read.
    drop(lease);

    let partial = {
        let mut set = inner.write();
        if token.is_cancelled() {
            return;
        }
        set.state = BuildState::Built;
        set.partial |= stopped_early || skipped > 0;
        let partial = set.partial;
        log::info!(
            "Search cache built for {}: {} entries, {} bytes, {} batches, {} skipped{}",
            user_id,
            set.entries.len(),
            set.size_bytes,
            batches,
            skipped,
            if partial { " (partial)" } else { "" }
        );
        partial
    };
    inner.status.send_replace(CacheStatus::Built { user_id, partial });
}
