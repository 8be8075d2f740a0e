//! On-device encrypted search index and bounded in-memory search cache for
//! the nevermail mail client.

pub mod config;
pub mod core;

pub use crate::config::SearchConfig;
pub use crate::core::budget::CacheBudget;
pub use crate::core::cache::{BuildStart, CacheRef, CacheStatus, SearchCache};
pub use crate::core::cipher::{AesGcmCipher, Cipher};
pub use crate::core::error::{
    DecryptError, DeleteError, EncryptError, InsertError, SizeQueryError, StoreError,
};
pub use crate::core::lifecycle::IndexLifecycle;
pub use crate::core::models::{CachedMessage, EntryContent, IndexEntry, IndexStats, UserId};
pub use crate::core::service::SearchService;
pub use crate::core::store::IndexHandle;
