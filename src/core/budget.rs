//! Memory budget of the search cache.
//!
//! Computed once, when the cache is constructed, from the host's total memory.
//! The budget is not revisited under memory pressure; hosts that receive
//! low-memory notifications call `SearchCache::trim_to` instead.

use crate::core::error::SizeQueryError;

/// Fraction of total memory the cache may occupy.
pub const DEFAULT_HEAP_FRACTION: f64 = 0.2;

/// Conservative in-memory size of one decrypted entry, in bytes.
pub const DEFAULT_ENTRY_SIZE: u64 = 14_000;

/// Used when the host cannot report its memory size.
const FALLBACK_TOTAL_MEMORY: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    pub max_cache_size_bytes: u64,
    pub batch_size_entries: u32,
}

impl CacheBudget {
    pub fn new(max_cache_size_bytes: u64, batch_size_entries: u32) -> Self {
        CacheBudget {
            max_cache_size_bytes,
            batch_size_entries: batch_size_entries.max(1),
        }
    }

    /// `max = floor(total * fraction)`, `batch = floor(total * fraction / entry_size)`.
    pub fn from_memory(total_memory: u64, heap_fraction: f64, entry_size: u64) -> Self {
        let allowed = total_memory as f64 * heap_fraction;
        let batch = (allowed / entry_size.max(1) as f64).floor();
        CacheBudget::new(
            allowed.floor() as u64,
            batch.min(u32::MAX as f64) as u32,
        )
    }

    /// Budget for the current host. Falls back to 1 GiB of assumed memory
    /// when the host cannot be queried.
    pub fn detect(heap_fraction: f64, entry_size: u64) -> Self {
        let total = match total_memory() {
            Ok(total) => total,
            Err(e) => {
                log::warn!("{e}, assuming {FALLBACK_TOTAL_MEMORY} bytes");
                FALLBACK_TOTAL_MEMORY
            }
        };
        let budget = CacheBudget::from_memory(total, heap_fraction, entry_size);
        log::info!(
            "Search cache budget: {} bytes, {} entries per batch ({} bytes of memory)",
            budget.max_cache_size_bytes,
            budget.batch_size_entries,
            total
        );
        budget
    }
}

/// Total physical memory of the host, in bytes.
#[cfg(unix)]
pub fn total_memory() -> Result<u64, SizeQueryError> {
    // SAFETY: sysconf only reads system configuration values.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return Err(SizeQueryError::MemoryUnavailable);
    }
    Ok(pages as u64 * page_size as u64)
}

#[cfg(not(unix))]
pub fn total_memory() -> Result<u64, SizeQueryError> {
    Err(SizeQueryError::MemoryUnavailable)
}
