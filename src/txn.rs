//! Per-writer transaction intent log: the copy-on-write staging area for
//! pages a single writer transaction has touched, flushed sequentially on
//! commit.

use crate::cache::BufferPool;
use crate::page::leaf::KeyValueLeafPage;
use crate::page::reference::{CacheKey, PageReference};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// The pre-modification snapshot (`complete`) paired with the working copy
/// a writer is mutating (`modified`). They are the same `Arc` when a page
/// has not diverged from what a reader would see.
#[derive(Clone)]
pub struct PageContainer {
    pub complete: Arc<KeyValueLeafPage>,
    pub modified: Arc<KeyValueLeafPage>,
}

impl PageContainer {
    pub fn unmodified(page: Arc<KeyValueLeafPage>) -> PageContainer {
        PageContainer {
            complete: page.clone(),
            modified: page,
        }
    }

    fn is_modified_distinct(&self) -> bool {
        !Arc::ptr_eq(&self.complete, &self.modified)
    }
}

struct Inner {
    entries: HashMap<i32, PageContainer>,
    /// `log_key -> CacheKey` so `put` can evict the buffer pool's copy
    /// before handing the page to this log, enforcing single ownership.
    keys_by_log: HashMap<i32, CacheKey>,
}

/// A per-writer, single-owner staging map. Exactly one of {buffer pool,
/// intent log, a writer's "most recent" slot} may own a given page at a
/// time; `put` enforces this by removing the page from the buffer pool
/// first.
pub struct TransactionIntentLog {
    next_log_key: AtomicI32,
    inner: Mutex<Inner>,
    pool: Arc<BufferPool>,
}

impl TransactionIntentLog {
    pub fn new(pool: Arc<BufferPool>) -> TransactionIntentLog {
        TransactionIntentLog {
            next_log_key: AtomicI32::new(0),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                keys_by_log: HashMap::new(),
            }),
            pool,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages `container` under a fresh `log_key`, stamping `reference`
    /// with it, and removes `cache_key` from the buffer pool first so the
    /// intent log becomes the page's sole owner.
    pub fn put(&self, reference: &PageReference, cache_key: CacheKey, container: PageContainer) -> i32 {
        self.pool.remove(&cache_key);
        let log_key = self.next_log_key.fetch_add(1, Ordering::AcqRel);
        reference.set_log_key(log_key);
        let mut inner = self.inner.lock();
        inner.entries.insert(log_key, container);
        inner.keys_by_log.insert(log_key, cache_key);
        log_key
    }

    /// Fast, index-only lookup via the reference's `log_key`.
    pub fn get(&self, reference: &PageReference) -> Option<PageContainer> {
        let log_key = reference.log_key();
        if log_key < 0 {
            return None;
        }
        self.inner.lock().entries.get(&log_key).cloned()
    }

    /// Drops every entry without closing the pages: used on commit, after
    /// pages have already been serialized and the caller intends to hand
    /// them back to the buffer pool under their post-commit identity.
    pub fn clear_without_closing(&self) {
        self.inner.lock().entries.clear();
        self.inner.lock().keys_by_log.clear();
    }

    /// Called after a successful commit: `complete` snapshots are private
    /// to this writer (never shared with the buffer pool) and always safe
    /// to close; `modified` pages have already been handed to the buffer
    /// pool under their post-commit identity and must not be closed here,
    /// the pool is now their sole owner.
    pub fn close_after_commit(&self) {
        let mut inner = self.inner.lock();
        for (_, container) in inner.entries.drain() {
            container.complete.close_leaf();
        }
        inner.keys_by_log.clear();
    }

    /// Closes every staged page (skipping `modified` when it is the same
    /// page as `complete`, to avoid a double-close) and drops all
    /// entries. Called on both commit (after serialization) and rollback.
    ///
    /// Any asynchronous cache-cleanup this writer's pages were involved in
    /// must have already drained by the time this returns, so a delayed
    /// eviction listener cannot race this close.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        for (_, container) in inner.entries.drain() {
            let distinct = container.is_modified_distinct();
            container.complete.close_leaf();
            if distinct {
                container.modified.close_leaf();
            }
        }
        inner.keys_by_log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAllocator;
    use crate::page::IndexType;

    fn leaf(alloc: &Arc<SlabAllocator>, key: i64) -> Arc<KeyValueLeafPage> {
        KeyValueLeafPage::new(alloc.clone(), key, 0, IndexType::Document, false).unwrap()
    }

    #[test]
    fn put_assigns_monotonic_log_keys() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(4);
        let log = TransactionIntentLog::new(pool);
        let r1 = PageReference::new(1, 1, -1);
        let r2 = PageReference::new(1, 1, -1);
        let k1 = log.put(&r1, CacheKey::new(1, 1, 1, 0), PageContainer::unmodified(leaf(&alloc, 1)));
        let k2 = log.put(&r2, CacheKey::new(1, 1, 2, 0), PageContainer::unmodified(leaf(&alloc, 2)));
        assert_eq!(k2, k1 + 1);
        assert_eq!(r1.log_key(), k1);
    }

    #[test]
    fn put_removes_page_from_buffer_pool_first() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(4);
        let cache_key = CacheKey::new(1, 1, 1, 0);
        pool.put(cache_key, leaf(&alloc, 1));
        let log = TransactionIntentLog::new(pool.clone());
        let r = PageReference::new(1, 1, -1);
        log.put(&r, cache_key, PageContainer::unmodified(leaf(&alloc, 1)));
        assert!(pool.get_and_guard(&cache_key).is_none());
    }

    #[test]
    fn close_skips_double_close_when_unmodified() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(4);
        let log = TransactionIntentLog::new(pool);
        let r = PageReference::new(1, 1, -1);
        let page = leaf(&alloc, 1);
        log.put(&r, CacheKey::new(1, 1, 1, 0), PageContainer::unmodified(page.clone()));
        log.close();
        assert!(page.header().is_closed());
        // closing an already-closed page is a no-op, not a panic
        assert!(!page.close_leaf());
    }
}
