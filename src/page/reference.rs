//! The composite, MVCC-safe handle a page is addressed by.

use crate::page::leaf::KeyValueLeafPage;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

pub const NULL_ID: i64 = -1;
pub const UNSET_LOG_KEY: i32 = -1;

/// `(database_id, resource_id, page_key, log_key)` identifies a page
/// uniquely across the process. Equality and hashing deliberately exclude
/// the resident page pointer (incidental) and the revision (the source's
/// own hashing excludes it — see [`CacheKey`] for the revision-aware
/// wrapper caches spanning revisions must use instead).
pub struct PageReference {
    pub database_id: u64,
    pub resource_id: u64,
    page_key: AtomicI64,
    log_key: AtomicI32,
    guard_count: AtomicI32,
    page: RwLock<Option<Arc<KeyValueLeafPage>>>,
}

impl std::fmt::Debug for PageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReference")
            .field("database_id", &self.database_id)
            .field("resource_id", &self.resource_id)
            .field("page_key", &self.page_key.load(Ordering::Relaxed))
            .field("log_key", &self.log_key.load(Ordering::Relaxed))
            .finish()
    }
}

impl PageReference {
    pub fn new(database_id: u64, resource_id: u64, page_key: i64) -> PageReference {
        PageReference {
            database_id,
            resource_id,
            page_key: AtomicI64::new(page_key),
            log_key: AtomicI32::new(UNSET_LOG_KEY),
            guard_count: AtomicI32::new(0),
            page: RwLock::new(None),
        }
    }

    pub fn unpersisted(database_id: u64, resource_id: u64) -> PageReference {
        PageReference::new(database_id, resource_id, NULL_ID)
    }

    pub fn page_key(&self) -> i64 {
        self.page_key.load(Ordering::Acquire)
    }

    pub fn set_page_key(&self, key: i64) {
        self.page_key.store(key, Ordering::Release);
    }

    pub fn log_key(&self) -> i32 {
        self.log_key.load(Ordering::Acquire)
    }

    pub fn set_log_key(&self, key: i32) {
        self.log_key.store(key, Ordering::Release);
    }

    pub fn guard_count(&self) -> i32 {
        self.guard_count.load(Ordering::Acquire)
    }

    pub fn acquire_guard(&self) {
        self.guard_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_guard(&self) {
        self.guard_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Swizzles the in-memory pointer. Callers must hold the per-key lock
    /// that guards this reference's shard entry (see `cache::Shard`); the
    /// sweeper is the only other mutator and observes the same discipline.
    pub fn set_page(&self, page: Option<Arc<KeyValueLeafPage>>) {
        *self.page.write().unwrap() = page;
    }

    pub fn get_page(&self) -> Option<Arc<KeyValueLeafPage>> {
        self.page.read().unwrap().clone()
    }

    /// Fixes up database/resource identity after deserializing a bare
    /// `page_key` from disk, the way a relation OID plus a block number
    /// forms a full buffer tag in more conventional storage engines.
    pub fn fixup_identity(&mut self, database_id: u64, resource_id: u64) {
        self.database_id = database_id;
        self.resource_id = resource_id;
    }

    fn identity(&self) -> (u64, u64, i64, i32) {
        (
            self.database_id,
            self.resource_id,
            self.page_key(),
            self.log_key(),
        )
    }
}

impl PartialEq for PageReference {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for PageReference {}

impl std::hash::Hash for PageReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl Clone for PageReference {
    /// Clones identity only; a fresh reference never inherits the
    /// original's guard count or swizzled pointer (a clone is how the
    /// trie writer copy-on-writes an indirect page's slot, not how a
    /// pin is shared).
    fn clone(&self) -> Self {
        PageReference::new(self.database_id, self.resource_id, self.page_key())
    }
}

/// Cache key for structures that span revisions, where a bare
/// `PageReference`'s identity can alias two different materialized pages
/// (see the open question in the design notes: the source's own hashing
/// excludes revision, which is only safe for caches with a single-revision
/// lifetime). The page-pool proper keys by this, not by `PageReference`
/// alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub database_id: u64,
    pub resource_id: u64,
    pub record_page_key: i64,
    pub revision: i32,
}

impl CacheKey {
    pub fn new(database_id: u64, resource_id: u64, record_page_key: i64, revision: i32) -> Self {
        CacheKey {
            database_id,
            resource_id,
            record_page_key,
            revision,
        }
    }

    pub fn from_reference(reference: &PageReference, record_page_key: i64, revision: i32) -> Self {
        CacheKey::new(
            reference.database_id,
            reference.resource_id,
            record_page_key,
            revision,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_resident_page() {
        let a = PageReference::new(1, 2, 10);
        let b = PageReference::new(1, 2, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn equality_distinguishes_page_key() {
        let a = PageReference::new(1, 2, 10);
        let b = PageReference::new(1, 2, 11);
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_distinguishes_revision() {
        let a = CacheKey::new(1, 2, 10, 5);
        let b = CacheKey::new(1, 2, 10, 6);
        assert_ne!(a, b);
    }
}
