//! Sharded buffer pool with clock-sweep eviction.
//!
//! N shards, each a plain `HashMap` behind one `parking_lot::Mutex`. The
//! per-shard mutex *is* the "per-key lock" the design notes require: since
//! a key always hashes to the same shard, holding the shard lock for the
//! duration of a lookup-and-guard (or a sweep candidate's check-and-evict)
//! serializes exactly the operations that must not interleave. The
//! tradeoff against a per-key lock is coarser blocking within one shard,
//! which is why the shard count is tunable.

pub mod guard;
pub mod sweeper;

use crate::metrics;
use crate::page::leaf::KeyValueLeafPage;
use crate::page::reference::CacheKey;
use guard::PageGuard;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct ShardInner {
    map: HashMap<CacheKey, Arc<KeyValueLeafPage>>,
    clock_hand: usize,
}

struct Shard {
    inner: Mutex<ShardInner>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub scanned: usize,
    pub evicted: usize,
}

pub struct BufferPool {
    shards: Vec<Shard>,
}

fn shard_index(key: &CacheKey, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

impl BufferPool {
    pub fn new(shard_count: usize) -> Arc<BufferPool> {
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: Mutex::new(ShardInner {
                    map: HashMap::new(),
                    clock_hand: 0,
                }),
            })
            .collect();
        Arc::new(BufferPool { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &CacheKey) -> &Shard {
        &self.shards[shard_index(key, self.shards.len())]
    }

    /// The single atomic lookup-and-pin primitive every read path is
    /// built on: under the shard lock, look the key up, reject it if
    /// absent or already closed, mark it hot, and hand back a guard
    /// already carrying the incremented refcount. There is no separate
    /// "get" a caller could race against a sweeper between looking and
    /// pinning.
    pub fn get_and_guard(&self, key: &CacheKey) -> Option<PageGuard> {
        let shard = self.shard_for(key);
        let shard_idx = shard_index(key, self.shards.len());
        let inner = shard.inner.lock();
        let page = inner.map.get(key)?;
        if page.header().is_closed() {
            return None;
        }
        page.acquire_guard();
        let guard = PageGuard::from_acquired(page.clone());
        drop(inner);
        metrics::CACHE_HITS
            .with_label_values(&[&shard_idx.to_string()])
            .inc();
        Some(guard)
    }

    pub fn record_miss(&self, key: &CacheKey) {
        let shard_idx = shard_index(key, self.shards.len());
        metrics::CACHE_MISSES
            .with_label_values(&[&shard_idx.to_string()])
            .inc();
    }

    /// Marks `page` hot *before* inserting it, so a concurrent sweeper
    /// scanning this shard cannot observe it cold in the window between
    /// insertion and the hot-bit being set.
    pub fn put(&self, key: CacheKey, page: Arc<KeyValueLeafPage>) {
        page.header().mark_hot();
        let shard = self.shard_for(&key);
        let mut inner = shard.inner.lock();
        inner.map.insert(key, page);
    }

    /// Returns the page that ended up resident: `page` if this call won
    /// the race, the existing resident otherwise. The loser is the
    /// caller's responsibility to close.
    pub fn put_if_absent(&self, key: CacheKey, page: Arc<KeyValueLeafPage>) -> Arc<KeyValueLeafPage> {
        page.header().mark_hot();
        let shard = self.shard_for(&key);
        let mut inner = shard.inner.lock();
        inner.map.entry(key).or_insert(page).clone()
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<KeyValueLeafPage>> {
        let shard = self.shard_for(key);
        let mut inner = shard.inner.lock();
        inner.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.inner.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One clock-sweep pass over `shard_index`, evicting pages that are
    /// cold, unguarded, and no longer needed by any live reader.
    ///
    /// Runs entirely under the shard lock: the same critical section used
    /// by `get_and_guard`, so a reader that has already observed the page
    /// through `get_and_guard` cannot race this sweep into resetting a
    /// page out from under it.
    pub fn sweep_shard(&self, shard_index: usize, min_active_revision: i32) -> SweepOutcome {
        let shard = &self.shards[shard_index];
        let mut inner = shard.inner.lock();
        let size = inner.map.len();
        if size == 0 {
            return SweepOutcome::default();
        }
        let scan_count = (size / 10).max(10).min(size);
        let keys: Vec<CacheKey> = inner.map.keys().copied().collect();

        let mut scanned = 0;
        let mut evicted = 0;
        let mut to_remove = Vec::new();

        for _ in 0..scan_count {
            let current_size = keys.len();
            if current_size == 0 {
                break;
            }
            let idx = inner.clock_hand % current_size;
            inner.clock_hand = (inner.clock_hand + 1) % current_size;
            let key = keys[idx];
            let Some(page) = inner.map.get(&key) else {
                continue;
            };
            scanned += 1;

            if page.header().clear_hot() {
                continue;
            }
            if page.header().guard_count() > 0 {
                continue;
            }
            if page.revision() >= min_active_revision {
                continue;
            }
            page.header().bump_version();
            page.reset_leaf();
            to_remove.push(key);
            evicted += 1;
        }

        for key in to_remove {
            inner.map.remove(&key);
        }

        SweepOutcome { scanned, evicted }
    }

    /// Iterates a snapshot (never the live map) closing every unguarded
    /// page, then bulk-clears the shard. Guarded pages survive and are
    /// closed later by whoever holds their guard.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut inner = shard.inner.lock();
            let snapshot: Vec<(CacheKey, Arc<KeyValueLeafPage>)> =
                inner.map.iter().map(|(k, v)| (*k, v.clone())).collect();
            for (_, page) in &snapshot {
                if page.header().guard_count() == 0 {
                    page.close_leaf();
                }
            }
            inner.map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAllocator;
    use crate::page::IndexType;

    fn leaf(alloc: &Arc<SlabAllocator>, key: i64, rev: i32) -> Arc<KeyValueLeafPage> {
        KeyValueLeafPage::new(alloc.clone(), key, rev, IndexType::Document, false).unwrap()
    }

    #[test]
    fn get_and_guard_round_trip() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(4);
        let key = CacheKey::new(1, 1, 7, 0);
        pool.put(key, leaf(&alloc, 7, 0));
        let guard = pool.get_and_guard(&key).unwrap();
        assert_eq!(guard.record_page_key(), 7);
    }

    #[test]
    fn absent_key_returns_none() {
        let pool = BufferPool::new(4);
        assert!(pool.get_and_guard(&CacheKey::new(1, 1, 9, 0)).is_none());
    }

    #[test]
    fn eviction_respects_min_active_revision() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(1);
        let key = CacheKey::new(1, 1, 7, 5);
        pool.put(key, leaf(&alloc, 7, 5));
        // first pass clears the HOT bit set by `put`, second pass evicts
        pool.sweep_shard(0, 6);
        let outcome = pool.sweep_shard(0, 6);
        assert_eq!(outcome.evicted, 1);
        assert!(pool.get_and_guard(&key).is_none());
    }

    #[test]
    fn guard_prevents_eviction() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(1);
        let key = CacheKey::new(1, 1, 7, 5);
        pool.put(key, leaf(&alloc, 7, 5));
        let guard = pool.get_and_guard(&key).unwrap();
        pool.sweep_shard(0, 6);
        let outcome = pool.sweep_shard(0, 6);
        assert_eq!(outcome.evicted, 0);
        drop(guard);
    }

    #[test]
    fn clear_closes_unguarded_pages() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let pool = BufferPool::new(2);
        pool.put(CacheKey::new(1, 1, 1, 0), leaf(&alloc, 1, 0));
        pool.put(CacheKey::new(1, 1, 2, 0), leaf(&alloc, 2, 0));
        pool.clear();
        assert_eq!(pool.len(), 0);
    }
}
