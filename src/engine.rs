//! Storage engine reader/writer façade: the top-level binding of the slab
//! allocator, buffer pool, epoch tracker, indirect-page trie, versioning
//! combiner, and transaction intent log into the read/write dataflow
//! spec.md §2 describes.
//!
//! Persistent file I/O layout is explicitly out of this specification's
//! scope beyond what fragment reconstruction requires (spec.md §1's
//! Non-goals), so this module depends only on the [`FragmentStore`]
//! contract: "write these bytes, get an offset back" / "read the bytes at
//! this offset". [`InMemoryFragmentStore`] is the test/benchmark
//! implementation; a real deployment substitutes one backed by the
//! data-file layout spec.md §6 describes, behind the same trait.

use crate::alloc::SlabAllocator;
use crate::cache::guard::PageGuard;
use crate::cache::BufferPool;
use crate::combiner;
use crate::config::StorageConfig;
use crate::epoch::{RevisionEpochTracker, Ticket};
use crate::errors::TxnError;
use crate::metrics;
use crate::page::format;
use crate::page::leaf::KeyValueLeafPage;
use crate::page::reference::{CacheKey, PageReference};
use crate::page::IndexType;
use crate::trie::{IndirectPage, TrieWriter};
use crate::txn::{PageContainer, TransactionIntentLog};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The black-box fragment persistence contract. Fragments for one
/// `(resource_id, record_page_key)` form a chain; `write_fragment` returns
/// the `page_key` offset future reads address it by, mirroring how a
/// relation block number addresses a page in more conventional engines.
pub trait FragmentStore: Send + Sync {
    fn write_fragment(&self, resource_id: u64, record_page_key: i64, bytes: &[u8]) -> i64;
    fn read_fragment(&self, page_key: i64) -> Vec<u8>;
}

/// Keeps every fragment resident in memory, keyed by the offset handed
/// back from `write_fragment`. Exercises the same read/combine dataflow a
/// disk-backed store would, without this specification's out-of-scope
/// file-layout details.
#[derive(Default)]
pub struct InMemoryFragmentStore {
    next_offset: AtomicI64,
    fragments: Mutex<HashMap<i64, Vec<u8>>>,
}

impl InMemoryFragmentStore {
    pub fn new() -> Arc<InMemoryFragmentStore> {
        Arc::new(InMemoryFragmentStore {
            next_offset: AtomicI64::new(0),
            fragments: Mutex::new(HashMap::new()),
        })
    }
}

impl FragmentStore for InMemoryFragmentStore {
    fn write_fragment(&self, _resource_id: u64, _record_page_key: i64, bytes: &[u8]) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        self.fragments.lock().insert(offset, bytes.to_vec());
        offset
    }

    fn read_fragment(&self, page_key: i64) -> Vec<u8> {
        self.fragments
            .lock()
            .get(&page_key)
            .cloned()
            .unwrap_or_else(|| panic!("no fragment resident at offset {page_key}"))
    }
}

/// One fragment's identity in a record page's chain: the revision it was
/// written at and the offset `FragmentStore` addresses it by.
#[derive(Debug, Clone, Copy)]
struct FragmentEntry {
    revision: i32,
    page_key: i64,
}

/// Per-resource state: the revision roots committed so far, the fragment
/// chains backing every record page key, and the single-writer flag spec.md
/// §5 requires ("exactly one writer per resource, enforced by a
/// resource-scoped mutex held for the duration of the write transaction").
struct ResourceState {
    database_id: u64,
    resource_id: u64,
    index_type: IndexType,
    dewey_ids_stored: bool,
    current_revision: AtomicI32,
    revision_roots: Mutex<HashMap<i32, Arc<IndirectPage>>>,
    fragment_chains: Mutex<HashMap<i64, Vec<FragmentEntry>>>,
    writer_active: AtomicBool,
}

/// A process-wide storage engine instance: one [`SlabAllocator`], one
/// [`BufferPool`], one [`RevisionEpochTracker`], shared by every open
/// resource (spec.md §6: "a single global buffer-pool instance serves all
/// databases in the process").
pub struct StorageEngine<S: FragmentStore> {
    alloc: Arc<SlabAllocator>,
    pool: Arc<BufferPool>,
    epoch: Arc<RevisionEpochTracker>,
    config: StorageConfig,
    store: Arc<S>,
    resources: Mutex<HashMap<u64, Arc<ResourceState>>>,
    next_txn_id: AtomicI32,
}

impl<S: FragmentStore> StorageEngine<S> {
    pub fn new(config: StorageConfig, store: Arc<S>) -> Arc<StorageEngine<S>> {
        let alloc = SlabAllocator::new(config.region_size, config.max_buffer_size);
        let pool = BufferPool::new(config.shard_count);
        let epoch = RevisionEpochTracker::new(config.epoch_slots);
        Arc::new(StorageEngine {
            alloc,
            pool,
            epoch,
            config,
            store,
            resources: Mutex::new(HashMap::new()),
            next_txn_id: AtomicI32::new(0),
        })
    }

    pub fn allocator(&self) -> &Arc<SlabAllocator> {
        &self.alloc
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn epoch_tracker(&self) -> &Arc<RevisionEpochTracker> {
        &self.epoch
    }

    /// Opens (creating on first call) the resource identified by
    /// `resource_id`, with an empty record-page-key-0 leaf wired at
    /// revision 0. Database/resource IDs are process-local identities
    /// here; persisting them into configuration files on first open is a
    /// concern of the external resource-configuration layer this core
    /// does not own (spec.md §6).
    pub fn open_resource(
        self: &Arc<Self>,
        database_id: u64,
        resource_id: u64,
        index_type: IndexType,
    ) -> Arc<ResourceHandle<S>> {
        let mut resources = self.resources.lock();
        let state = resources
            .entry(resource_id)
            .or_insert_with(|| {
                let bootstrap = TrieWriter::new(self.alloc.clone(), self.config.dewey_ids_stored, -1);
                let (root, _leaf_ref) = bootstrap.create_tree(database_id, resource_id, index_type);
                let mut revision_roots = HashMap::new();
                revision_roots.insert(0, root);
                Arc::new(ResourceState {
                    database_id,
                    resource_id,
                    index_type,
                    dewey_ids_stored: self.config.dewey_ids_stored,
                    current_revision: AtomicI32::new(0),
                    revision_roots: Mutex::new(revision_roots),
                    fragment_chains: Mutex::new(HashMap::new()),
                    writer_active: AtomicBool::new(false),
                })
            })
            .clone();
        Arc::new(ResourceHandle {
            engine: self.clone(),
            state,
        })
    }
}

/// A handle to one open resource, bound to the engine instance that owns
/// its pages. Reader/writer transactions are opened from here.
pub struct ResourceHandle<S: FragmentStore> {
    engine: Arc<StorageEngine<S>>,
    state: Arc<ResourceState>,
}

impl<S: FragmentStore> ResourceHandle<S> {
    pub fn current_revision(&self) -> i32 {
        self.state.current_revision.load(Ordering::Acquire)
    }

    /// Pins the resource's current revision and returns a reader bound to
    /// it; later commits do not change what this reader observes.
    pub fn begin_read(self: &Arc<Self>) -> Result<ReadTransaction<S>, TxnError> {
        let revision = self.current_revision();
        let ticket = self.engine.epoch.register(revision)?;
        Ok(ReadTransaction {
            handle: self.clone(),
            revision,
            _ticket: ticket,
        })
    }

    /// Opens the resource's single writer transaction. Fails if another
    /// writer transaction on this resource is already open — spec.md §5's
    /// "exactly one writer per resource" invariant.
    pub fn begin_write(self: &Arc<Self>) -> Result<WriteTransaction<S>, TxnError> {
        if self
            .state
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TxnError::WriterBusy(self.state.resource_id));
        }
        let base_revision = self.current_revision();
        let new_revision = base_revision + 1;
        let ticket = match self.engine.epoch.register(base_revision) {
            Ok(t) => t,
            Err(e) => {
                self.state.writer_active.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let txn_id = self.engine.next_txn_id.fetch_add(1, Ordering::AcqRel);
        let root = self
            .state
            .revision_roots
            .lock()
            .get(&base_revision)
            .expect("base revision must have a committed root")
            .clone();
        Ok(WriteTransaction {
            handle: self.clone(),
            base_revision,
            new_revision,
            txn_id,
            trie: TrieWriter::new(self.engine.alloc.clone(), self.state.dewey_ids_stored, txn_id),
            root: Mutex::new(root),
            log: TransactionIntentLog::new(self.engine.pool.clone()),
            staged: Mutex::new(Vec::new()),
            _ticket: ticket,
            finished: AtomicBool::new(false),
        })
    }

    /// Loads (from cache or, on miss, from the fragment chain via the
    /// configured [`combiner`] strategy) the record page materialized at
    /// `revision`, installs it in the buffer pool, and returns a guarded
    /// handle. Returns `None` if the record page key has never been
    /// written as of `revision`.
    ///
    /// The pin is always taken through [`BufferPool::get_and_guard`], even
    /// on the load path — after installing a freshly combined page with
    /// `put_if_absent`, this re-reads whoever ended up resident through
    /// the shard lock rather than pinning the just-built `Arc` directly, so
    /// acquisition and "is this page still the live resident" are decided
    /// atomically under the same lock a concurrent sweep would take.
    fn get_and_guard_or_load(&self, record_page_key: i64, revision: i32) -> Option<PageGuard> {
        let cache_key = CacheKey::new(
            self.state.database_id,
            self.state.resource_id,
            record_page_key,
            revision,
        );
        if let Some(guard) = self.engine.pool.get_and_guard(&cache_key) {
            return Some(guard);
        }
        self.engine.pool.record_miss(&cache_key);

        let chain: Vec<FragmentEntry> = {
            let chains = self.state.fragment_chains.lock();
            chains
                .get(&record_page_key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.revision <= revision)
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        if chain.is_empty() {
            return None;
        }

        let fragments: Vec<Arc<KeyValueLeafPage>> = chain
            .iter()
            .map(|entry| {
                let bytes = self.engine.store.read_fragment(entry.page_key);
                format::deserialize(&self.engine.alloc, &bytes, self.state.dewey_ids_stored)
                    .expect("fragment bytes must round-trip the on-disk format")
            })
            .collect();

        let combined = combiner::combine(
            &self.engine.alloc,
            self.engine.config.versioning,
            self.engine.config.sliding_window,
            &fragments,
            revision,
            self.state.dewey_ids_stored,
        );
        let winner = self.engine.pool.put_if_absent(cache_key, combined.clone());
        if !Arc::ptr_eq(&winner, &combined) {
            // Lost the race to install: the loser closes its own
            // candidate and defers to whoever won.
            combined.close_leaf();
        }
        // `winner` may have already been evicted by a sweep that ran
        // between `put_if_absent` and here; in that rare case retry the
        // whole load rather than hand back a pin acquired outside the
        // shard lock.
        self.engine
            .pool
            .get_and_guard(&cache_key)
            .or_else(|| self.get_and_guard_or_load(record_page_key, revision))
    }
}

/// A read-only view of a resource pinned at one revision.
pub struct ReadTransaction<S: FragmentStore> {
    handle: Arc<ResourceHandle<S>>,
    revision: i32,
    _ticket: Ticket,
}

impl<S: FragmentStore> ReadTransaction<S> {
    pub fn revision(&self) -> i32 {
        self.revision
    }

    /// Reads one slot of one record page at this transaction's pinned
    /// revision. Returns `None` if the record page was never written, or
    /// the slot within it is unset.
    pub fn get_record(&self, record_page_key: i64, slot: usize) -> Option<Vec<u8>> {
        let guard = self
            .handle
            .get_and_guard_or_load(record_page_key, self.revision)?;
        guard.get_slot(slot).map(|view| view.to_vec())
    }
}

/// The single writer transaction for one resource. Modifications
/// accumulate in a private [`TransactionIntentLog`] and are flushed
/// sequentially on [`WriteTransaction::commit`].
pub struct WriteTransaction<S: FragmentStore> {
    handle: Arc<ResourceHandle<S>>,
    base_revision: i32,
    new_revision: i32,
    #[allow(dead_code)]
    txn_id: i32,
    trie: TrieWriter,
    root: Mutex<Arc<IndirectPage>>,
    log: TransactionIntentLog,
    staged: Mutex<Vec<Arc<PageReference>>>,
    _ticket: Ticket,
    finished: AtomicBool,
}

impl<S: FragmentStore> WriteTransaction<S> {
    pub fn base_revision(&self) -> i32 {
        self.base_revision
    }

    pub fn new_revision(&self) -> i32 {
        self.new_revision
    }

    /// Walks the trie copy-on-write to the leaf addressed by
    /// `record_page_key`, staging a `(complete, modified)` pair in the
    /// intent log on first touch this transaction and returning the
    /// `modified` page for the caller to mutate via `set_slot`.
    ///
    /// `complete` is always a private snapshot this transaction alone
    /// owns (built fresh via the combiner rather than sharing the buffer
    /// pool's resident Arc for the base revision), so the intent log's
    /// `close()` can safely close it on commit or rollback without racing
    /// a reader that might otherwise hold the same object pinned in the
    /// cache.
    pub fn prepare_record_page(&self, record_page_key: i64) -> Arc<KeyValueLeafPage> {
        let index_type = self.handle.state.index_type;
        let reference = {
            let mut root = self.root.lock();
            let (new_root, reference) = self.trie.prepare_record_page(
                &root,
                self.handle.state.database_id,
                self.handle.state.resource_id,
                record_page_key,
                index_type,
                self.new_revision,
            );
            *root = new_root;
            reference
        };

        if let Some(container) = self.log.get(&reference) {
            return container.modified;
        }

        let complete = self.load_private_snapshot(record_page_key, index_type);
        let modified = combiner::combine(
            &self.handle.engine.alloc,
            self.handle.engine.config.versioning,
            self.handle.engine.config.sliding_window,
            &[complete.clone()],
            self.new_revision,
            self.handle.state.dewey_ids_stored,
        );

        let cache_key = CacheKey::new(
            self.handle.state.database_id,
            self.handle.state.resource_id,
            record_page_key,
            self.new_revision,
        );
        self.log
            .put(&reference, cache_key, PageContainer { complete, modified: modified.clone() });
        self.staged.lock().push(reference);
        modified
    }

    /// Builds this transaction's own copy of the base-revision page,
    /// never registering it with the shared buffer pool. An empty,
    /// never-before-written record page key yields a fresh empty leaf
    /// rather than an error — the first writer to touch a key creates it.
    fn load_private_snapshot(
        &self,
        record_page_key: i64,
        index_type: IndexType,
    ) -> Arc<KeyValueLeafPage> {
        let chain: Vec<FragmentEntry> = {
            let chains = self.handle.state.fragment_chains.lock();
            chains
                .get(&record_page_key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.revision <= self.base_revision)
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        if chain.is_empty() {
            return KeyValueLeafPage::new(
                self.handle.engine.alloc.clone(),
                record_page_key,
                self.base_revision,
                index_type,
                self.handle.state.dewey_ids_stored,
            )
            .expect("allocating an empty base snapshot for a never-written record page key");
        }
        let fragments: Vec<Arc<KeyValueLeafPage>> = chain
            .iter()
            .map(|entry| {
                let bytes = self.handle.engine.store.read_fragment(entry.page_key);
                format::deserialize(
                    &self.handle.engine.alloc,
                    &bytes,
                    self.handle.state.dewey_ids_stored,
                )
                .expect("fragment bytes must round-trip the on-disk format")
            })
            .collect();
        combiner::combine(
            &self.handle.engine.alloc,
            self.handle.engine.config.versioning,
            self.handle.engine.config.sliding_window,
            &fragments,
            self.base_revision,
            self.handle.state.dewey_ids_stored,
        )
    }

    /// Serializes every dirtied page in commit order, writes the new
    /// revision root, then clears and closes the intent log. Ordering per
    /// spec.md §5: dirty pages are serialized first (here, sequentially;
    /// each page's own bytes are always written in one call), then the
    /// revision-root reference, then the log is cleared.
    pub fn commit(self) {
        let start = Instant::now();
        let staged = self.staged.lock();
        for reference in staged.iter() {
            let container = self
                .log
                .get(reference)
                .expect("every staged reference has a live intent-log entry");
            let bytes = format::serialize(&container.modified);
            let page_key = self.handle.engine.store.write_fragment(
                self.handle.state.resource_id,
                container.modified.record_page_key(),
                &bytes,
            );
            reference.set_page_key(page_key);
            reference.set_page(Some(container.modified.clone()));

            self.handle
                .state
                .fragment_chains
                .lock()
                .entry(container.modified.record_page_key())
                .or_default()
                .insert(
                    0,
                    FragmentEntry {
                        revision: self.new_revision,
                        page_key,
                    },
                );

            let cache_key = CacheKey::new(
                self.handle.state.database_id,
                self.handle.state.resource_id,
                container.modified.record_page_key(),
                self.new_revision,
            );
            self.handle
                .engine
                .pool
                .put(cache_key, container.modified.clone());
        }
        drop(staged);

        self.handle
            .state
            .revision_roots
            .lock()
            .insert(self.new_revision, self.root.lock().clone());
        self.handle
            .state
            .current_revision
            .store(self.new_revision, Ordering::Release);

        // Pages are now owned by the buffer pool under their post-commit
        // identity; the log releases its bookkeeping without closing
        // `modified` a second time. `complete` snapshots, never shared
        // with any other owner, are safe to close outright.
        self.log.close_after_commit();

        metrics::COMMIT_LATENCY.observe(start.elapsed().as_secs_f64());
        metrics::INTENT_LOG_SIZE
            .with_label_values(&[&self.handle.state.resource_id.to_string()])
            .set(0);
        self.finished.store(true, Ordering::Release);
    }

    /// Abandons every staged modification: closes both `complete` and
    /// `modified` pages in the intent log and releases the writer slot
    /// without advancing the resource's revision.
    pub fn rollback(self) {
        self.log.close();
        self.finished.store(true, Ordering::Release);
    }
}

impl<S: FragmentStore> Drop for WriteTransaction<S> {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            // Neither `commit` nor `rollback` was called explicitly (e.g.
            // an early return or panic unwound through this transaction):
            // release in-memory resources exactly as `rollback` would.
            self.log.close();
        }
        self.handle.state.writer_active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<StorageEngine<InMemoryFragmentStore>> {
        StorageEngine::new(StorageConfig::default(), InMemoryFragmentStore::new())
    }

    #[test]
    fn commit_flushes_intent_log_and_is_visible_to_new_readers() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);

        let writer = resource.begin_write().unwrap();
        let modified = writer.prepare_record_page(7);
        modified.set_slot(0, &[0xAA]).unwrap();
        writer.commit();

        let reader = resource.begin_read().unwrap();
        assert_eq!(reader.get_record(7, 0).unwrap(), vec![0xAA]);
        assert_eq!(reader.revision(), 1);
    }

    #[test]
    fn reader_opened_before_commit_keeps_seeing_previous_revision() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);

        let writer = resource.begin_write().unwrap();
        let modified = writer.prepare_record_page(7);
        modified.set_slot(0, &[0x01]).unwrap();
        writer.commit();

        let old_reader = resource.begin_read().unwrap();

        let writer2 = resource.begin_write().unwrap();
        let modified2 = writer2.prepare_record_page(7);
        modified2.set_slot(0, &[0x02]).unwrap();
        writer2.commit();

        assert_eq!(old_reader.get_record(7, 0).unwrap(), vec![0x01]);
        let new_reader = resource.begin_read().unwrap();
        assert_eq!(new_reader.get_record(7, 0).unwrap(), vec![0x02]);
    }

    #[test]
    fn only_one_writer_transaction_per_resource_at_a_time() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);
        let _writer = resource.begin_write().unwrap();
        let err = resource.begin_write().unwrap_err();
        assert!(matches!(err, TxnError::WriterBusy(42)));
    }

    #[test]
    fn dropping_an_uncommitted_writer_releases_the_resource() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);
        {
            let _writer = resource.begin_write().unwrap();
        }
        // the previous writer was dropped without commit/rollback; a new
        // one must still be able to open.
        let _writer2 = resource.begin_write().unwrap();
    }

    #[test]
    fn rollback_discards_modifications() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);
        let writer = resource.begin_write().unwrap();
        let modified = writer.prepare_record_page(7);
        modified.set_slot(0, &[0xFF]).unwrap();
        writer.rollback();

        let reader = resource.begin_read().unwrap();
        assert!(reader.get_record(7, 0).is_none());
        assert_eq!(reader.revision(), 0);
    }

    #[test]
    fn never_written_record_page_key_reads_as_absent() {
        let engine = engine();
        let resource = engine.open_resource(1, 42, IndexType::Document);
        let reader = resource.begin_read().unwrap();
        assert!(reader.get_record(999, 0).is_none());
    }

    #[test]
    fn dewey_enabled_resource_commits_and_reads_back_after_a_cache_miss() {
        let mut config = StorageConfig::default();
        config.dewey_ids_stored = true;
        let engine = StorageEngine::new(config, InMemoryFragmentStore::new());
        let resource = engine.open_resource(1, 42, IndexType::Document);

        let writer = resource.begin_write().unwrap();
        let modified = writer.prepare_record_page(7);
        modified.set_slot(0, &[0xAA]).unwrap();
        modified.set_dewey_id(0, b"1.1").unwrap();
        writer.commit();

        // Force a cache miss so the read is served by
        // `format::deserialize` round-tripping the fragment this resource
        // wrote with its dewey block included.
        engine.pool.clear();

        let reader = resource.begin_read().unwrap();
        assert_eq!(reader.get_record(7, 0).unwrap(), vec![0xAA]);
    }
}
