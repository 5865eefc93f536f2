//! Indirect-page trie writer: a fixed-fanout (128), bit-decomposed address
//! trie from a revision root down to record pages, walked copy-on-write by
//! the single writer transaction that owns it.
//!
//! Not exposed outside the writer (spec.md §4.5 calls this out explicitly:
//! the source mistakenly made trie navigation a public interface, and the
//! re-implementation keeps it private to [`crate::engine`]).

use crate::alloc::SlabAllocator;
use crate::page::leaf::KeyValueLeafPage;
use crate::page::reference::PageReference;
use crate::page::IndexType;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// 128-way fanout: 7 bits of the record-page key consumed per trie level.
pub const FANOUT: usize = 128;
const BITS_PER_LEVEL: u32 = 7;
/// Four levels cover record-page keys up to `128^4` (~268 million), ample
/// for the test and benchmark workloads this engine targets; a resource
/// that outgrows it is a capacity-planning question out of this
/// specification's scope.
pub const TRIE_LEVELS: usize = 4;

fn path_for(record_page_key: i64) -> [usize; TRIE_LEVELS] {
    let mut path = [0usize; TRIE_LEVELS];
    let mask = (FANOUT - 1) as i64;
    for (level, slot) in path.iter_mut().enumerate() {
        let shift = BITS_PER_LEVEL * (TRIE_LEVELS - 1 - level) as u32;
        *slot = ((record_page_key >> shift) & mask) as usize;
    }
    path
}

pub enum TrieChild {
    Indirect(Arc<IndirectPage>),
    Leaf(Arc<PageReference>),
}

impl Clone for TrieChild {
    fn clone(&self) -> Self {
        match self {
            TrieChild::Indirect(p) => TrieChild::Indirect(p.clone()),
            TrieChild::Leaf(r) => TrieChild::Leaf(r.clone()),
        }
    }
}

/// One trie node: 128 child slots, each empty, a further indirect page, or
/// a leaf `PageReference`. `owner_txn` records which writer generation last
/// cloned this node for its own exclusive use; a transaction that observes
/// its own id here may mutate the node in place, otherwise it must clone
/// before writing (the copy-on-write step proper).
pub struct IndirectPage {
    children: Vec<RwLock<Option<TrieChild>>>,
    owner_txn: AtomicI32,
}

const NO_OWNER: i32 = -1;

impl IndirectPage {
    fn empty() -> IndirectPage {
        IndirectPage {
            children: (0..FANOUT).map(|_| RwLock::new(None)).collect(),
            owner_txn: AtomicI32::new(NO_OWNER),
        }
    }

    fn owned_by(&self, txn: i32) -> bool {
        self.owner_txn.load(Ordering::Acquire) == txn
    }

    /// Shallow copy: children are cloned by reference (`Arc`/reference
    /// clone), never deep-copied — the clone's whole point is to let this
    /// transaction mutate its *own* slots without disturbing the node
    /// other readers still see.
    fn shallow_clone(&self, owner_txn: i32) -> IndirectPage {
        let children = self
            .children
            .iter()
            .map(|slot| RwLock::new(slot.read().clone()))
            .collect();
        IndirectPage {
            children,
            owner_txn: AtomicI32::new(owner_txn),
        }
    }

    pub fn child(&self, index: usize) -> Option<TrieChild> {
        self.children[index].read().clone()
    }
}

/// Allocates and walks the trie for exactly one writer transaction,
/// cloning any node it has not already cloned this commit.
pub struct TrieWriter {
    alloc: Arc<SlabAllocator>,
    dewey_ids_stored: bool,
    txn_id: i32,
}

impl TrieWriter {
    pub fn new(alloc: Arc<SlabAllocator>, dewey_ids_stored: bool, txn_id: i32) -> TrieWriter {
        TrieWriter {
            alloc,
            dewey_ids_stored,
            txn_id,
        }
    }

    /// Allocates the initial (empty) leaf for record-page key 0 and wires
    /// it into a freshly created trie, returning the root and a reference
    /// to the leaf for immediate use by the caller (e.g. inserting the
    /// resource's first record).
    pub fn create_tree(
        &self,
        database_id: u64,
        resource_id: u64,
        index_type: IndexType,
    ) -> (Arc<IndirectPage>, Arc<PageReference>) {
        let root = IndirectPage::empty();
        root.owner_txn.store(self.txn_id, Ordering::Release);
        let (reference, _leaf) =
            self.new_leaf(database_id, resource_id, 0, 0, index_type);
        *root.children[0].write() = Some(TrieChild::Leaf(reference.clone()));
        (Arc::new(root), reference)
    }

    fn new_leaf(
        &self,
        database_id: u64,
        resource_id: u64,
        record_page_key: i64,
        revision: i32,
        index_type: IndexType,
    ) -> (Arc<PageReference>, Arc<KeyValueLeafPage>) {
        let leaf = KeyValueLeafPage::new(
            self.alloc.clone(),
            record_page_key,
            revision,
            index_type,
            self.dewey_ids_stored,
        )
        .expect("allocating a fresh trie leaf");
        let reference = Arc::new(PageReference::unpersisted(database_id, resource_id));
        reference.set_page(Some(leaf.clone()));
        (reference, leaf)
    }

    /// Ensures `node` is owned by this transaction, cloning it (and
    /// replacing the parent's slot with the clone) if it belongs to an
    /// earlier transaction or is still shared with readers.
    fn ensure_owned(
        &self,
        parent: &Arc<IndirectPage>,
        parent_slot: usize,
        node: Arc<IndirectPage>,
    ) -> Arc<IndirectPage> {
        if node.owned_by(self.txn_id) {
            return node;
        }
        let cloned = Arc::new(node.shallow_clone(self.txn_id));
        *parent.children[parent_slot].write() = Some(TrieChild::Indirect(cloned.clone()));
        cloned
    }

    /// Walks the trie copy-on-write from `root` to the leaf addressed by
    /// `record_page_key`, materializing intermediate nodes and the leaf
    /// itself on demand. Returns the root the caller must now hold onto
    /// (identical to `root` if this transaction already owned it, a fresh
    /// clone otherwise — the root has no parent slot to rewrite in place,
    /// so ownership of the clone must flow back through the return value)
    /// together with the (possibly freshly allocated) leaf's
    /// `PageReference`.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_record_page(
        &self,
        root: &Arc<IndirectPage>,
        database_id: u64,
        resource_id: u64,
        record_page_key: i64,
        index_type: IndexType,
        revision: i32,
    ) -> (Arc<IndirectPage>, Arc<PageReference>) {
        let path = path_for(record_page_key);
        let new_root = if root.owned_by(self.txn_id) {
            root.clone()
        } else {
            Arc::new(root.shallow_clone(self.txn_id))
        };

        let mut node = new_root.clone();
        for &slot in &path[..TRIE_LEVELS - 1] {
            let existing = node.children[slot].read().clone();
            node = match existing {
                Some(TrieChild::Indirect(child)) => self.ensure_owned(&node, slot, child),
                Some(TrieChild::Leaf(_)) => {
                    panic!("trie depth mismatch: found a leaf above the configured leaf level")
                }
                None => {
                    let child = Arc::new(IndirectPage::empty());
                    child.owner_txn.store(self.txn_id, Ordering::Release);
                    *node.children[slot].write() = Some(TrieChild::Indirect(child.clone()));
                    child
                }
            };
        }

        let leaf_slot = path[TRIE_LEVELS - 1];
        let existing = node.children[leaf_slot].read().clone();
        let reference = match existing {
            Some(TrieChild::Leaf(reference)) => reference,
            Some(TrieChild::Indirect(_)) => {
                panic!("trie depth mismatch: found an indirect node at the configured leaf level")
            }
            None => {
                let (reference, _leaf) = self.new_leaf(
                    database_id,
                    resource_id,
                    record_page_key,
                    revision,
                    index_type,
                );
                *node.children[leaf_slot].write() = Some(TrieChild::Leaf(reference.clone()));
                reference
            }
        };
        (new_root, reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(txn_id: i32) -> TrieWriter {
        let alloc = SlabAllocator::new(1 << 20, 64 << 20);
        TrieWriter::new(alloc, false, txn_id)
    }

    #[test]
    fn create_tree_wires_key_zero() {
        let writer = harness(1);
        let (root, reference) = writer.create_tree(1, 1, IndexType::Document);
        assert_eq!(reference.page_key(), crate::page::reference::NULL_ID);
        match root.child(0) {
            Some(TrieChild::Leaf(r)) => assert!(Arc::ptr_eq(&r, &reference)),
            _ => panic!("expected a leaf at slot 0"),
        }
    }

    #[test]
    fn prepare_record_page_is_idempotent_within_one_walk() {
        let writer = harness(1);
        let (root, _) = writer.create_tree(1, 1, IndexType::Document);
        let (root, a) = writer.prepare_record_page(&root, 1, 1, 500_000, IndexType::Document, 0);
        let (_, b) = writer.prepare_record_page(&root, 1, 1, 500_000, IndexType::Document, 0);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_route_to_distinct_leaves() {
        let writer = harness(1);
        let (root, _) = writer.create_tree(1, 1, IndexType::Document);
        let (root, a) = writer.prepare_record_page(&root, 1, 1, 1, IndexType::Document, 0);
        let (_, b) = writer.prepare_record_page(&root, 1, 1, 2, IndexType::Document, 0);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn second_transaction_clones_rather_than_mutates_shared_nodes() {
        let first = harness(1);
        let (root, _) = first.create_tree(1, 1, IndexType::Document);
        let (root, first_leaf) = first.prepare_record_page(&root, 1, 1, 200, IndexType::Document, 0);

        let second = TrieWriter::new(SlabAllocator::new(1 << 20, 64 << 20), false, 2);
        let (_, second_leaf) = second.prepare_record_page(&root, 1, 1, 200, IndexType::Document, 1);

        // Distinct transactions never share a leaf reference for the same
        // key: the second transaction's walk cloned every node down to the
        // leaf rather than mutating the first transaction's tree.
        assert!(!Arc::ptr_eq(&first_leaf, &second_leaf));
    }
}
