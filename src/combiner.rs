//! Versioning combiner: reconstructs a materialized record page at
//! revision *r* from an ordered fragment chain `[F_r, F_{r-1}, ..., F_base]`.

use crate::alloc::SlabAllocator;
use crate::config::VersioningStrategy;
use crate::page::leaf::KeyValueLeafPage;
use crate::page::{IndexType, NDP};
use std::sync::Arc;

/// Overlays `src` onto `dst`: any slot set in `src` overwrites the
/// corresponding slot in `dst`, and likewise for its DeweyID label when
/// `dst` has a dewey table — keeping the label aligned with the record it
/// describes (spec.md §4.2). Used by every strategy except `Full`.
fn overlay(dst: &Arc<KeyValueLeafPage>, src: &Arc<KeyValueLeafPage>) {
    let dewey_aligned = dst.dewey_ids_enabled() && src.dewey_ids_enabled();
    for slot in 0..NDP {
        if let Some(view) = src.get_slot(slot) {
            let bytes = view.to_vec();
            drop(view);
            dst.set_slot(slot, &bytes).expect("combiner overlay of an already-validated slot cannot fail");
        }
        if dewey_aligned {
            if let Some(view) = src.get_dewey_id(slot) {
                let bytes = view.to_vec();
                drop(view);
                dst.set_dewey_id(slot, &bytes)
                    .expect("combiner overlay of an already-validated dewey id cannot fail");
            }
        }
    }
}

/// Combines `fragments` (newest first) into a freshly allocated page
/// representing revision `revision`. The output's `record_page_key`
/// matches `fragments[0]`'s; its `revision` is the caller-supplied target
/// revision, independent of the newest fragment's own revision stamp.
///
/// Any intermediate page the strategy allocates internally (currently only
/// `SlidingSnapshot`) is closed before this function returns.
pub fn combine(
    alloc: &Arc<SlabAllocator>,
    strategy: VersioningStrategy,
    sliding_window: usize,
    fragments: &[Arc<KeyValueLeafPage>],
    revision: i32,
    dewey_ids_stored: bool,
) -> Arc<KeyValueLeafPage> {
    assert!(!fragments.is_empty(), "combine requires at least one fragment");
    let record_page_key = fragments[0].record_page_key();
    let index_type = fragments[0].index_type();

    match strategy {
        VersioningStrategy::Full => {
            // A single fragment stands in for the materialized page as-is;
            // we still stamp a fresh page at the target revision so callers
            // always own a page distinct from the cached fragment.
            let result = fresh_leaf(alloc, record_page_key, revision, index_type, dewey_ids_stored);
            overlay(&result, &fragments[0]);
            result
        }
        VersioningStrategy::Differential => {
            let base = fragments.last().unwrap();
            let result = fresh_leaf(alloc, record_page_key, revision, index_type, dewey_ids_stored);
            overlay(&result, base);
            overlay(&result, &fragments[0]);
            result
        }
        VersioningStrategy::Incremental => {
            let result = fresh_leaf(alloc, record_page_key, revision, index_type, dewey_ids_stored);
            for fragment in fragments.iter().rev() {
                overlay(&result, fragment);
            }
            result
        }
        VersioningStrategy::SlidingSnapshot => {
            // Overlay the most recent `sliding_window` fragments. If the
            // chain is shorter than the window, overlay everything
            // available (spec.md's open question: not stated explicitly
            // by the source; resolved this way and recorded in DESIGN.md).
            let window = sliding_window.min(fragments.len()).max(1);
            let intermediate = fresh_leaf(alloc, record_page_key, revision, index_type, dewey_ids_stored);
            for fragment in fragments[..window].iter().rev() {
                overlay(&intermediate, fragment);
            }
            let result = fresh_leaf(alloc, record_page_key, revision, index_type, dewey_ids_stored);
            overlay(&result, &intermediate);
            // The intermediate is a documented leak hotspot in the source:
            // explicitly closed here rather than left to a finalizer.
            intermediate.close_leaf();
            result
        }
    }
}

fn fresh_leaf(
    alloc: &Arc<SlabAllocator>,
    record_page_key: i64,
    revision: i32,
    index_type: IndexType,
    dewey_ids_stored: bool,
) -> Arc<KeyValueLeafPage> {
    KeyValueLeafPage::new(alloc.clone(), record_page_key, revision, index_type, dewey_ids_stored)
        .expect("allocating a fresh combiner result page")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> Arc<SlabAllocator> {
        SlabAllocator::new(1 << 20, 64 << 20)
    }

    fn fragment(alloc: &Arc<SlabAllocator>, rev: i32, slots: &[(usize, &[u8])]) -> Arc<KeyValueLeafPage> {
        let page = KeyValueLeafPage::new(alloc.clone(), 42, rev, IndexType::Document, false).unwrap();
        for (slot, data) in slots {
            page.set_slot(*slot, data).unwrap();
        }
        page
    }

    #[test]
    fn full_strategy_returns_single_fragment_contents() {
        let alloc = harness();
        let f = fragment(&alloc, 3, &[(0, b"a")]);
        let out = combine(&alloc, VersioningStrategy::Full, 4, &[f], 3, false);
        assert_eq!(&*out.get_slot(0).unwrap(), b"a");
        assert_eq!(out.revision(), 3);
    }

    #[test]
    fn incremental_overlays_newest_over_oldest() {
        let alloc = harness();
        let newest = fragment(&alloc, 5, &[(0, b"new")]);
        let oldest = fragment(&alloc, 3, &[(0, b"old"), (1, b"base")]);
        let out = combine(&alloc, VersioningStrategy::Incremental, 4, &[newest, oldest], 5, false);
        assert_eq!(&*out.get_slot(0).unwrap(), b"new");
        assert_eq!(&*out.get_slot(1).unwrap(), b"base");
        assert_eq!(out.revision(), 5);
    }

    #[test]
    fn differential_overlays_newest_on_base_only() {
        let alloc = harness();
        let newest = fragment(&alloc, 5, &[(0, b"new")]);
        let base = fragment(&alloc, 0, &[(0, b"base"), (1, b"untouched")]);
        let out = combine(&alloc, VersioningStrategy::Differential, 4, &[newest, base], 5, false);
        assert_eq!(&*out.get_slot(0).unwrap(), b"new");
        assert_eq!(&*out.get_slot(1).unwrap(), b"untouched");
    }

    #[test]
    fn sliding_snapshot_handles_short_chains() {
        let alloc = harness();
        let f = fragment(&alloc, 1, &[(0, b"only")]);
        // window of 4 over a single-fragment chain: overlays everything
        // available rather than failing.
        let out = combine(&alloc, VersioningStrategy::SlidingSnapshot, 4, &[f], 1, false);
        assert_eq!(&*out.get_slot(0).unwrap(), b"only");
    }

    #[test]
    fn sliding_snapshot_does_not_leak_its_intermediate() {
        let alloc = harness();
        let fragments: Vec<_> = (0..6).rev().map(|r| fragment(&alloc, r, &[(r as usize, b"x")])).collect();
        let out = combine(&alloc, VersioningStrategy::SlidingSnapshot, 4, &fragments, 5, false);
        // all 6 fragments were produced by distinct slots; only the
        // windowed ones (revisions 2..5, newest-first after rev()) should
        // be visible, confirming the intermediate's overlay actually ran
        // and was then discarded rather than returned.
        assert!(out.get_slot(5).is_some());
        assert!(out.get_slot(2).is_some());
    }

    #[test]
    fn combine_propagates_dewey_ids_stored_into_fresh_pages() {
        let alloc = harness();
        let f = KeyValueLeafPage::new(alloc.clone(), 42, 1, IndexType::Document, true).unwrap();
        f.set_slot(0, b"a").unwrap();
        f.set_dewey_id(0, b"1.1").unwrap();
        let out = combine(&alloc, VersioningStrategy::Full, 4, &[f], 1, true);
        assert!(out.dewey_ids_enabled());
        assert_eq!(&*out.get_dewey_id(0).unwrap(), b"1.1");
    }
}
