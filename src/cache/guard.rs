//! Scoped, refcounted access to a resident page.

use crate::errors::TxnError;
use crate::page::leaf::KeyValueLeafPage;
use std::ops::Deref;
use std::sync::Arc;

/// A live hold on a page's residency: while any `PageGuard` exists for a
/// page, the clock sweeper must not reset or evict it (enforced by the
/// shard's per-key lock at acquisition and by the sweeper's own
/// `guard_count == 0` check).
///
/// No data-bearing byte range of a page may be read without a live guard
/// for it (the mandatory discipline the whole cache is built around).
pub struct PageGuard {
    page: Arc<KeyValueLeafPage>,
    observed_version: u32,
}

impl PageGuard {
    /// Takes ownership of a guard count that the caller has *already*
    /// incremented (e.g. inside the shard's per-key critical section in
    /// `get_and_guard`). There is deliberately no safe constructor that
    /// increments the count itself outside that section: any "get; then
    /// acquire" sequence is the TOCTOU bug this type exists to rule out.
    pub fn from_acquired(page: Arc<KeyValueLeafPage>) -> PageGuard {
        let observed_version = page.header().version();
        PageGuard {
            page,
            observed_version,
        }
    }

    pub fn observed_version(&self) -> u32 {
        self.observed_version
    }

    /// Fails if the frame has been reset and reused since this guard was
    /// acquired (a version bump concurrent with the guard's lifetime is a
    /// contract violation, not something that normally happens, but a
    /// caller holding a guard across an `await` boundary should still be
    /// able to detect it rather than read a foreign page's bytes).
    pub fn revalidate(&self) -> Result<(), TxnError> {
        let current = self.page.header().version();
        if current != self.observed_version {
            return Err(TxnError::VersionMismatch {
                observed: self.observed_version,
                current,
            });
        }
        Ok(())
    }
}

impl Deref for PageGuard {
    type Target = KeyValueLeafPage;
    fn deref(&self) -> &KeyValueLeafPage {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.page.release_guard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAllocator;
    use crate::page::IndexType;

    #[test]
    fn revalidate_detects_reset_during_guard_lifetime() {
        let alloc = SlabAllocator::new(1 << 20, 16 << 20);
        let page = KeyValueLeafPage::new(alloc, 0, 0, IndexType::Document, false).unwrap();
        page.acquire_guard();
        let guard = PageGuard::from_acquired(page.clone());
        guard.revalidate().unwrap();
        page.release_guard();
        // force a version bump the guard did not expect
        page.reset_leaf();
        assert!(guard.revalidate().is_err());
    }
}
