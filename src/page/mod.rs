//! Page types: the composite [`reference::PageReference`] handle, the
//! fixed-capacity [`leaf::KeyValueLeafPage`] record container, and the
//! on-disk [`format`] codec that reconstructs one from decompressed bytes.

pub mod format;
pub mod leaf;
pub mod reference;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};

/// Fixed slot capacity of a [`leaf::KeyValueLeafPage`].
pub const NDP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexType {
    Document = 0,
    Attributes = 1,
    Changes = 2,
    CasPage = 3,
    PathSummary = 4,
}

impl IndexType {
    pub fn from_u8(v: u8) -> Option<IndexType> {
        Some(match v {
            0 => IndexType::Document,
            1 => IndexType::Attributes,
            2 => IndexType::Changes,
            3 => IndexType::CasPage,
            4 => IndexType::PathSummary,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageKind {
    KeyValueLeaf = 0,
    Indirect = 1,
    RevisionRoot = 2,
}

/// Fields shared by every cacheable page frame: frame-reuse version,
/// clock-sweep HOT bit, guard refcount, and the one-shot closed flag.
/// Embedded by value (not boxed) so each page owns its header directly.
#[derive(Debug, Default)]
pub struct PageHeader {
    pub version: AtomicU32,
    pub hot: AtomicBool,
    pub guard_count: AtomicI32,
    pub is_closed: AtomicBool,
}

impl PageHeader {
    pub fn mark_hot(&self) {
        self.hot.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn clear_hot(&self) -> bool {
        self.hot
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }

    pub fn is_hot(&self) -> bool {
        self.hot.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn acquire_guard(&self) {
        self.guard_count
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    pub fn release_guard(&self) {
        self.guard_count
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }

    pub fn guard_count(&self) -> i32 {
        self.guard_count.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.version.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn bump_version(&self) -> u32 {
        self.version
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Common trait for anything the buffer pool and clock sweeper can hold:
/// a leaf record page today, indirect trie nodes in principle. Keeps the
/// sweeper's eviction loop agnostic to the concrete page type.
pub trait PageFrame: Send + Sync {
    fn header(&self) -> &PageHeader;
    fn record_page_key(&self) -> i64;
    fn revision(&self) -> i32;

    /// Marks all slots absent, bumps `version`, clears the HOT bit, and
    /// releases backing memory to the allocator. Must not be called while
    /// `guard_count > 0`.
    fn reset(&self);

    /// One-shot transition to closed; idempotent. Returns `true` if this
    /// call performed the transition.
    fn close(&self) -> bool;
}
