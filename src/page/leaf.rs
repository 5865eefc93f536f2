//! The key-value leaf page: a fixed-capacity, off-heap-backed record
//! container with an in-place-resizable slot table and an optional DeweyID
//! table.

use crate::alloc::{Segment, SlabAllocator, SMALLEST_CLASS};
use crate::errors::AllocError;
use crate::page::reference::PageReference;
use crate::page::{IndexType, PageFrame, PageHeader, NDP};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeafError {
    #[error("slot index {0} is out of range (capacity {NDP})")]
    SlotOutOfRange(usize),
    #[error("slot payload must be non-empty")]
    EmptySlotPayload,
    #[error("page was not created with a DeweyID table")]
    DeweyIdsNotEnabled,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// An off-heap byte region owned exclusively by one page. Grows by
/// doubling; the previous segment is released to the allocator only after
/// a successful compacting copy into the new one.
struct MemorySegment {
    alloc: Arc<SlabAllocator>,
    segment: Segment,
}

impl MemorySegment {
    fn new(alloc: Arc<SlabAllocator>, min_capacity: usize) -> Result<Self, AllocError> {
        let segment = alloc.allocate(min_capacity.max(SMALLEST_CLASS))?;
        Ok(MemorySegment { alloc, segment })
    }

    fn capacity(&self) -> usize {
        self.segment.len
    }

    /// # Safety
    /// Caller must not read or write outside bytes already written by this
    /// page's own bump allocator.
    unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.segment.addr as *const u8, self.segment.len)
    }

    /// # Safety
    /// See [`Self::as_slice`]; additionally the caller must not alias this
    /// mutable view with any concurrent reader (enforced by the page's
    /// `RwLock`).
    unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.segment.addr as *mut u8, self.segment.len)
    }

    /// `MADV_DONTNEED`-equivalent without returning the segment to the
    /// allocator: used by `reset()`, which keeps the slot table's virtual
    /// mapping but drops physical backing.
    fn advise_dontneed(&self) {
        // SAFETY: addr/len describe this segment's live mapping; advising
        // DONTNEED is always sound, it only discards page contents.
        let result = unsafe {
            nix::sys::mman::madvise(
                std::ptr::NonNull::new_unchecked(self.segment.addr as *mut libc::c_void),
                self.segment.len,
                nix::sys::mman::MmapAdvise::MADV_DONTNEED,
            )
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "MADV_DONTNEED-equivalent failed on page reset, continuing");
        }
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        if let Err(e) = self.alloc.release(self.segment) {
            tracing::warn!(error = %e, "failed to release leaf page segment to allocator");
        }
    }
}

/// Fixed-width presence bitmap over the page's `NDP` slots.
struct Bitmap {
    words: [u64; NDP / 64],
}

impl Bitmap {
    fn new() -> Self {
        Bitmap { words: [0; NDP / 64] }
    }
    fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }
    fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }
    fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }
    fn clear_all(&mut self) {
        self.words = [0; NDP / 64];
    }
    fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
    fn from_bytes(bytes: &[u8]) -> Bitmap {
        let mut words = [0u64; NDP / 64];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        }
        Bitmap { words }
    }
}

struct LeafInner {
    slot_memory: MemorySegment,
    slot_used: usize,
    slot_offsets: Vec<i32>,
    dewey_id_memory: Option<MemorySegment>,
    dewey_used: usize,
    dewey_id_offsets: Vec<i32>,
    entries_bitmap: Bitmap,
    overlong_bitmap: Bitmap,
    references: HashMap<i32, Arc<PageReference>>,
    last_slot_index: i32,
    last_dewey_id_index: i32,
}

fn read_len_at(segment_bytes: &[u8], offset: usize) -> usize {
    u32::from_le_bytes(segment_bytes[offset..offset + 4].try_into().unwrap()) as usize
}

impl LeafInner {
    fn write_record(&mut self, offset: usize, data: &[u8]) {
        // SAFETY: offset..offset+4+data.len() was already reserved by the
        // caller's bump-allocation or verified to match an existing
        // in-place record of the same padded size.
        unsafe {
            let buf = self.slot_memory.as_mut_slice();
            buf[offset..offset + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            buf[offset + 4..offset + 4 + data.len()].copy_from_slice(data);
        }
    }

    fn ensure_capacity(&mut self, alloc: &Arc<SlabAllocator>, additional: usize) -> Result<(), AllocError> {
        let needed = self.slot_used + additional;
        if needed <= self.slot_memory.capacity() {
            return Ok(());
        }
        let mut new_cap = self.slot_memory.capacity().max(SMALLEST_CLASS);
        while new_cap < needed {
            new_cap *= 2;
        }
        let mut new_segment = MemorySegment::new(alloc.clone(), new_cap)?;
        let mut write_off = 0usize;
        for slot in 0..NDP {
            let off = self.slot_offsets[slot];
            if off < 0 {
                continue;
            }
            // SAFETY: `off` was written by a previous `write_record` call
            // into `self.slot_memory`, so `off..off+4+len` is valid there.
            let len = unsafe { read_len_at(self.slot_memory.as_slice(), off as usize) };
            let padded = align_up(4 + len, 4);
            unsafe {
                let src = self.slot_memory.as_slice();
                let dst = new_segment.as_mut_slice();
                dst[write_off..write_off + padded].copy_from_slice(&src[off as usize..off as usize + padded]);
            }
            self.slot_offsets[slot] = write_off as i32;
            write_off += padded;
        }
        // old segment is only dropped (and released to the allocator)
        // once the compacting copy above has fully committed.
        self.slot_memory = new_segment;
        self.slot_used = write_off;
        Ok(())
    }

    fn write_dewey(&mut self, offset: usize, data: &[u8]) {
        let mem = self
            .dewey_id_memory
            .as_mut()
            .expect("caller already checked dewey_id_memory.is_some()");
        // SAFETY: see `write_record`; the same reservation discipline
        // applies to the dewey segment.
        unsafe {
            let buf = mem.as_mut_slice();
            buf[offset..offset + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            buf[offset + 4..offset + 4 + data.len()].copy_from_slice(data);
        }
    }

    fn ensure_dewey_capacity(&mut self, alloc: &Arc<SlabAllocator>, additional: usize) -> Result<(), AllocError> {
        let needed = self.dewey_used + additional;
        let capacity = self
            .dewey_id_memory
            .as_ref()
            .expect("caller already checked dewey_id_memory.is_some()")
            .capacity();
        if needed <= capacity {
            return Ok(());
        }
        let mut new_cap = capacity.max(SMALLEST_CLASS);
        while new_cap < needed {
            new_cap *= 2;
        }
        let mut new_segment = MemorySegment::new(alloc.clone(), new_cap)?;
        let mut write_off = 0usize;
        for slot in 0..NDP {
            let off = self.dewey_id_offsets[slot];
            if off < 0 {
                continue;
            }
            let old_mem = self.dewey_id_memory.as_ref().unwrap();
            // SAFETY: `off` was written by a previous `write_dewey` call
            // into this same dewey segment.
            let len = unsafe { read_len_at(old_mem.as_slice(), off as usize) };
            let padded = align_up(4 + len, 4);
            unsafe {
                let src = old_mem.as_slice();
                let dst = new_segment.as_mut_slice();
                dst[write_off..write_off + padded].copy_from_slice(&src[off as usize..off as usize + padded]);
            }
            self.dewey_id_offsets[slot] = write_off as i32;
            write_off += padded;
        }
        self.dewey_id_memory = Some(new_segment);
        self.dewey_used = write_off;
        Ok(())
    }
}

/// Which off-heap segment a [`SlotView`] reads out of.
enum SlotSource {
    Record,
    DeweyId,
}

/// A view over one slot's (or DeweyID's) payload, tied to the page's read
/// lock: the zero-copy read the on-disk format is designed to support.
pub struct SlotView<'a> {
    guard: RwLockReadGuard<'a, LeafInner>,
    range: std::ops::Range<usize>,
    source: SlotSource,
}

impl<'a> Deref for SlotView<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: `range` was computed from the same guard's memory it now
        // reads and is held for the view's lifetime.
        unsafe {
            let bytes = match self.source {
                SlotSource::Record => self.guard.slot_memory.as_slice(),
                SlotSource::DeweyId => self
                    .guard
                    .dewey_id_memory
                    .as_ref()
                    .expect("a DeweyId SlotView implies dewey_id_memory is Some")
                    .as_slice(),
            };
            &bytes[self.range.clone()]
        }
    }
}

#[cfg(debug_assertions)]
type CreationTrace = std::backtrace::Backtrace;
#[cfg(not(debug_assertions))]
type CreationTrace = ();

pub struct KeyValueLeafPage {
    header: PageHeader,
    alloc: Arc<SlabAllocator>,
    record_page_key: i64,
    revision: i32,
    index_type: IndexType,
    inner: RwLock<LeafInner>,
    #[allow(dead_code)]
    creation_trace: CreationTrace,
}

impl KeyValueLeafPage {
    pub fn new(
        alloc: Arc<SlabAllocator>,
        record_page_key: i64,
        revision: i32,
        index_type: IndexType,
        dewey_ids_stored: bool,
    ) -> Result<Arc<KeyValueLeafPage>, LeafError> {
        let slot_memory = MemorySegment::new(alloc.clone(), 64 << 10)?;
        let dewey_id_memory = if dewey_ids_stored {
            Some(MemorySegment::new(alloc.clone(), 64 << 10)?)
        } else {
            None
        };
        let inner = LeafInner {
            slot_memory,
            slot_used: 0,
            slot_offsets: vec![-1; NDP],
            dewey_id_memory,
            dewey_used: 0,
            dewey_id_offsets: vec![-1; NDP],
            entries_bitmap: Bitmap::new(),
            overlong_bitmap: Bitmap::new(),
            references: HashMap::new(),
            last_slot_index: -1,
            last_dewey_id_index: -1,
        };
        Ok(Arc::new(KeyValueLeafPage {
            header: PageHeader::default(),
            alloc,
            record_page_key,
            revision,
            index_type,
            inner: RwLock::new(inner),
            #[cfg(debug_assertions)]
            creation_trace: std::backtrace::Backtrace::capture(),
            #[cfg(not(debug_assertions))]
            creation_trace: (),
        }))
    }

    pub fn record_page_key(&self) -> i64 {
        self.record_page_key
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn last_slot_index(&self) -> i32 {
        self.inner.read().last_slot_index
    }

    pub fn set_slot(&self, slot: usize, data: &[u8]) -> Result<(), LeafError> {
        if slot >= NDP {
            return Err(LeafError::SlotOutOfRange(slot));
        }
        if data.is_empty() {
            return Err(LeafError::EmptySlotPayload);
        }
        let padded = align_up(4 + data.len(), 4);
        let mut inner = self.inner.write();

        let existing = inner.slot_offsets[slot];
        if existing >= 0 {
            // SAFETY: `existing` was written by a previous call into this
            // same slot_memory.
            let existing_len = unsafe { read_len_at(inner.slot_memory.as_slice(), existing as usize) };
            if align_up(4 + existing_len, 4) == padded {
                inner.write_record(existing as usize, data);
                inner.entries_bitmap.set(slot);
                if slot as i32 > inner.last_slot_index {
                    inner.last_slot_index = slot as i32;
                }
                return Ok(());
            }
        }

        inner.ensure_capacity(&self.alloc, padded)?;
        let offset = inner.slot_used;
        inner.write_record(offset, data);
        inner.slot_used += padded;
        inner.slot_offsets[slot] = offset as i32;
        inner.entries_bitmap.set(slot);
        if slot as i32 > inner.last_slot_index {
            inner.last_slot_index = slot as i32;
        }
        Ok(())
    }

    /// Zero-copy write used during deserialization: copies `len` bytes
    /// directly out of another segment (e.g. a decompressed disk buffer)
    /// rather than requiring a caller-side `Vec<u8>`.
    pub fn set_slot_direct(&self, slot: usize, src: &[u8], src_off: usize, len: usize) -> Result<(), LeafError> {
        self.set_slot(slot, &src[src_off..src_off + len])
    }

    pub fn get_slot(&self, slot: usize) -> Option<SlotView<'_>> {
        if slot >= NDP {
            return None;
        }
        let inner = self.inner.read();
        if !inner.entries_bitmap.get(slot) {
            return None;
        }
        let off = inner.slot_offsets[slot];
        if off < 0 {
            return None;
        }
        // SAFETY: `off` was written by a previous `write_record` call.
        let len = unsafe { read_len_at(inner.slot_memory.as_slice(), off as usize) };
        let start = off as usize + 4;
        Some(SlotView {
            guard: inner,
            range: start..start + len,
            source: SlotSource::Record,
        })
    }

    pub fn is_slot_set(&self, slot: usize) -> bool {
        slot < NDP && self.inner.read().entries_bitmap.get(slot)
    }

    /// Whether this page was created with a DeweyID table at all.
    pub fn dewey_ids_enabled(&self) -> bool {
        self.inner.read().dewey_id_memory.is_some()
    }

    /// Sets the DeweyID label for `slot`. Per spec.md §4.2's
    /// DeweyID-vs-record alignment requirement, this uses the same slot
    /// index space as [`Self::set_slot`] — label `slot` corresponds to the
    /// record at `slot`.
    pub fn set_dewey_id(&self, slot: usize, data: &[u8]) -> Result<(), LeafError> {
        if slot >= NDP {
            return Err(LeafError::SlotOutOfRange(slot));
        }
        if data.is_empty() {
            return Err(LeafError::EmptySlotPayload);
        }
        let padded = align_up(4 + data.len(), 4);
        let mut inner = self.inner.write();
        if inner.dewey_id_memory.is_none() {
            return Err(LeafError::DeweyIdsNotEnabled);
        }

        let existing = inner.dewey_id_offsets[slot];
        if existing >= 0 {
            // SAFETY: `existing` was written by a previous call into this
            // same dewey segment.
            let existing_len = unsafe {
                read_len_at(inner.dewey_id_memory.as_ref().unwrap().as_slice(), existing as usize)
            };
            if align_up(4 + existing_len, 4) == padded {
                inner.write_dewey(existing as usize, data);
                if slot as i32 > inner.last_dewey_id_index {
                    inner.last_dewey_id_index = slot as i32;
                }
                return Ok(());
            }
        }

        inner.ensure_dewey_capacity(&self.alloc, padded)?;
        let offset = inner.dewey_used;
        inner.write_dewey(offset, data);
        inner.dewey_used += padded;
        inner.dewey_id_offsets[slot] = offset as i32;
        if slot as i32 > inner.last_dewey_id_index {
            inner.last_dewey_id_index = slot as i32;
        }
        Ok(())
    }

    /// Zero-copy write used during deserialization, mirroring
    /// [`Self::set_slot_direct`] for the DeweyID table.
    pub fn set_dewey_id_direct(&self, slot: usize, src: &[u8], src_off: usize, len: usize) -> Result<(), LeafError> {
        self.set_dewey_id(slot, &src[src_off..src_off + len])
    }

    pub fn get_dewey_id(&self, slot: usize) -> Option<SlotView<'_>> {
        if slot >= NDP {
            return None;
        }
        let inner = self.inner.read();
        inner.dewey_id_memory.as_ref()?;
        let off = inner.dewey_id_offsets[slot];
        if off < 0 {
            return None;
        }
        // SAFETY: `off` was written by a previous `write_dewey` call.
        let len = unsafe { read_len_at(inner.dewey_id_memory.as_ref().unwrap().as_slice(), off as usize) };
        let start = off as usize + 4;
        Some(SlotView {
            guard: inner,
            range: start..start + len,
            source: SlotSource::DeweyId,
        })
    }

    pub fn last_dewey_id_index(&self) -> i32 {
        self.inner.read().last_dewey_id_index
    }

    /// Raw DeweyID offset table, `-1` for absent slots. Used by the
    /// on-disk codec, mirroring [`Self::slot_offsets`].
    pub fn dewey_id_offsets(&self) -> Vec<i32> {
        self.inner.read().dewey_id_offsets.clone()
    }

    /// A defensive copy of the bytes used in the dewey segment
    /// (`0..dewey_used`), for serialization. Empty if this page has no
    /// dewey table.
    pub fn dewey_memory_snapshot(&self) -> Vec<u8> {
        let inner = self.inner.read();
        match &inner.dewey_id_memory {
            // SAFETY: `0..dewey_used` has been fully written by prior
            // `write_dewey` calls.
            Some(mem) => unsafe { mem.as_slice()[..inner.dewey_used].to_vec() },
            None => Vec::new(),
        }
    }

    pub fn set_overlong_reference(&self, slot: usize, reference: Arc<PageReference>) {
        let mut inner = self.inner.write();
        inner.references.insert(slot as i32, reference);
        inner.overlong_bitmap.set(slot);
    }

    pub fn overlong_reference(&self, slot: usize) -> Option<Arc<PageReference>> {
        self.inner.read().references.get(&(slot as i32)).cloned()
    }

    /// All overlong slots and the page references they hold, in slot
    /// order. Used by [`crate::page::format`] to persist the overlong
    /// reference table.
    pub fn overlong_references(&self) -> Vec<(usize, Arc<PageReference>)> {
        let inner = self.inner.read();
        let mut out: Vec<(usize, Arc<PageReference>)> = inner
            .references
            .iter()
            .map(|(slot, r)| (*slot as usize, r.clone()))
            .collect();
        out.sort_by_key(|(slot, _)| *slot);
        out
    }

    pub fn entries_bitmap_bytes(&self) -> Vec<u8> {
        self.inner.read().entries_bitmap.to_bytes()
    }

    pub fn overlong_bitmap_bytes(&self) -> Vec<u8> {
        self.inner.read().overlong_bitmap.to_bytes()
    }

    /// Raw slot offset table, `-1` for absent slots. Used by the on-disk
    /// codec; callers needing payloads should use [`Self::get_slot`].
    pub fn slot_offsets(&self) -> Vec<i32> {
        self.inner.read().slot_offsets.clone()
    }

    /// A defensive copy of the bytes actually used in `slot_memory`
    /// (`0..slot_used`), for serialization. Not zero-copy on the write
    /// path; the allocator-owned segment itself never leaves the page.
    pub fn slot_memory_snapshot(&self) -> Vec<u8> {
        let inner = self.inner.read();
        // SAFETY: `0..slot_used` has been fully written by prior
        // `write_record` calls.
        unsafe { inner.slot_memory.as_slice()[..inner.slot_used].to_vec() }
    }

    pub fn acquire_guard(&self) {
        self.header.mark_hot();
        self.header.acquire_guard();
    }

    pub fn release_guard(&self) {
        self.header.release_guard();
    }

    /// Mark all slots absent, bump the frame-reuse version, clear the HOT
    /// bit, and release physical (not virtual) backing for the slot
    /// memory. Must only be invoked while `guard_count == 0`, under the
    /// cache's per-key lock; this method does not itself enforce that,
    /// mirroring the source's placement of that guarantee at the call
    /// site (see `cache::sweeper`).
    pub fn reset_leaf(&self) {
        let mut inner = self.inner.write();
        inner.entries_bitmap.clear_all();
        inner.overlong_bitmap.clear_all();
        for o in inner.slot_offsets.iter_mut() {
            *o = -1;
        }
        for o in inner.dewey_id_offsets.iter_mut() {
            *o = -1;
        }
        inner.references.clear();
        inner.last_slot_index = -1;
        inner.last_dewey_id_index = -1;
        inner.slot_used = 0;
        inner.dewey_used = 0;
        inner.slot_memory.advise_dontneed();
        if let Some(dewey) = &inner.dewey_id_memory {
            dewey.advise_dontneed();
        }
        drop(inner);
        self.header.bump_version();
        self.header.clear_hot();
    }

    /// One-shot transition to closed. Idempotent; refuses (logs a warning
    /// and returns `false`) while any guard is outstanding.
    pub fn close_leaf(&self) -> bool {
        if self.header.is_closed() {
            return false;
        }
        if self.header.guard_count() > 0 {
            tracing::warn!(
                record_page_key = self.record_page_key,
                "close() refused: guard_count > 0"
            );
            return false;
        }
        if self.header.is_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the inner segments here returns them to the allocator.
        let mut inner = self.inner.write();
        inner.references.clear();
        true
    }
}

impl PageFrame for KeyValueLeafPage {
    fn header(&self) -> &PageHeader {
        &self.header
    }
    fn record_page_key(&self) -> i64 {
        self.record_page_key
    }
    fn revision(&self) -> i32 {
        self.revision
    }
    fn reset(&self) {
        self.reset_leaf()
    }
    fn close(&self) -> bool {
        self.close_leaf()
    }
}

impl Drop for KeyValueLeafPage {
    fn drop(&mut self) {
        if !self.header.is_closed() {
            tracing::warn!(
                record_page_key = self.record_page_key,
                "KeyValueLeafPage dropped without close(); this is a resource leak"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndexType;

    fn harness() -> (Arc<SlabAllocator>, Arc<KeyValueLeafPage>) {
        let alloc = SlabAllocator::new(1 << 20, 64 << 20);
        let page =
            KeyValueLeafPage::new(alloc.clone(), 0, 0, IndexType::Document, false).unwrap();
        (alloc, page)
    }

    #[test]
    fn fresh_page_round_trip() {
        let (_alloc, page) = harness();
        page.set_slot(5, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(&*page.get_slot(5).unwrap(), &[0x01, 0x02, 0x03]);
        assert!(page.get_slot(6).is_none());
        assert!(page.is_slot_set(5));
        assert_eq!(page.last_slot_index(), 5);
    }

    #[test]
    fn slot_zero_rejects_empty_payload() {
        let (_alloc, page) = harness();
        let err = page.set_slot(0, &[]).unwrap_err();
        assert!(matches!(err, LeafError::EmptySlotPayload));
    }

    #[test]
    fn last_slot_is_accepted() {
        let (_alloc, page) = harness();
        page.set_slot(NDP - 1, b"x").unwrap();
        assert_eq!(page.last_slot_index(), (NDP - 1) as i32);
    }

    #[test]
    fn grow_on_overflow_preserves_all_payloads() {
        let (_alloc, page) = harness();
        let payload = vec![0xAB_u8; 200];
        for i in 0..500 {
            page.set_slot(i, &payload).unwrap();
        }
        for i in 0..500 {
            assert_eq!(&*page.get_slot(i).unwrap(), payload.as_slice());
        }
    }

    #[test]
    fn reset_clears_entries_and_bumps_version() {
        let (_alloc, page) = harness();
        page.set_slot(3, b"hello").unwrap();
        let v0 = page.header().version();
        page.reset_leaf();
        assert!(page.get_slot(3).is_none());
        assert!(page.header().version() > v0);
        assert!(!page.header().is_hot());
    }

    #[test]
    fn close_is_idempotent() {
        let (_alloc, page) = harness();
        assert!(page.close_leaf());
        assert!(!page.close_leaf());
    }

    #[test]
    fn close_refuses_while_guarded() {
        let (_alloc, page) = harness();
        page.acquire_guard();
        assert!(!page.close_leaf());
        page.release_guard();
        assert!(page.close_leaf());
    }

    #[test]
    fn dewey_ids_disabled_by_default_rejects_writes() {
        let (_alloc, page) = harness();
        assert!(!page.dewey_ids_enabled());
        let err = page.set_dewey_id(0, b"1.2.3").unwrap_err();
        assert!(matches!(err, LeafError::DeweyIdsNotEnabled));
    }

    #[test]
    fn dewey_id_round_trips_aligned_with_its_record_slot() {
        let alloc = SlabAllocator::new(1 << 20, 64 << 20);
        let page =
            KeyValueLeafPage::new(alloc, 0, 0, IndexType::Document, true).unwrap();
        assert!(page.dewey_ids_enabled());
        page.set_slot(5, b"record").unwrap();
        page.set_dewey_id(5, b"1.3.5").unwrap();
        assert_eq!(&*page.get_slot(5).unwrap(), b"record");
        assert_eq!(&*page.get_dewey_id(5).unwrap(), b"1.3.5");
        assert_eq!(page.last_dewey_id_index(), 5);
        assert!(page.get_dewey_id(6).is_none());
    }

    #[test]
    fn dewey_table_grows_independently_of_record_table() {
        let alloc = SlabAllocator::new(1 << 20, 64 << 20);
        let page =
            KeyValueLeafPage::new(alloc, 0, 0, IndexType::Document, true).unwrap();
        let label = vec![0xCDu8; 300];
        for i in 0..400 {
            page.set_dewey_id(i, &label).unwrap();
        }
        for i in 0..400 {
            assert_eq!(&*page.get_dewey_id(i).unwrap(), label.as_slice());
        }
    }
}
