//! Virtual regions: large contiguous reservations sliced into equal-size
//! segments for one size class.

use crate::errors::AllocError;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A segment address handed out by [`super::SlabAllocator::allocate`].
/// Opaque to callers beyond its address and length.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub addr: usize,
    pub len: usize,
}

/// One virtual reservation, sliced into `total_slices` segments of the
/// owning size class.
pub struct Region {
    pub base: NonNull<u8>,
    pub region_len: usize,
    pub slice_len: usize,
    pub total_slices: usize,
    pub unused_slices: AtomicUsize,
    pub is_physically_mapped: AtomicBool,
    slice_addrs: HashSet<usize>,
}

// SAFETY: the raw pointer is never aliased mutably across threads; all
// mutation happens through the atomics above or under the allocator's
// class lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn reserve(region_len: usize, slice_len: usize) -> Result<Region, AllocError> {
        let total_slices = region_len / slice_len;
        // SAFETY: anonymous, not file-backed; no alignment requirement
        // beyond what the kernel guarantees for mmap.
        let base = unsafe {
            nix::sys::mman::mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(region_len).expect("region_len > 0"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .map_err(AllocError::MapFailed)?
        };
        let base_addr = base.as_ptr() as usize;
        let mut slice_addrs = HashSet::with_capacity(total_slices);
        for i in 0..total_slices {
            slice_addrs.insert(base_addr + i * slice_len);
        }
        Ok(Region {
            base: base.cast(),
            region_len,
            slice_len,
            total_slices,
            unused_slices: AtomicUsize::new(0),
            is_physically_mapped: AtomicBool::new(true),
            slice_addrs,
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.slice_addrs.contains(&addr)
    }

    pub fn slices(&self) -> impl Iterator<Item = Segment> + '_ {
        let base_addr = self.base.as_ptr() as usize;
        (0..self.total_slices).map(move |i| Segment {
            addr: base_addr + i * self.slice_len,
            len: self.slice_len,
        })
    }

    /// `MADV_DONTNEED`-equivalent: releases physical pages while keeping
    /// the virtual mapping, so later reuse is O(1) (no fresh `mmap`).
    pub fn release_physical(&self) -> Result<(), AllocError> {
        // SAFETY: base/region_len describe the live mapping created in
        // `reserve`; advising DONTNEED never invalidates the mapping.
        unsafe {
            nix::sys::mman::madvise(
                self.base.cast(),
                self.region_len,
                nix::sys::mman::MmapAdvise::MADV_DONTNEED,
            )
            .map_err(AllocError::UnmapFailed)?;
        }
        self.is_physically_mapped.store(false, Ordering::Release);
        Ok(())
    }

    pub fn revive(&self) {
        self.is_physically_mapped.store(true, Ordering::Release);
        self.unused_slices.store(0, Ordering::Release);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: this region's mapping was created in `reserve` and is
        // not referenced elsewhere once the allocator drops its handle.
        unsafe {
            let _ = nix::sys::mman::munmap(self.base.cast(), self.region_len);
        }
    }
}
