//! Revision epoch tracker: a lock-free low-watermark of the minimum
//! active revision, consumed by the clock sweeper to keep pages still
//! visible to some open reader or writer out of eviction.

use crate::errors::TxnError;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

struct Slot {
    rev: AtomicI32,
    in_use: AtomicBool,
}

/// A handle returned by [`RevisionEpochTracker::register`]. Dropping it
/// releases the slot; there is no separate `unregister` call.
pub struct Ticket {
    tracker: Arc<RevisionEpochTracker>,
    index: usize,
}

impl Ticket {
    pub fn revision(&self) -> i32 {
        self.tracker.slots[self.index].rev.load(Ordering::Acquire)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.tracker.slots[self.index]
            .in_use
            .store(false, Ordering::Release);
    }
}

pub struct RevisionEpochTracker {
    slots: Vec<Slot>,
}

impl RevisionEpochTracker {
    pub fn new(capacity: usize) -> Arc<RevisionEpochTracker> {
        let slots = (0..capacity)
            .map(|_| Slot {
                rev: AtomicI32::new(0),
                in_use: AtomicBool::new(false),
            })
            .collect();
        Arc::new(RevisionEpochTracker { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// CASes a free slot and returns a ticket pinning `rev` as a live
    /// revision. Exhaustion (every slot in use) is fatal to the caller: it
    /// indicates a ticket leak, not ordinary back-pressure.
    pub fn register(self: &Arc<Self>, rev: i32) -> Result<Ticket, TxnError> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.rev.store(rev, Ordering::Release);
                return Ok(Ticket {
                    tracker: self.clone(),
                    index,
                });
            }
        }
        Err(TxnError::EpochTrackerFull {
            capacity: self.slots.len(),
        })
    }

    /// Lock-free scan returning the minimum revision over all live slots,
    /// or `i32::MAX` if no transaction is currently registered.
    pub fn min_active_revision(&self) -> i32 {
        let mut min = i32::MAX;
        for slot in &self.slots {
            if slot.in_use.load(Ordering::Acquire) {
                let rev = slot.rev.load(Ordering::Acquire);
                if rev < min {
                    min = rev;
                }
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_active_revision_tracks_open_tickets() {
        let tracker = RevisionEpochTracker::new(4);
        assert_eq!(tracker.min_active_revision(), i32::MAX);
        let t5 = tracker.register(5).unwrap();
        assert_eq!(tracker.min_active_revision(), 5);
        let t3 = tracker.register(3).unwrap();
        assert_eq!(tracker.min_active_revision(), 3);
        drop(t3);
        assert_eq!(tracker.min_active_revision(), 5);
        drop(t5);
        assert_eq!(tracker.min_active_revision(), i32::MAX);
    }

    #[test]
    fn exhaustion_is_reported_not_silently_blocked() {
        let tracker = RevisionEpochTracker::new(2);
        let _a = tracker.register(1).unwrap();
        let _b = tracker.register(2).unwrap();
        let err = tracker.register(3).unwrap_err();
        assert!(matches!(err, TxnError::EpochTrackerFull { capacity: 2 }));
    }
}
