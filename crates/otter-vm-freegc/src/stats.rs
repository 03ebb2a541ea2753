//! Free-path and collector statistics.
//!
//! Worker counters are written only by their owning worker (plain
//! load/store, no read-modify-write) and may be read from any thread, so
//! tuning data can be collected without touching the hot path's cache lines.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::RejectReason;

/// Snapshot of eager-reclaim counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreeStats {
    /// Allocations served from a worker free list
    pub free_list_hits: u64,
    /// Allocations that went to the slow path
    pub slow_path_allocs: u64,
    /// Objects accepted by eager free
    pub frees_accepted: u64,
    /// Rejected: eager free disabled
    pub rejected_disabled: u64,
    /// Rejected: outside the heap or not an object start
    pub rejected_not_in_heap: u64,
    /// Rejected: below the minimum size
    pub rejected_too_small: u64,
    /// Rejected: above the maximum size
    pub rejected_too_large: u64,
    /// Rejected: side record attached
    pub rejected_side_record: u64,
    /// Rejected: size or shape mismatch
    pub rejected_mismatch: u64,
    /// Rejected: object not currently allocated
    pub rejected_not_allocated: u64,
    /// Calls to grow-and-free
    pub grow_calls: u64,
    /// Old buffers freed by grow-and-free
    pub grow_frees: u64,
    /// Tracked allocations
    pub tracked_allocs: u64,
    /// Tracked objects freed at scope exit
    pub tracked_frees: u64,
    /// Tracked objects left to the collector: slots found zeroed at scope
    /// exit, or allocations a sweep overtook before they were recorded
    pub tracked_skipped: u64,
    /// Tracking allocations beyond registry capacity
    pub track_overflow: u64,
    /// Cached objects returned to their blocks on worker exit
    pub flushed: u64,
}

impl FreeStats {
    /// Total rejections across all reasons.
    pub fn rejected(&self) -> u64 {
        self.rejected_disabled
            + self.rejected_not_in_heap
            + self.rejected_too_small
            + self.rejected_too_large
            + self.rejected_side_record
            + self.rejected_mismatch
            + self.rejected_not_allocated
    }

    /// Rejections for one reason.
    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        match reason {
            RejectReason::Disabled => self.rejected_disabled,
            RejectReason::NotInHeap => self.rejected_not_in_heap,
            RejectReason::TooSmall => self.rejected_too_small,
            RejectReason::TooLarge => self.rejected_too_large,
            RejectReason::SideRecord => self.rejected_side_record,
            RejectReason::Mismatch => self.rejected_mismatch,
            RejectReason::NotAllocated => self.rejected_not_allocated,
        }
    }
}

impl AddAssign for FreeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.free_list_hits += rhs.free_list_hits;
        self.slow_path_allocs += rhs.slow_path_allocs;
        self.frees_accepted += rhs.frees_accepted;
        self.rejected_disabled += rhs.rejected_disabled;
        self.rejected_not_in_heap += rhs.rejected_not_in_heap;
        self.rejected_too_small += rhs.rejected_too_small;
        self.rejected_too_large += rhs.rejected_too_large;
        self.rejected_side_record += rhs.rejected_side_record;
        self.rejected_mismatch += rhs.rejected_mismatch;
        self.rejected_not_allocated += rhs.rejected_not_allocated;
        self.grow_calls += rhs.grow_calls;
        self.grow_frees += rhs.grow_frees;
        self.tracked_allocs += rhs.tracked_allocs;
        self.tracked_frees += rhs.tracked_frees;
        self.tracked_skipped += rhs.tracked_skipped;
        self.track_overflow += rhs.track_overflow;
        self.flushed += rhs.flushed;
    }
}

/// Single-writer counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    /// Increment. Must only be called by the owning worker.
    #[inline]
    pub(crate) fn bump(&self) {
        self.add(1);
    }

    #[inline]
    pub(crate) fn add(&self, n: u64) {
        let v = self.0.load(Ordering::Relaxed);
        self.0.store(v + n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters owned by one worker.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub free_list_hits: Counter,
    pub slow_path_allocs: Counter,
    pub frees_accepted: Counter,
    pub rejected_disabled: Counter,
    pub rejected_not_in_heap: Counter,
    pub rejected_too_small: Counter,
    pub rejected_too_large: Counter,
    pub rejected_side_record: Counter,
    pub rejected_mismatch: Counter,
    pub rejected_not_allocated: Counter,
    pub grow_calls: Counter,
    pub grow_frees: Counter,
    pub tracked_allocs: Counter,
    pub tracked_frees: Counter,
    pub tracked_skipped: Counter,
    pub track_overflow: Counter,
    pub flushed: Counter,
}

impl StatCounters {
    pub(crate) fn reject(&self, reason: RejectReason) {
        match reason {
            RejectReason::Disabled => self.rejected_disabled.bump(),
            RejectReason::NotInHeap => self.rejected_not_in_heap.bump(),
            RejectReason::TooSmall => self.rejected_too_small.bump(),
            RejectReason::TooLarge => self.rejected_too_large.bump(),
            RejectReason::SideRecord => self.rejected_side_record.bump(),
            RejectReason::Mismatch => self.rejected_mismatch.bump(),
            RejectReason::NotAllocated => self.rejected_not_allocated.bump(),
        }
    }

    pub(crate) fn snapshot(&self) -> FreeStats {
        FreeStats {
            free_list_hits: self.free_list_hits.get(),
            slow_path_allocs: self.slow_path_allocs.get(),
            frees_accepted: self.frees_accepted.get(),
            rejected_disabled: self.rejected_disabled.get(),
            rejected_not_in_heap: self.rejected_not_in_heap.get(),
            rejected_too_small: self.rejected_too_small.get(),
            rejected_too_large: self.rejected_too_large.get(),
            rejected_side_record: self.rejected_side_record.get(),
            rejected_mismatch: self.rejected_mismatch.get(),
            rejected_not_allocated: self.rejected_not_allocated.get(),
            grow_calls: self.grow_calls.get(),
            grow_frees: self.grow_frees.get(),
            tracked_allocs: self.tracked_allocs.get(),
            tracked_frees: self.tracked_frees.get(),
            tracked_skipped: self.tracked_skipped.get(),
            track_overflow: self.track_overflow.get(),
            flushed: self.flushed.get(),
        }
    }
}

/// Collector statistics
#[derive(Debug, Default, Clone)]
pub struct CollectorStats {
    /// Number of completed cycles
    pub cycles: u64,
    /// Objects blackened across all cycles
    pub objects_marked: u64,
    /// Objects reclaimed by sweeping across all cycles
    pub objects_swept: u64,
    /// Bytes reclaimed by sweeping across all cycles
    pub bytes_swept: u64,
    /// Bytes reclaimed in the last cycle
    pub last_reclaimed: u64,
    /// Tracked slots zeroed before sweeping
    pub slots_zeroed: u64,
    /// Duration of the last cycle
    pub last_cycle: Duration,
    /// Total time spent in cycles
    pub total_time: Duration,
}
