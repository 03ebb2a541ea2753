//! Eager free.
//!
//! Returns an object the caller has proven dead straight to the worker's free
//! list, without waiting for the collector. Every check failure is a silent
//! rejection: the object is simply left for the collector.
//!
//! Cooperation with a concurrent cycle rests on three facts:
//!
//! - the collector only scans and the sweeper only frees `Allocated` cells,
//!   and a freed cell is `Cached` until it is reused
//! - reuse sets the allocation color before publishing, so a stale gray
//!   entry for the old object finds a black one and is skipped
//! - reuse zeroes the memory with word stores before publishing

use crate::block::BlockKind;
use crate::error::RejectReason;
use crate::object::{CellState, flags};
use crate::size_class::PointerShape;
use crate::worker::{FreeEntry, Worker};

impl Worker {
    /// Try to reclaim the object at `addr` right away.
    ///
    /// The caller must be the sole owner of the object and must not touch it
    /// again. `size` and `shape` are what the caller allocated it with.
    /// Returns whether the object was reclaimed; the result is informational.
    pub fn try_free(&self, addr: usize, size: usize, shape: PointerShape) -> bool {
        match self.reclaim(addr, size, Some(shape)) {
            Ok(()) => {
                self.counters().frees_accepted.bump();
                true
            }
            Err(reason) => {
                self.counters().reject(reason);
                tracing::trace!(
                    target: "otter::freegc",
                    addr = format_args!("{addr:#x}"),
                    size,
                    reason = reason.as_str(),
                    "eager free declined"
                );
                false
            }
        }
    }

    /// Eager free of an object this worker allocated itself, using the
    /// size and shape recorded in its block.
    pub(crate) fn free_owned(&self, addr: usize) -> bool {
        let size = match self.heap().locate(addr) {
            Some(cell) => cell.size(),
            None => 0,
        };
        match self.reclaim(addr, size, None) {
            Ok(()) => {
                self.counters().frees_accepted.bump();
                true
            }
            Err(reason) => {
                self.counters().reject(reason);
                false
            }
        }
    }

    fn reclaim(
        &self,
        addr: usize,
        size: usize,
        shape: Option<PointerShape>,
    ) -> Result<(), RejectReason> {
        let heap = self.heap();
        let config = heap.config();
        if !config.eager_free {
            return Err(RejectReason::Disabled);
        }
        if !heap.contains(addr) {
            return Err(RejectReason::NotInHeap);
        }
        if size < config.min_free_size {
            return Err(RejectReason::TooSmall);
        }
        if size > config.max_free_size {
            return Err(RejectReason::TooLarge);
        }

        let cell = heap.locate(addr).ok_or(RejectReason::NotInHeap)?;
        let BlockKind::Small { span, cell_size } = cell.block.kind() else {
            return Err(RejectReason::TooLarge);
        };
        if size > cell_size || shape.is_some_and(|shape| shape != span.shape()) {
            return Err(RejectReason::Mismatch);
        }

        let header = cell.header();
        if header.has_flag(flags::HAS_SIDE_RECORD) {
            return Err(RejectReason::SideRecord);
        }
        if !header.transition(CellState::Allocated, CellState::Cached) {
            return Err(RejectReason::NotAllocated);
        }

        self.push_free(
            span,
            FreeEntry {
                addr,
                block: cell.block_index,
                cell: cell.index,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HeapConfig;
    use crate::error::RejectReason;
    use crate::heap::Heap;
    use crate::object::{CellState, MarkColor};
    use crate::size_class::{BLOCK_SIZE, PointerShape, SizeClass};
    use crate::worker::Worker;

    fn worker_with(config: HeapConfig) -> Worker {
        Worker::new(Heap::with_config(config).unwrap())
    }

    fn worker() -> Worker {
        worker_with(HeapConfig::with_arena_size(64 * BLOCK_SIZE))
    }

    fn class(size: usize) -> SizeClass {
        SizeClass::for_size(size).unwrap()
    }

    #[test]
    fn test_free_then_reuse_same_address() {
        let worker = worker();
        let obj = worker.allocate(class(64), PointerShape::NoScan);
        assert!(worker.try_free(obj, 64, PointerShape::NoScan));
        assert_eq!(
            worker.heap().object_info(obj).unwrap().state,
            CellState::Cached
        );

        let again = worker.allocate(class(64), PointerShape::NoScan);
        assert_eq!(again, obj);
        let stats = worker.stats();
        assert_eq!(stats.free_list_hits, 1);
        assert_eq!(stats.frees_accepted, 1);
    }

    #[test]
    fn test_reuse_is_fresh() {
        let worker = worker();
        let obj = worker.allocate(class(32), PointerShape::Scan);
        unsafe { worker.write_word(obj, 1, 77) };
        assert!(worker.heap().attach_cleanup(obj, || {}));
        assert!(!worker.try_free(obj, 32, PointerShape::Scan));
        assert_eq!(worker.stats().rejected_side_record, 1);

        let plain = worker.allocate(class(32), PointerShape::Scan);
        unsafe { worker.write_word(plain, 3, 99) };
        assert!(worker.try_free(plain, 32, PointerShape::Scan));

        let reused = worker.allocate(class(32), PointerShape::Scan);
        assert_eq!(reused, plain);
        let info = worker.heap().object_info(reused).unwrap();
        assert!(!info.has_side_record);
        assert_eq!(info.color, MarkColor::White);
        for i in 0..4 {
            assert_eq!(unsafe { worker.heap().read_word(reused, i) }, 0);
        }
    }

    #[test]
    fn test_rejections() {
        let worker = worker();
        let obj = worker.allocate(class(64), PointerShape::NoScan);
        let stack_slot = 0usize;

        let cases = [
            (&stack_slot as *const usize as usize, 64, PointerShape::NoScan, RejectReason::NotInHeap),
            (obj, 8, PointerShape::NoScan, RejectReason::TooSmall),
            (obj, 9000, PointerShape::NoScan, RejectReason::TooLarge),
            (obj + 16, 32, PointerShape::NoScan, RejectReason::NotInHeap),
            (obj, 96, PointerShape::NoScan, RejectReason::Mismatch),
            (obj, 64, PointerShape::Scan, RejectReason::Mismatch),
        ];
        for (addr, size, shape, reason) in cases {
            assert!(!worker.try_free(addr, size, shape), "{reason:?}");
            assert!(worker.stats().rejected_for(reason) > 0, "{reason:?}");
        }
        assert_eq!(
            worker.heap().object_info(obj).unwrap().state,
            CellState::Allocated
        );
    }

    #[test]
    fn test_double_free_rejected() {
        let worker = worker();
        let obj = worker.allocate(class(48), PointerShape::NoScan);
        assert!(worker.try_free(obj, 48, PointerShape::NoScan));
        assert!(!worker.try_free(obj, 48, PointerShape::NoScan));
        assert_eq!(worker.stats().rejected_not_allocated, 1);
        assert_eq!(worker.free_list_len(), 1);
    }

    #[test]
    fn test_large_objects_rejected() {
        let config = HeapConfig {
            max_free_size: 8192,
            ..HeapConfig::with_arena_size(64 * BLOCK_SIZE)
        };
        let worker = worker_with(config);
        let obj = worker.allocate_bytes(BLOCK_SIZE, PointerShape::NoScan);
        assert!(!worker.try_free(obj, 8192, PointerShape::NoScan));
        assert_eq!(worker.stats().rejected_too_large, 1);
    }

    #[test]
    fn test_disabled() {
        let config = HeapConfig {
            eager_free: false,
            ..HeapConfig::with_arena_size(64 * BLOCK_SIZE)
        };
        let worker = worker_with(config);
        let obj = worker.allocate(class(64), PointerShape::NoScan);
        assert!(!worker.try_free(obj, 64, PointerShape::NoScan));
        assert_eq!(worker.stats().rejected_disabled, 1);
    }

    #[test]
    fn test_smaller_size_within_cell_accepted() {
        let worker = worker();
        let obj = worker.allocate(class(60), PointerShape::NoScan);
        assert!(worker.try_free(obj, 60, PointerShape::NoScan));
    }

    #[test]
    fn test_free_owned_uses_block_metadata() {
        let worker = worker();
        let obj = worker.allocate(class(128), PointerShape::Scan);
        assert!(worker.free_owned(obj));
        assert!(!worker.free_owned(obj));
        assert!(!worker.free_owned(0));
    }
}
