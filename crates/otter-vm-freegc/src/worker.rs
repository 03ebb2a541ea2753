//! Per-worker allocator context.
//!
//! Each mutator thread owns a [`Worker`]: one free list and one current
//! block per span class. The fast path pops an eagerly freed cell off the
//! free list; the slow path claims a free cell from the current block,
//! refilling from the heap's central partial list or a fresh arena block.

use std::cell::RefCell;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::heap::Heap;
use crate::object::CellState;
use crate::scope::ScopeList;
use crate::size_class::{NUM_SPAN_CLASSES, PointerShape, SizeClass, SpanClass};
use crate::stats::{FreeStats, StatCounters};

/// Worker state visible to the heap and the collector.
pub(crate) struct WorkerShared {
    pub id: usize,
    pub stats: CachePadded<StatCounters>,
    /// Live tracking registries of this worker.
    pub scopes: Mutex<ScopeList>,
}

impl WorkerShared {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            stats: CachePadded::new(StatCounters::default()),
            scopes: Mutex::new(ScopeList::default()),
        }
    }
}

/// A cell owned by a free list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeEntry {
    pub addr: usize,
    pub block: usize,
    pub cell: usize,
}

/// Slow-path position within a block.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    block: usize,
    next: usize,
}

/// Thread-owned allocator context.
///
/// `Send` so it can be handed to a thread, but not `Sync`: free lists are
/// only touched by the owning thread.
pub struct Worker {
    heap: Arc<Heap>,
    shared: Arc<WorkerShared>,
    free_lists: RefCell<Vec<Vec<FreeEntry>>>,
    cursors: RefCell<[Option<Cursor>; NUM_SPAN_CLASSES]>,
}

impl Worker {
    /// Create a worker for a heap
    pub fn new(heap: Arc<Heap>) -> Self {
        let shared = heap.register_worker();
        Self {
            heap,
            shared,
            free_lists: RefCell::new(vec![Vec::new(); NUM_SPAN_CLASSES]),
            cursors: RefCell::new([None; NUM_SPAN_CLASSES]),
        }
    }

    /// Get heap reference
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Worker id, unique within its heap
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// This worker's counters
    pub fn stats(&self) -> FreeStats {
        self.shared.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &StatCounters {
        &self.shared.stats
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Allocate a zeroed object of `class`.
    ///
    /// Never fails: exhausting the arena aborts through the host
    /// out-of-memory handler.
    pub fn allocate(&self, class: SizeClass, shape: PointerShape) -> usize {
        let span = SpanClass::new(class, shape);
        if let Some(addr) = self.pop_free(span) {
            return addr;
        }
        self.allocate_slow(span)
    }

    /// Allocate at least `size` zeroed bytes. Sizes above the largest class
    /// become large objects.
    pub fn allocate_bytes(&self, size: usize, shape: PointerShape) -> usize {
        match SizeClass::for_size(size) {
            Some(class) => self.allocate(class, shape),
            None => {
                self.counters().slow_path_allocs.bump();
                self.heap.allocate_large(size, shape)
            }
        }
    }

    fn pop_free(&self, span: SpanClass) -> Option<usize> {
        let entry = self.free_lists.borrow_mut()[span.index()].pop()?;
        let block = self.heap.block(entry.block)?;
        let header = block.cell(entry.cell);
        debug_assert_eq!(header.state(), CellState::Cached);

        self.heap.publish_object(header, entry.addr, block.cell_size());
        self.counters().free_list_hits.bump();
        Some(entry.addr)
    }

    #[cold]
    fn allocate_slow(&self, span: SpanClass) -> usize {
        loop {
            let cursor = self.cursors.borrow()[span.index()];
            if let Some(Cursor { block: index, next }) = cursor
                && let Some(block) = self.heap.block(index)
                && let Some(cell) = block.claim_free(next)
            {
                self.cursors.borrow_mut()[span.index()] = Some(Cursor {
                    block: index,
                    next: cell + 1,
                });

                let size = block.cell_size();
                let addr = self.heap.block_base(index) + cell * size;
                self.heap.publish_object(block.cell(cell), addr, size);
                self.heap.note_allocation(size);
                self.counters().slow_path_allocs.bump();
                return addr;
            }

            let index = self.heap.refill(span);
            self.cursors.borrow_mut()[span.index()] = Some(Cursor {
                block: index,
                next: 0,
            });
        }
    }

    /// Hand a cell the caller just moved to `Cached` to this worker.
    pub(crate) fn push_free(&self, span: SpanClass, entry: FreeEntry) {
        self.free_lists.borrow_mut()[span.index()].push(entry);
    }

    /// Cells currently parked in this worker's free lists.
    pub fn free_list_len(&self) -> usize {
        self.free_lists.borrow().iter().map(Vec::len).sum()
    }

    /// Free-list length for one span class.
    pub fn free_list_len_for(&self, class: SizeClass, shape: PointerShape) -> usize {
        self.free_lists.borrow()[SpanClass::new(class, shape).index()].len()
    }

    /// Store word `index` of `obj`, shading `value` while the collector is
    /// marking.
    ///
    /// # Safety
    /// `obj` must be a live object of this worker's heap holding more than
    /// `index` words.
    pub unsafe fn write_word(&self, obj: usize, index: usize, value: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.heap.store_word(obj, index, value) }
    }

    /// Return cached cells to their blocks and release the current blocks.
    fn flush(&mut self) {
        let mut flushed = 0u64;
        for list in self.free_lists.get_mut().iter_mut() {
            for entry in list.drain(..) {
                let Some(block) = self.heap.block(entry.block) else {
                    continue;
                };
                if block.cell(entry.cell).transition(CellState::Cached, CellState::Free) {
                    flushed += 1;
                    self.heap.return_partial(entry.block);
                }
            }
        }

        for cursor in self.cursors.get_mut().iter_mut() {
            if let Some(Cursor { block, .. }) = cursor.take()
                && self.heap.block(block).is_some_and(|b| b.has_free())
            {
                self.heap.return_partial(block);
            }
        }

        self.counters().flushed.add(flushed);
        tracing::debug!(
            target: "otter::freegc",
            worker = self.shared.id,
            flushed,
            "worker flushed"
        );
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.flush();
        self.heap.retire_worker(&self.shared);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("free_list_len", &self.free_list_len())
            .finish()
    }
}
