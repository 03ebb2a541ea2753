//! Block metadata.
//!
//! The arena is divided into 16KB blocks. A small-object block is dedicated
//! to a single span class for its whole life; its cells are tracked by an
//! out-of-line [`CellHeader`] array. A large object occupies a run of blocks
//! whose first block carries the run length and a single header.
//!
//! ## Layout
//!
//! ```text
//! arena block (16KB)                  BlockMeta (separate allocation)
//! ┌──────────────────────────────┐    ┌──────────────────────────────┐
//! │ Cell 0: [u8; cell_size]      │    │ kind: Small { span, size }   │
//! │ Cell 1: [u8; cell_size]      │    │ cells: [CellHeader; K]       │
//! │ ...                          │    │ queued: in central list?     │
//! │ Cell K: [u8; cell_size]      │    └──────────────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! Nothing here takes a lock: allocation, eager free and sweeping race on
//! cell states through [`CellHeader::transition`].

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::object::{CellHeader, CellState, MarkColor, flags};
use crate::size_class::{BLOCK_SIZE, PointerShape, SpanClass};

/// What a block is used for. Fixed once the block is first carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// Fixed-size cells of one span class.
    Small {
        /// Span class of every cell.
        span: SpanClass,
        /// Cell size in bytes.
        cell_size: usize,
    },
    /// Part of a large-object block run.
    Large,
}

/// What the sweeper should do with an unmarked object carrying side records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SideRecordVerdict {
    /// Keep the object allocated for another cycle.
    Keep,
    /// Free the object.
    Free,
}

/// Result of sweeping one block.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepOutcome {
    /// Cells returned to `Free`.
    pub cells: usize,
    /// Bytes returned to `Free`.
    pub bytes: usize,
}

/// Per-block metadata.
pub(crate) struct BlockMeta {
    kind: BlockKind,
    cells: Box<[CellHeader]>,
    /// Whether the block sits in its span class's central partial list.
    queued: AtomicBool,
    /// Large runs: number of blocks at the head, 0 on tails and free blocks.
    run_len: AtomicUsize,
    /// Large runs: pointer shape of the current object.
    large_shape: AtomicU8,
}

impl BlockMeta {
    /// Metadata for a small-object block of `span`.
    pub(crate) fn small(span: SpanClass) -> Self {
        let cell_size = span.size_class().size();
        debug_assert!(cell_size >= 16 && cell_size.is_multiple_of(8));
        let num_cells = BLOCK_SIZE / cell_size;
        Self {
            kind: BlockKind::Small { span, cell_size },
            cells: (0..num_cells).map(|_| CellHeader::new()).collect(),
            queued: AtomicBool::new(false),
            run_len: AtomicUsize::new(0),
            large_shape: AtomicU8::new(PointerShape::NoScan as u8),
        }
    }

    /// Metadata for a block that belongs to large-object runs.
    pub(crate) fn large() -> Self {
        Self {
            kind: BlockKind::Large,
            cells: vec![CellHeader::new()].into_boxed_slice(),
            queued: AtomicBool::new(false),
            run_len: AtomicUsize::new(0),
            large_shape: AtomicU8::new(PointerShape::NoScan as u8),
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Span class of a small-object block.
    #[inline]
    pub(crate) fn span_class(&self) -> Option<SpanClass> {
        match self.kind {
            BlockKind::Small { span, .. } => Some(span),
            BlockKind::Large => None,
        }
    }

    /// Usable bytes of one object in this block.
    #[inline]
    pub(crate) fn cell_size(&self) -> usize {
        match self.kind {
            BlockKind::Small { cell_size, .. } => cell_size,
            BlockKind::Large => self.run_len() * BLOCK_SIZE,
        }
    }

    /// Pointer shape of objects in this block.
    #[inline]
    pub(crate) fn shape(&self) -> PointerShape {
        match self.kind {
            BlockKind::Small { span, .. } => span.shape(),
            BlockKind::Large => PointerShape::from_bits(self.large_shape.load(Ordering::Acquire)),
        }
    }

    #[inline]
    pub(crate) fn num_cells(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub(crate) fn cell(&self, index: usize) -> &CellHeader {
        &self.cells[index]
    }

    /// Cell index for a byte offset into the block, if it starts a cell.
    #[inline]
    pub(crate) fn cell_index(&self, offset: usize) -> Option<usize> {
        match self.kind {
            BlockKind::Small { cell_size, .. } => {
                if !offset.is_multiple_of(cell_size) {
                    return None;
                }
                let index = offset / cell_size;
                (index < self.cells.len()).then_some(index)
            }
            BlockKind::Large => (offset == 0 && self.run_len() > 0).then_some(0),
        }
    }

    #[inline]
    pub(crate) fn run_len(&self) -> usize {
        self.run_len.load(Ordering::Acquire)
    }

    pub(crate) fn set_run(&self, run_len: usize, shape: PointerShape) {
        self.large_shape.store(shape as u8, Ordering::Release);
        self.run_len.store(run_len, Ordering::Release);
    }

    /// Mark the block as sitting in the central list. Returns false if it
    /// already was.
    #[inline]
    pub(crate) fn try_enqueue(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn dequeued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Claim the first free cell at or after `from`, moving it to `Init`.
    pub(crate) fn claim_free(&self, from: usize) -> Option<usize> {
        (from..self.cells.len()).find(|&idx| {
            let cell = &self.cells[idx];
            cell.state() == CellState::Free && cell.transition(CellState::Free, CellState::Init)
        })
    }

    /// Whether any cell is currently free.
    pub(crate) fn has_free(&self) -> bool {
        self.cells.iter().any(|c| c.state() == CellState::Free)
    }

    /// Reset every cell to white ahead of a marking phase.
    pub(crate) fn reset_marks(&self) {
        for cell in self.cells.iter() {
            cell.set_mark(MarkColor::White);
        }
    }

    /// Sweep a small-object block whose first cell lives at `base`.
    ///
    /// White `Allocated` cells are returned to `Free`. Cells flagged with
    /// side records are handed to `side_records`, which decides whether the
    /// object survives. `Init` and `Cached` cells are never touched.
    pub(crate) fn sweep_small(
        &self,
        base: usize,
        side_records: &mut dyn FnMut(usize) -> SideRecordVerdict,
    ) -> SweepOutcome {
        let cell_size = self.cell_size();
        let mut outcome = SweepOutcome::default();

        for (idx, cell) in self.cells.iter().enumerate() {
            if cell.state() != CellState::Allocated || cell.mark() != MarkColor::White {
                continue;
            }
            if cell.has_flag(flags::HAS_SIDE_RECORD)
                && side_records(base + idx * cell_size) == SideRecordVerdict::Keep
            {
                continue;
            }
            if cell.transition(CellState::Allocated, CellState::Free) {
                outcome.cells += 1;
                outcome.bytes += cell_size;
            }
        }

        outcome
    }

    /// Count cells per state: (allocated, cached, free).
    pub(crate) fn census(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for cell in self.cells.iter() {
            match cell.state() {
                CellState::Allocated | CellState::Init => counts.0 += 1,
                CellState::Cached => counts.1 += 1,
                CellState::Free => counts.2 += 1,
            }
        }
        counts
    }
}

impl std::fmt::Debug for BlockMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMeta")
            .field("kind", &self.kind)
            .field("cells", &self.num_cells())
            .field("run_len", &self.run_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClass;

    fn span(size: usize, shape: PointerShape) -> SpanClass {
        SpanClass::new(SizeClass::for_size(size).unwrap(), shape)
    }

    fn allocate(block: &BlockMeta, from: usize) -> usize {
        let idx = block.claim_free(from).unwrap();
        block.cell(idx).publish(CellState::Allocated);
        idx
    }

    #[test]
    fn test_small_block_creation() {
        let block = BlockMeta::small(span(64, PointerShape::NoScan));
        assert_eq!(block.cell_size(), 64);
        assert_eq!(block.num_cells(), BLOCK_SIZE / 64);
        assert_eq!(block.shape(), PointerShape::NoScan);
        assert!(block.has_free());
    }

    #[test]
    fn test_non_power_of_two_class_leaves_tail() {
        let block = BlockMeta::small(span(48, PointerShape::Scan));
        assert_eq!(block.num_cells(), BLOCK_SIZE / 48);
        // The tail past the last whole cell is not addressable
        assert_eq!(block.cell_index(block.num_cells() * 48), None);
    }

    #[test]
    fn test_claim_free_is_sequential() {
        let block = BlockMeta::small(span(32, PointerShape::NoScan));
        assert_eq!(allocate(&block, 0), 0);
        assert_eq!(allocate(&block, 0), 1);
        assert_eq!(block.cell(0).state(), CellState::Allocated);
    }

    #[test]
    fn test_cell_index_rejects_interior_offsets() {
        let block = BlockMeta::small(span(64, PointerShape::NoScan));
        assert_eq!(block.cell_index(0), Some(0));
        assert_eq!(block.cell_index(128), Some(2));
        assert_eq!(block.cell_index(130), None);
    }

    #[test]
    fn test_sweep_frees_white_only() {
        let block = BlockMeta::small(span(64, PointerShape::NoScan));
        let a = allocate(&block, 0);
        let b = allocate(&block, 0);
        block.cell(a).set_mark(MarkColor::Black);

        let outcome = block.sweep_small(0, &mut |_| SideRecordVerdict::Free);
        assert_eq!(outcome.cells, 1);
        assert_eq!(outcome.bytes, 64);
        assert_eq!(block.cell(a).state(), CellState::Allocated);
        assert_eq!(block.cell(b).state(), CellState::Free);

        // The freed slot is handed out again
        assert_eq!(block.claim_free(0), Some(b));
    }

    #[test]
    fn test_sweep_skips_cached_cells() {
        let block = BlockMeta::small(span(64, PointerShape::NoScan));
        let a = allocate(&block, 0);
        assert!(block.cell(a).transition(CellState::Allocated, CellState::Cached));

        let outcome = block.sweep_small(0, &mut |_| SideRecordVerdict::Free);
        assert_eq!(outcome.cells, 0);
        assert_eq!(block.cell(a).state(), CellState::Cached);
    }

    #[test]
    fn test_sweep_consults_side_records() {
        let block = BlockMeta::small(span(64, PointerShape::NoScan));
        let a = allocate(&block, 0);
        block.cell(a).set_flag(flags::HAS_SIDE_RECORD);

        let mut seen = Vec::new();
        let outcome = block.sweep_small(4096, &mut |addr| {
            seen.push(addr);
            SideRecordVerdict::Keep
        });
        assert_eq!(outcome.cells, 0);
        assert_eq!(seen, vec![4096 + a * 64]);
        assert_eq!(block.cell(a).state(), CellState::Allocated);
    }

    #[test]
    fn test_large_block_run() {
        let block = BlockMeta::large();
        assert_eq!(block.cell_index(0), None);
        block.set_run(3, PointerShape::Scan);
        assert_eq!(block.cell_index(0), Some(0));
        assert_eq!(block.cell_size(), 3 * BLOCK_SIZE);
        assert_eq!(block.shape(), PointerShape::Scan);
    }

    #[test]
    fn test_enqueue_once() {
        let block = BlockMeta::small(span(16, PointerShape::NoScan));
        assert!(block.try_enqueue());
        assert!(!block.try_enqueue());
        block.dequeued();
        assert!(block.try_enqueue());
    }

    #[test]
    fn test_census() {
        let block = BlockMeta::small(span(4096, PointerShape::NoScan));
        let a = allocate(&block, 0);
        allocate(&block, 0);
        assert!(block.cell(a).transition(CellState::Allocated, CellState::Cached));
        assert_eq!(block.census(), (1, 1, 2));
    }
}
