//! Object metadata.
//!
//! Headers are stored out of line, one [`CellHeader`] per cell in the owning
//! block's metadata, so an object's address is the start of its cell and the
//! whole cell is usable payload.

use std::sync::atomic::{AtomicU8, Ordering};

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned (or allocated during a cycle)
    Black = 2,
}

impl From<u8> for MarkColor {
    fn from(v: u8) -> Self {
        match v {
            0 => MarkColor::White,
            1 => MarkColor::Gray,
            _ => MarkColor::Black,
        }
    }
}

/// Lifecycle state of a cell.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Available to slow-path allocation.
    Free = 0,
    /// Claimed by an allocation that has not published it yet.
    Init = 1,
    /// Live object.
    Allocated = 2,
    /// Eagerly freed; owned by exactly one worker free list.
    Cached = 3,
}

impl From<u8> for CellState {
    fn from(v: u8) -> Self {
        match v {
            0 => CellState::Free,
            1 => CellState::Init,
            2 => CellState::Allocated,
            _ => CellState::Cached,
        }
    }
}

/// Flag bits stored in [`CellHeader`].
pub mod flags {
    /// A finalizer or cleanup is attached.
    pub const HAS_SIDE_RECORD: u8 = 1 << 0;
}

/// Per-cell header: state, mark color and flags.
///
/// Every field is a single byte updated atomically; state transitions use
/// compare-and-swap so that exactly one of the allocator, the eager free path
/// and the sweeper wins any given cell.
#[derive(Debug)]
pub struct CellHeader {
    state: AtomicU8,
    mark: AtomicU8,
    flags: AtomicU8,
}

impl CellHeader {
    /// A free, white, flagless cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(CellState::Free as u8),
            mark: AtomicU8::new(MarkColor::White as u8),
            flags: AtomicU8::new(0),
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> CellState {
        CellState::from(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `from` to `to`. Returns false if the cell was not
    /// in `from`.
    #[inline]
    pub fn transition(&self, from: CellState, to: CellState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish the cell in `state`. Only the current owner of the cell may
    /// call this.
    #[inline]
    pub(crate) fn publish(&self, state: CellState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Get mark color
    #[inline]
    pub fn mark(&self) -> MarkColor {
        MarkColor::from(self.mark.load(Ordering::Acquire))
    }

    /// Set mark color
    #[inline]
    pub fn set_mark(&self, color: MarkColor) {
        self.mark.store(color as u8, Ordering::Release);
    }

    /// Atomically move the mark color from `from` to `to`.
    #[inline]
    pub fn transition_mark(&self, from: MarkColor, to: MarkColor) -> bool {
        self.mark
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether any bit of `flag` is set.
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Set `flag`.
    #[inline]
    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Clear `flag`.
    #[inline]
    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Reset color and flags for a freshly handed-out object.
    ///
    /// The caller must own the cell (state `Init` or `Cached`).
    #[inline]
    pub(crate) fn reinit(&self, color: MarkColor) {
        self.flags.store(0, Ordering::Relaxed);
        self.mark.store(color as u8, Ordering::Relaxed);
    }
}

impl Default for CellHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of an object's metadata, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object address (start of the cell).
    pub addr: usize,
    /// Usable size in bytes.
    pub size: usize,
    /// Pointer shape of the owning block or large object.
    pub shape: crate::PointerShape,
    /// Cell state.
    pub state: CellState,
    /// Mark color.
    pub color: MarkColor,
    /// Whether a side record is attached.
    pub has_side_record: bool,
    /// True for objects carved as a block run.
    pub large: bool,
}
