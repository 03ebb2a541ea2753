//! The shared heap: arena, block metadata, central lists and side tables.
//!
//! A heap reserves one contiguous arena up front and hands it out block by
//! block. Small-object blocks are carved from the arena's bump pointer and
//! keep their span class forever; large objects are block runs that return
//! to the page heap when swept.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::block::{BlockKind, BlockMeta, SideRecordVerdict, SweepOutcome};
use crate::config::HeapConfig;
use crate::error::ConfigError;
use crate::object::{CellHeader, CellState, MarkColor, ObjectInfo, flags};
use crate::phase::{CollectorState, GcPhase, PhaseObserver, PhaseTransition};
use crate::scope::TrackedSlotInvalidator;
use crate::side_record::{SideRecord, SideTable};
use crate::size_class::{BLOCK_SHIFT, BLOCK_SIZE, NUM_SPAN_CLASSES, PointerShape, SpanClass};
use crate::stats::FreeStats;
use crate::worker::WorkerShared;

/// Bytes per heap word.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();

/// The reserved arena.
struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn reserve(layout: Layout) -> Self {
        // SAFETY: the layout has a non-zero size (validated config).
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout)
        };
        Self { base, layout }
    }

    #[inline]
    fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    fn end(&self) -> usize {
        self.start() + self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in `reserve` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

// SAFETY: the arena is only accessed through atomics or by the unique owner
// of a cell.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// A run of free blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRun {
    start: usize,
    len: usize,
}

/// Block-granular arena bookkeeping.
#[derive(Debug)]
struct PageHeap {
    /// First never-carved block.
    next: usize,
    /// Number of blocks in the arena.
    limit: usize,
    /// Released large-object runs, sorted by start and coalesced.
    free_runs: Vec<BlockRun>,
}

impl PageHeap {
    fn new(limit: usize) -> Self {
        Self {
            next: 0,
            limit,
            free_runs: Vec::new(),
        }
    }

    /// Fresh blocks from the bump pointer.
    fn bump(&mut self, len: usize) -> Option<usize> {
        if self.limit - self.next < len {
            return None;
        }
        let start = self.next;
        self.next += len;
        Some(start)
    }

    /// A run for a large object: first fit among released runs, then bump.
    fn carve_run(&mut self, len: usize) -> Option<usize> {
        if let Some(pos) = self.free_runs.iter().position(|run| run.len >= len) {
            let run = &mut self.free_runs[pos];
            let start = run.start;
            if run.len == len {
                self.free_runs.remove(pos);
            } else {
                run.start += len;
                run.len -= len;
            }
            return Some(start);
        }
        self.bump(len)
    }

    fn release(&mut self, start: usize, len: usize) {
        let pos = self.free_runs.partition_point(|run| run.start < start);
        self.free_runs.insert(pos, BlockRun { start, len });

        // Merge with the following run, then with the preceding one.
        if pos + 1 < self.free_runs.len()
            && self.free_runs[pos].start + self.free_runs[pos].len == self.free_runs[pos + 1].start
        {
            self.free_runs[pos].len += self.free_runs[pos + 1].len;
            self.free_runs.remove(pos + 1);
        }
        if pos > 0
            && self.free_runs[pos - 1].start + self.free_runs[pos - 1].len == self.free_runs[pos].start
        {
            self.free_runs[pos - 1].len += self.free_runs[pos].len;
            self.free_runs.remove(pos);
        }
    }

    fn free_blocks(&self) -> usize {
        self.free_runs.iter().map(|run| run.len).sum()
    }
}

/// A resolved object start.
#[derive(Clone, Copy)]
pub(crate) struct CellRef<'h> {
    pub block: &'h BlockMeta,
    pub block_index: usize,
    pub index: usize,
    pub addr: usize,
}

impl<'h> CellRef<'h> {
    #[inline]
    pub(crate) fn header(&self) -> &'h CellHeader {
        self.block.cell(self.index)
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.block.cell_size()
    }

    #[inline]
    pub(crate) fn shape(&self) -> PointerShape {
        self.block.shape()
    }

    #[inline]
    pub(crate) fn is_large(&self) -> bool {
        self.block.kind() == BlockKind::Large
    }
}

/// Heap-wide occupancy snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapCensus {
    /// Blocks ever carved from the arena
    pub blocks_carved: usize,
    /// Blocks dedicated to small objects
    pub small_blocks: usize,
    /// Small objects allocated or being initialized
    pub allocated_cells: usize,
    /// Small objects sitting in worker free lists
    pub cached_cells: usize,
    /// Small cells available to the slow path
    pub free_cells: usize,
    /// Live large objects
    pub large_objects: usize,
    /// Bytes held by live large objects
    pub large_bytes: usize,
    /// Blocks in released large-object runs
    pub free_large_blocks: usize,
}

/// Main heap, shared between workers and the collector.
pub struct Heap {
    config: HeapConfig,
    arena: Arena,
    blocks: Box<[OnceLock<BlockMeta>]>,
    pages: Mutex<PageHeap>,
    /// Per span class: small blocks that have free cells.
    central: Box<[CachePadded<Mutex<Vec<usize>>>]>,
    state: CollectorState,
    side_records: SideTable,
    /// Values stored by write barriers while marking.
    barrier: Mutex<Vec<usize>>,
    workers: Mutex<Vec<Arc<WorkerShared>>>,
    /// Counters of workers that have exited.
    retired: Mutex<FreeStats>,
    next_worker_id: AtomicUsize,
    bytes_since_cycle: AtomicUsize,
    slots_zeroed: AtomicU64,
    collector_attached: AtomicBool,
}

impl Heap {
    /// Create a heap with the default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(HeapConfig::default()).expect("default heap config is valid")
    }

    /// Create a heap with a custom configuration.
    pub fn with_config(config: HeapConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let layout = Layout::from_size_align(config.arena_size, BLOCK_SIZE).map_err(|_| {
            ConfigError::ArenaSize {
                size: config.arena_size,
                block_size: BLOCK_SIZE,
            }
        })?;

        let num_blocks = config.arena_blocks();
        let heap = Arc::new(Self {
            arena: Arena::reserve(layout),
            blocks: (0..num_blocks).map(|_| OnceLock::new()).collect(),
            pages: Mutex::new(PageHeap::new(num_blocks)),
            central: (0..NUM_SPAN_CLASSES)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            state: CollectorState::new(),
            side_records: SideTable::new(),
            barrier: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(FreeStats::default()),
            next_worker_id: AtomicUsize::new(0),
            bytes_since_cycle: AtomicUsize::new(0),
            slots_zeroed: AtomicU64::new(0),
            collector_attached: AtomicBool::new(false),
            config,
        });
        heap.state.add_observer(Arc::new(TrackedSlotInvalidator));

        tracing::debug!(
            target: "otter::freegc",
            arena_size = heap.config.arena_size,
            blocks = num_blocks,
            eager_free = heap.config.eager_free,
            "heap created"
        );
        Ok(heap)
    }

    /// Get config
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Collector cooperation state
    pub fn state(&self) -> &CollectorState {
        &self.state
    }

    /// Current collector phase
    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.state.phase()
    }

    /// Current collector epoch
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.state.epoch()
    }

    /// Register a hook for phase transitions
    pub fn add_phase_observer(&self, observer: Arc<dyn PhaseObserver>) {
        self.state.add_observer(observer);
    }

    pub(crate) fn advance_phase(&self) -> PhaseTransition {
        self.state.advance(self)
    }

    /// Whether `addr` lies inside the arena.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.arena.start() && addr < self.arena.end()
    }

    #[inline]
    pub(crate) fn block(&self, index: usize) -> Option<&BlockMeta> {
        self.blocks.get(index)?.get()
    }

    #[inline]
    pub(crate) fn block_base(&self, index: usize) -> usize {
        self.arena.start() + (index << BLOCK_SHIFT)
    }

    /// Resolve the start of an object. Interior pointers, unused blocks and
    /// large-run tails resolve to nothing.
    pub(crate) fn locate(&self, addr: usize) -> Option<CellRef<'_>> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.arena.start();
        let block_index = offset >> BLOCK_SHIFT;
        let block = self.block(block_index)?;
        let index = block.cell_index(offset & (BLOCK_SIZE - 1))?;
        Some(CellRef {
            block,
            block_index,
            index,
            addr,
        })
    }

    /// Inspect the object starting at `addr`.
    pub fn object_info(&self, addr: usize) -> Option<ObjectInfo> {
        let cell = self.locate(addr)?;
        let header = cell.header();
        Some(ObjectInfo {
            addr,
            size: cell.size(),
            shape: cell.shape(),
            state: header.state(),
            color: header.mark(),
            has_side_record: header.has_flag(flags::HAS_SIDE_RECORD),
            large: cell.is_large(),
        })
    }

    /// Whether `addr` is an allocated object the current cycle has reached.
    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        self.locate(addr).is_some_and(|cell| {
            let header = cell.header();
            header.state() == CellState::Allocated && header.mark() != MarkColor::White
        })
    }

    // ---------------------------------------------------------------------
    // Allocation support
    // ---------------------------------------------------------------------

    /// Reset and publish a cell the caller owns (`Init` or `Cached`).
    ///
    /// Memory is zeroed with word stores so that a concurrent conservative
    /// scan reads either old words or zeros, then the allocation color is
    /// set before the object becomes `Allocated`.
    pub(crate) fn publish_object(&self, header: &CellHeader, addr: usize, size: usize) {
        debug_assert!(matches!(header.state(), CellState::Init | CellState::Cached));
        // SAFETY: the caller owns the cell, which spans `size` bytes.
        unsafe { self.zero_words(addr, size) };

        let epoch = self.state.epoch();
        header.reinit(self.state.allocation_color());
        header.publish(CellState::Allocated);

        // A cycle started while we were publishing: never let it see white.
        if self.state.epoch() != epoch {
            header.set_mark(MarkColor::Black);
        }
    }

    /// Next block with free cells for `span`: central partial list first,
    /// then a fresh block from the arena.
    pub(crate) fn refill(&self, span: SpanClass) -> usize {
        let partial = self.central[span.index()].lock().pop();
        if let Some(index) = partial {
            if let Some(block) = self.block(index) {
                block.dequeued();
            }
            tracing::debug!(
                target: "otter::freegc",
                block = index,
                size = span.size_class().size(),
                shape = ?span.shape(),
                "refilled from partial list"
            );
            return index;
        }
        self.carve_small(span)
    }

    fn carve_small(&self, span: SpanClass) -> usize {
        let carved = self.pages.lock().bump(1);
        let index = carved.unwrap_or_else(|| self.out_of_memory(BLOCK_SIZE));
        let block = self.blocks[index].get_or_init(|| BlockMeta::small(span));
        debug_assert_eq!(block.span_class(), Some(span));

        tracing::debug!(
            target: "otter::freegc",
            block = index,
            size = span.size_class().size(),
            shape = ?span.shape(),
            "carved block"
        );
        index
    }

    /// Put a small block back in its central partial list.
    pub(crate) fn return_partial(&self, index: usize) {
        let Some(block) = self.block(index) else {
            return;
        };
        let Some(span) = block.span_class() else {
            return;
        };
        if block.try_enqueue() {
            self.central[span.index()].lock().push(index);
        }
    }

    /// Carve a large object of `size` bytes as a run of blocks.
    pub(crate) fn allocate_large(&self, size: usize, shape: PointerShape) -> usize {
        let len = size.max(1).div_ceil(BLOCK_SIZE);
        let carved = self.pages.lock().carve_run(len);
        let start = carved.unwrap_or_else(|| self.out_of_memory(len * BLOCK_SIZE));

        for index in start + 1..start + len {
            self.blocks[index].get_or_init(BlockMeta::large);
        }
        let head = self.blocks[start].get_or_init(BlockMeta::large);
        debug_assert_eq!(head.kind(), BlockKind::Large);

        let header = head.cell(0);
        let claimed = header.transition(CellState::Free, CellState::Init);
        debug_assert!(claimed, "released run head must be free");
        head.set_run(len, shape);

        let addr = self.block_base(start);
        let bytes = len * BLOCK_SIZE;
        self.publish_object(header, addr, bytes);
        self.note_allocation(bytes);
        addr
    }

    fn out_of_memory(&self, bytes: usize) -> ! {
        tracing::error!(
            target: "otter::freegc",
            requested = bytes,
            arena_size = self.config.arena_size,
            "arena exhausted"
        );
        let layout = Layout::from_size_align(bytes, BLOCK_SIZE).unwrap_or(Layout::new::<usize>());
        alloc::handle_alloc_error(layout)
    }

    /// Count slow-path bytes toward the collection trigger.
    #[inline]
    pub(crate) fn note_allocation(&self, bytes: usize) {
        self.bytes_since_cycle.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Slow-path bytes allocated since the last completed cycle.
    pub fn bytes_since_cycle(&self) -> usize {
        self.bytes_since_cycle.load(Ordering::Relaxed)
    }

    /// Whether enough has been allocated to warrant a cycle.
    pub fn should_collect(&self) -> bool {
        self.bytes_since_cycle() >= self.config.gc_trigger_bytes
    }

    pub(crate) fn reset_cycle_bytes(&self) {
        self.bytes_since_cycle.store(0, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // Word access
    // ---------------------------------------------------------------------

    /// # Safety
    /// `addr` must be word aligned and point to memory that outlives `self`.
    #[inline]
    unsafe fn word(&self, addr: usize) -> &AtomicUsize {
        debug_assert!(addr.is_multiple_of(WORD));
        // SAFETY: guaranteed by the caller.
        unsafe { &*(addr as *const AtomicUsize) }
    }

    /// # Safety
    /// The caller owns `size` bytes at `addr` inside the arena.
    unsafe fn zero_words(&self, addr: usize, size: usize) {
        for offset in (0..size).step_by(WORD) {
            // SAFETY: inside the owned cell.
            unsafe { self.word(addr + offset) }.store(0, Ordering::Relaxed);
        }
    }

    /// Read word `index` of the object at `obj`.
    ///
    /// # Safety
    /// `obj` must be a live object of this heap holding more than `index`
    /// words.
    pub unsafe fn read_word(&self, obj: usize, index: usize) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { self.word(obj + index * WORD) }.load(Ordering::Acquire)
    }

    /// Store a word and run the write barrier.
    ///
    /// # Safety
    /// Same contract as [`Heap::read_word`].
    pub(crate) unsafe fn store_word(&self, obj: usize, index: usize, value: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.word(obj + index * WORD) }.store(value, Ordering::Release);
        self.write_barrier(value);
    }

    /// Insertion barrier: while marking, stored heap pointers are shaded.
    #[inline]
    pub(crate) fn write_barrier(&self, value: usize) {
        if self.contains(value) && self.phase().is_marking() {
            self.barrier.lock().push(value);
        }
    }

    /// Copy `bytes` from `src` to `dst`, shading copied pointers while
    /// marking. Used for pointer-bearing buffers.
    ///
    /// # Safety
    /// Both regions must be valid for `bytes`, word aligned and disjoint.
    pub(crate) unsafe fn copy_scan_words(&self, src: usize, dst: usize, bytes: usize) {
        let whole = bytes - bytes % WORD;
        for offset in (0..whole).step_by(WORD) {
            // SAFETY: guaranteed by the caller.
            let value = unsafe { self.word(src + offset) }.load(Ordering::Relaxed);
            unsafe { self.word(dst + offset) }.store(value, Ordering::Relaxed);
            self.write_barrier(value);
        }
        if whole < bytes {
            // SAFETY: guaranteed by the caller.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src + whole) as *const u8,
                    (dst + whole) as *mut u8,
                    bytes - whole,
                )
            };
        }
    }

    pub(crate) fn take_barrier_buffer(&self) -> Vec<usize> {
        std::mem::take(&mut *self.barrier.lock())
    }

    // ---------------------------------------------------------------------
    // Collector support
    // ---------------------------------------------------------------------

    /// Claim the single collector slot. Returns false if taken.
    pub(crate) fn attach_collector(&self) -> bool {
        !self.collector_attached.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn detach_collector(&self) {
        self.collector_attached.store(false, Ordering::Release);
    }

    /// Blocks carved so far; everything past this is untouched arena.
    pub(crate) fn blocks_carved(&self) -> usize {
        self.pages.lock().next
    }

    pub(crate) fn reset_marks(&self) {
        for index in 0..self.blocks_carved() {
            if let Some(block) = self.block(index) {
                block.reset_marks();
            }
        }
    }

    /// Shade an allocated white object gray. Returns true if it was shaded.
    pub(crate) fn shade(&self, addr: usize) -> bool {
        let Some(cell) = self.locate(addr) else {
            return false;
        };
        let header = cell.header();
        header.state() == CellState::Allocated
            && header.transition_mark(MarkColor::White, MarkColor::Gray)
    }

    /// Conservatively visit every word of a `Scan` object that points into
    /// the arena.
    pub(crate) fn scan_object(&self, cell: &CellRef<'_>, visitor: &mut dyn FnMut(usize)) {
        if !cell.shape().is_scan() {
            return;
        }
        for offset in (0..cell.size()).step_by(WORD) {
            // SAFETY: the cell spans `size` bytes of the arena.
            let value = unsafe { self.word(cell.addr + offset) }.load(Ordering::Relaxed);
            if self.contains(value) {
                visitor(value);
            }
        }
    }

    /// Sweep one block.
    pub(crate) fn sweep_block(&self, index: usize) -> SweepOutcome {
        let Some(block) = self.block(index) else {
            return SweepOutcome::default();
        };
        let base = self.block_base(index);
        match block.kind() {
            BlockKind::Small { span, .. } => {
                let outcome =
                    block.sweep_small(base, &mut |addr| self.sweep_side_records(addr));
                if outcome.cells > 0 && block.try_enqueue() {
                    self.central[span.index()].lock().push(index);
                }
                outcome
            }
            BlockKind::Large => self.sweep_large(index, block, base),
        }
    }

    fn sweep_large(&self, index: usize, block: &BlockMeta, base: usize) -> SweepOutcome {
        let len = block.run_len();
        let header = block.cell(0);
        if len == 0 || header.state() != CellState::Allocated || header.mark() != MarkColor::White
        {
            return SweepOutcome::default();
        }
        if header.has_flag(flags::HAS_SIDE_RECORD)
            && self.sweep_side_records(base) == SideRecordVerdict::Keep
        {
            return SweepOutcome::default();
        }
        if !header.transition(CellState::Allocated, CellState::Free) {
            return SweepOutcome::default();
        }
        block.set_run(0, PointerShape::NoScan);
        self.pages.lock().release(index, len);
        SweepOutcome {
            cells: 1,
            bytes: len * BLOCK_SIZE,
        }
    }

    fn sweep_side_records(&self, addr: usize) -> SideRecordVerdict {
        let decision = self.side_records.on_sweep(addr);
        if !decision.still_attached
            && let Some(cell) = self.locate(addr)
        {
            cell.header().clear_flag(flags::HAS_SIDE_RECORD);
        }
        decision.verdict
    }

    /// Queue the finalizers of unreachable objects and return them. The
    /// collector marks them, and what they reach, before sweeping.
    pub(crate) fn resurrect_finalizable(&self) -> Vec<usize> {
        let resurrected = self
            .side_records
            .queue_unmarked_finalizers(&|addr| self.is_marked(addr));
        resurrected
            .into_iter()
            .map(|(addr, still_attached)| {
                if !still_attached && let Some(cell) = self.locate(addr) {
                    cell.header().clear_flag(flags::HAS_SIDE_RECORD);
                }
                addr
            })
            .collect()
    }

    pub(crate) fn visit_pending_roots(&self, visitor: &mut dyn FnMut(usize)) {
        self.side_records.visit_pending_roots(visitor);
    }

    pub(crate) fn note_slots_zeroed(&self, count: u64) {
        self.slots_zeroed.fetch_add(count, Ordering::Relaxed);
    }

    /// Tracked slots zeroed by the collector since the heap was created.
    pub fn slots_zeroed(&self) -> u64 {
        self.slots_zeroed.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Side records
    // ---------------------------------------------------------------------

    /// Attach a finalizer to a live object. The object is excluded from
    /// eager free and, once unreachable, survives one more cycle so the
    /// finalizer can observe it.
    pub fn attach_finalizer<F>(&self, addr: usize, finalizer: F) -> bool
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.attach(addr, SideRecord::Finalizer(Box::new(finalizer)))
    }

    /// Attach a cleanup that runs after the object has been reclaimed.
    pub fn attach_cleanup<F>(&self, addr: usize, cleanup: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach(addr, SideRecord::Cleanup(Box::new(cleanup)))
    }

    fn attach(&self, addr: usize, record: SideRecord) -> bool {
        let Some(cell) = self.locate(addr) else {
            return false;
        };
        let header = cell.header();
        if header.state() != CellState::Allocated {
            return false;
        }
        self.side_records.attach(addr, record);
        header.set_flag(flags::HAS_SIDE_RECORD);
        true
    }

    /// Run queued finalizers and cleanups. Returns how many ran.
    pub fn run_pending_side_records(&self) -> usize {
        self.side_records.run_pending()
    }

    /// Number of queued finalizers and cleanups.
    pub fn pending_side_records(&self) -> usize {
        self.side_records.pending_len()
    }

    // ---------------------------------------------------------------------
    // Workers and statistics
    // ---------------------------------------------------------------------

    pub(crate) fn register_worker(&self) -> Arc<WorkerShared> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(WorkerShared::new(id));
        self.workers.lock().push(Arc::clone(&shared));
        shared
    }

    pub(crate) fn retire_worker(&self, shared: &Arc<WorkerShared>) {
        let mut retired = self.retired.lock();
        self.workers.lock().retain(|w| !Arc::ptr_eq(w, shared));
        *retired += shared.stats.snapshot();
    }

    /// Snapshot of the registered workers.
    pub(crate) fn workers(&self) -> Vec<Arc<WorkerShared>> {
        self.workers.lock().clone()
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Eager-reclaim counters summed over live and exited workers.
    pub fn free_stats(&self) -> FreeStats {
        let retired = self.retired.lock();
        let mut total = *retired;
        for worker in self.workers.lock().iter() {
            total += worker.stats.snapshot();
        }
        total
    }

    /// Walk every carved block and count cells by state.
    pub fn census(&self) -> HeapCensus {
        let (carved, free_large_blocks) = {
            let pages = self.pages.lock();
            (pages.next, pages.free_blocks())
        };
        let mut census = HeapCensus {
            blocks_carved: carved,
            free_large_blocks,
            ..HeapCensus::default()
        };

        for index in 0..carved {
            let Some(block) = self.block(index) else {
                continue;
            };
            match block.kind() {
                BlockKind::Small { .. } => {
                    let (allocated, cached, free) = block.census();
                    census.small_blocks += 1;
                    census.allocated_cells += allocated;
                    census.cached_cells += cached;
                    census.free_cells += free;
                }
                BlockKind::Large => {
                    let header = block.cell(0);
                    if block.run_len() > 0 && header.state() == CellState::Allocated {
                        census.large_objects += 1;
                        census.large_bytes += block.cell_size();
                    }
                }
            }
        }
        census
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("arena_size", &self.config.arena_size)
            .field("blocks_carved", &self.blocks_carved())
            .field("state", &self.state)
            .field("side_records", &self.side_records)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClass;

    fn small_heap() -> Arc<Heap> {
        Heap::with_config(HeapConfig::with_arena_size(64 * BLOCK_SIZE)).unwrap()
    }

    #[test]
    fn test_heap_creation() {
        let heap = small_heap();
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.bytes_since_cycle(), 0);
        assert_eq!(heap.census(), HeapCensus::default());
        // The tracked-slot invalidator is always registered
        assert_eq!(heap.state().observer_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Heap::with_config(HeapConfig::with_arena_size(100));
        assert!(matches!(result, Err(ConfigError::ArenaSize { .. })));
    }

    #[test]
    fn test_contains() {
        let heap = small_heap();
        let start = heap.arena.start();
        assert!(heap.contains(start));
        assert!(heap.contains(start + 64 * BLOCK_SIZE - 1));
        assert!(!heap.contains(start + 64 * BLOCK_SIZE));
        assert!(!heap.contains(0));
    }

    #[test]
    fn test_locate_unused_block() {
        let heap = small_heap();
        assert!(heap.locate(heap.arena.start()).is_none());
    }

    #[test]
    fn test_carve_and_locate() {
        let heap = small_heap();
        let span = SpanClass::new(SizeClass::for_size(64).unwrap(), PointerShape::NoScan);
        let index = heap.refill(span);
        let base = heap.block_base(index);

        let cell = heap.locate(base + 128).unwrap();
        assert_eq!(cell.index, 2);
        assert_eq!(cell.size(), 64);
        assert!(heap.locate(base + 130).is_none());
        assert_eq!(heap.blocks_carved(), 1);
    }

    #[test]
    fn test_large_allocation_and_sweep() {
        let heap = small_heap();
        let addr = heap.allocate_large(3 * BLOCK_SIZE - 10, PointerShape::NoScan);
        let info = heap.object_info(addr).unwrap();
        assert!(info.large);
        assert_eq!(info.size, 3 * BLOCK_SIZE);
        assert_eq!(info.state, CellState::Allocated);
        assert_eq!(heap.bytes_since_cycle(), 3 * BLOCK_SIZE);

        // Tails are not object starts
        assert!(heap.object_info(addr + BLOCK_SIZE).is_none());

        let outcome = heap.sweep_block(0);
        assert_eq!(outcome.bytes, 3 * BLOCK_SIZE);
        assert!(heap.object_info(addr).is_none());
        assert_eq!(heap.census().free_large_blocks, 3);

        // The released run is reused
        let again = heap.allocate_large(BLOCK_SIZE, PointerShape::Scan);
        assert_eq!(again, addr);
        assert_eq!(heap.census().free_large_blocks, 2);
    }

    #[test]
    fn test_page_heap_coalesces() {
        let mut pages = PageHeap::new(16);
        let a = pages.carve_run(2).unwrap();
        let b = pages.carve_run(3).unwrap();
        let c = pages.carve_run(1).unwrap();
        pages.release(a, 2);
        pages.release(c, 1);
        pages.release(b, 3);
        assert_eq!(pages.free_runs, vec![BlockRun { start: 0, len: 6 }]);
        assert_eq!(pages.carve_run(6), Some(0));
        assert_eq!(pages.carve_run(11), None);
    }

    #[test]
    fn test_attach_requires_live_object() {
        let heap = small_heap();
        assert!(!heap.attach_cleanup(heap.arena.start(), || {}));

        let addr = heap.allocate_large(BLOCK_SIZE, PointerShape::NoScan);
        assert!(heap.attach_cleanup(addr, || {}));
        assert!(heap.object_info(addr).unwrap().has_side_record);
    }

    #[test]
    fn test_write_barrier_only_while_marking() {
        let heap = small_heap();
        let addr = heap.allocate_large(BLOCK_SIZE, PointerShape::Scan);
        heap.write_barrier(addr);
        assert!(heap.take_barrier_buffer().is_empty());

        heap.advance_phase();
        heap.write_barrier(addr);
        heap.write_barrier(12345);
        assert_eq!(heap.take_barrier_buffer(), vec![addr]);
    }
}
