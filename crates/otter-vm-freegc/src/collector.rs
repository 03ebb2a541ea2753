//! Concurrent mark-sweep collector driver.
//!
//! A cycle walks the phases `Idle -> Mark -> MarkTermination -> Sweep ->
//! Idle`. Marking and sweeping run in budgeted steps so that they can be
//! interleaved with the workers, which keep allocating and eagerly freeing
//! throughout:
//!
//! ```text
//! begin_cycle(roots)          reset colors, shade roots          (-> Mark)
//! mark_step(budget)*          blacken gray objects, scan words
//! finish_marking(roots)       rescan roots, drain barrier buffer (-> MarkTermination)
//! begin_sweep()               tracked slots of white objects zeroed (-> Sweep)
//! sweep_step(budget)*         free white cells, requeue blocks
//! finish_cycle()                                                 (-> Idle)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use crate::heap::Heap;
use crate::object::{CellState, MarkColor};
use crate::phase::GcPhase;
use crate::roots::RootProvider;
use crate::stats::CollectorStats;

/// Counters for the cycle in progress.
#[derive(Debug, Default, Clone, Copy)]
struct CycleCounters {
    marked: u64,
    swept: u64,
    bytes: u64,
}

/// Drives collection cycles for one heap.
///
/// At most one collector may be attached to a heap at a time.
pub struct Collector {
    heap: Arc<Heap>,
    /// Gray worklist
    worklist: Vec<usize>,
    sweep_cursor: usize,
    sweep_limit: usize,
    cycle_start: Option<Instant>,
    cycle: CycleCounters,
    slots_zeroed_at_start: u64,
    stats: CollectorStats,
}

impl Collector {
    /// Create a collector for `heap`.
    ///
    /// # Panics
    /// Panics if another collector is attached to the heap.
    pub fn new(heap: Arc<Heap>) -> Self {
        assert!(heap.attach_collector(), "heap already has a collector");
        Self {
            heap,
            worklist: Vec::new(),
            sweep_cursor: 0,
            sweep_limit: 0,
            cycle_start: None,
            cycle: CycleCounters::default(),
            slots_zeroed_at_start: 0,
            stats: CollectorStats::default(),
        }
    }

    /// Get heap reference
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Current phase
    pub fn phase(&self) -> GcPhase {
        self.heap.phase()
    }

    /// Get statistics
    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Run a full cycle
    pub fn collect(&mut self, roots: &dyn RootProvider) -> u64 {
        let mark_budget = self.heap.config().mark_budget;
        let sweep_budget = self.heap.config().sweep_budget;

        self.begin_cycle(roots);
        while self.mark_step(mark_budget) {}
        self.finish_marking(roots);
        self.begin_sweep();
        while self.sweep_step(sweep_budget) {}
        self.finish_cycle()
    }

    /// Start a cycle: reset colors, enter `Mark` and shade the roots.
    pub fn begin_cycle(&mut self, roots: &dyn RootProvider) {
        debug_assert_eq!(self.phase(), GcPhase::Idle);
        self.cycle_start = Some(Instant::now());
        self.cycle = CycleCounters::default();
        self.slots_zeroed_at_start = self.heap.slots_zeroed();

        self.heap.reset_marks();
        self.heap.advance_phase();
        self.shade_roots(roots);

        tracing::debug!(
            target: "otter::freegc",
            epoch = self.heap.epoch(),
            gray = self.worklist.len(),
            "GC cycle starting"
        );
    }

    fn shade_roots(&mut self, roots: &dyn RootProvider) {
        let heap = &self.heap;
        let worklist = &mut self.worklist;
        let mut shade = |addr: usize| {
            if heap.shade(addr) {
                worklist.push(addr);
            }
        };
        roots.visit_roots(&mut shade);
        heap.visit_pending_roots(&mut shade);
    }

    fn drain_barrier(&mut self) {
        for addr in self.heap.take_barrier_buffer() {
            if self.heap.shade(addr) {
                self.worklist.push(addr);
            }
        }
    }

    /// Blacken up to `budget` gray objects.
    ///
    /// Returns true if more work remains.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        self.drain_barrier();

        let mut processed = 0;
        while processed < budget {
            let Some(addr) = self.worklist.pop() else {
                break;
            };
            processed += 1;
            self.blacken(addr);
        }

        !self.worklist.is_empty()
    }

    fn blacken(&mut self, addr: usize) {
        let heap = &self.heap;
        let Some(cell) = heap.locate(addr) else {
            return;
        };
        let header = cell.header();
        // Eagerly freed (or freed and reused as black) since it was shaded.
        if header.state() != CellState::Allocated
            || !header.transition_mark(MarkColor::Gray, MarkColor::Black)
        {
            return;
        }
        self.cycle.marked += 1;

        let worklist = &mut self.worklist;
        heap.scan_object(&cell, &mut |value| {
            if heap.shade(value) {
                worklist.push(value);
            }
        });
    }

    /// Enter `MarkTermination`, rescan roots and mark to completion.
    pub fn finish_marking(&mut self, roots: &dyn RootProvider) {
        debug_assert_eq!(self.phase(), GcPhase::Mark);
        self.heap.advance_phase();
        self.shade_roots(roots);
        loop {
            self.drain_barrier();
            if self.worklist.is_empty() {
                break;
            }
            while self.mark_step(usize::MAX) {}
        }
    }

    /// Enter `Sweep`. Tracked slots of unmarked objects are zeroed by the
    /// phase observer before any block is swept.
    ///
    /// Unreachable objects with finalizers are resurrected first, together
    /// with everything they reach, so a finalizer never sees a reclaimed
    /// referent.
    pub fn begin_sweep(&mut self) {
        debug_assert_eq!(self.phase(), GcPhase::MarkTermination);
        // Stores that raced with termination.
        while self.mark_step(usize::MAX) {}

        let resurrected = self.heap.resurrect_finalizable();
        if !resurrected.is_empty() {
            for &addr in &resurrected {
                if self.heap.shade(addr) {
                    self.worklist.push(addr);
                }
            }
            while self.mark_step(usize::MAX) {}
            tracing::debug!(
                target: "otter::freegc",
                resurrected = resurrected.len(),
                "finalizable objects resurrected"
            );
        }

        self.heap.advance_phase();
        self.sweep_cursor = 0;
        self.sweep_limit = self.heap.blocks_carved();
    }

    /// Sweep up to `budget` blocks.
    ///
    /// Returns true if more work remains.
    pub fn sweep_step(&mut self, budget: usize) -> bool {
        let end = self.sweep_limit.min(self.sweep_cursor.saturating_add(budget));
        for index in self.sweep_cursor..end {
            let outcome = self.heap.sweep_block(index);
            self.cycle.swept += outcome.cells as u64;
            self.cycle.bytes += outcome.bytes as u64;
        }
        self.sweep_cursor = end;
        self.sweep_cursor < self.sweep_limit
    }

    /// Return to `Idle` and record the cycle. Returns the bytes reclaimed.
    pub fn finish_cycle(&mut self) -> u64 {
        debug_assert_eq!(self.phase(), GcPhase::Sweep);
        self.heap.advance_phase();
        self.heap.reset_cycle_bytes();

        let elapsed = self
            .cycle_start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let zeroed = self.heap.slots_zeroed() - self.slots_zeroed_at_start;
        let cycle = self.cycle;

        let stats = &mut self.stats;
        stats.cycles += 1;
        stats.objects_marked += cycle.marked;
        stats.objects_swept += cycle.swept;
        stats.bytes_swept += cycle.bytes;
        stats.last_reclaimed = cycle.bytes;
        stats.slots_zeroed += zeroed;
        stats.last_cycle = elapsed;
        stats.total_time += elapsed;

        tracing::info!(
            target: "otter::freegc",
            collection = stats.cycles,
            marked = cycle.marked,
            freed_objects = cycle.swept,
            reclaimed_bytes = cycle.bytes,
            slots_zeroed = zeroed,
            cycle_us = elapsed.as_micros() as u64,
            "GC cycle complete"
        );
        cycle.bytes
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Leave the heap idle for the next collector.
        match self.phase() {
            GcPhase::Idle => {}
            GcPhase::Mark => {
                self.finish_marking(&());
                self.begin_sweep();
                while self.sweep_step(usize::MAX) {}
                self.finish_cycle();
            }
            GcPhase::MarkTermination => {
                self.begin_sweep();
                while self.sweep_step(usize::MAX) {}
                self.finish_cycle();
            }
            GcPhase::Sweep => {
                while self.sweep_step(usize::MAX) {}
                self.finish_cycle();
            }
        }
        self.heap.detach_collector();
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("phase", &self.phase())
            .field("gray", &self.worklist.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// State shared with the background thread.
#[derive(Debug, Default)]
struct BackgroundShared {
    shutdown: AtomicBool,
    requested: AtomicBool,
    cycles: AtomicU64,
    stats: Mutex<CollectorStats>,
}

/// Runs collection cycles on a dedicated thread.
///
/// A cycle starts whenever the heap's allocation trigger fires or one is
/// requested. Between steps the thread yields, so workers keep running in
/// every phase.
#[derive(Debug)]
pub struct BackgroundCollector {
    shared: Arc<BackgroundShared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundCollector {
    /// Spawn the collector thread.
    pub fn spawn<R>(heap: Arc<Heap>, roots: Arc<R>) -> std::io::Result<Self>
    where
        R: RootProvider + Send + Sync + 'static,
    {
        let shared = Arc::new(BackgroundShared::default());
        let thread_shared = Arc::clone(&shared);
        let mut collector = Collector::new(heap);

        let handle = thread::Builder::new()
            .name("otter-freegc-collector".into())
            .spawn(move || run_background(&mut collector, &*roots, &thread_shared))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Ask for a cycle regardless of the allocation trigger.
    pub fn request_cycle(&self) {
        self.shared.requested.store(true, Ordering::Release);
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Statistics as of the last completed cycle
    pub fn stats(&self) -> CollectorStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the thread after the current cycle and wait for it.
    pub fn stop(mut self) -> CollectorStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!(target: "otter::freegc", "collector thread panicked");
        }
    }
}

impl Drop for BackgroundCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_background(collector: &mut Collector, roots: &dyn RootProvider, shared: &BackgroundShared) {
    let interval = collector.heap().config().collector_interval;
    let mark_budget = collector.heap().config().mark_budget;
    let sweep_budget = collector.heap().config().sweep_budget;
    let backoff = Backoff::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        let requested = shared.requested.swap(false, Ordering::AcqRel);
        if !requested && !collector.heap().should_collect() {
            if backoff.is_completed() {
                thread::sleep(interval);
            } else {
                backoff.snooze();
            }
            continue;
        }
        backoff.reset();

        collector.begin_cycle(roots);
        while collector.mark_step(mark_budget) {
            thread::yield_now();
        }
        collector.finish_marking(roots);
        collector.begin_sweep();
        while collector.sweep_step(sweep_budget) {
            thread::yield_now();
        }
        collector.finish_cycle();

        *shared.stats.lock() = collector.stats().clone();
        shared.cycles.fetch_add(1, Ordering::AcqRel);
    }
}
