//! Scope-bounded tracking of allocations.
//!
//! A scope whose allocations provably die when it exits records them in a
//! caller-owned, fixed-capacity [`TrackSlots`] registry and frees them all on
//! exit. Slots are weak: they never keep an object alive, and the collector
//! zeroes every slot whose object it is about to sweep, so a drain never frees
//! an address that was reclaimed and handed out again.
//!
//! ```ignore
//! let slots = std::pin::pin!(TrackSlots::<2>::new());
//! let mut scope = worker.enter_scope(slots.as_ref());
//! let a = scope.allocate_tracked(class, PointerShape::NoScan);
//! // ... last use of `a` ...
//! scope.free_tracked();
//! ```
//!
//! Drains, slot recording and the collector's visitation of a worker's
//! registries are serialized by the worker's scope lock, which is never held
//! across an allocation.

use std::cell::Cell;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::heap::Heap;
use crate::phase::{GcPhase, PhaseObserver, PhaseTransition};
use crate::size_class::{PointerShape, SizeClass};
use crate::worker::{Worker, WorkerShared};

/// A self-invalidating reference to a tracked object.
#[derive(Debug, Default)]
pub struct WeakSlot {
    addr: AtomicUsize,
    epoch: AtomicU64,
}

impl WeakSlot {
    /// An empty slot.
    pub const fn new() -> Self {
        Self {
            addr: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Tracked address, or 0 if empty or zeroed by the collector.
    #[inline]
    pub fn get(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    /// Collector epoch when the object was tracked.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn set(&self, addr: usize, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
        self.addr.store(addr, Ordering::Release);
    }

    fn take(&self) -> usize {
        self.addr.swap(0, Ordering::AcqRel)
    }

    /// Zero the slot if it still holds `addr`.
    fn clear_if(&self, addr: usize) -> bool {
        self.addr
            .compare_exchange(addr, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Caller-owned registry of `N` weak slots.
///
/// Must be pinned before use so that the collector can reach the slots in
/// place; dropping it deregisters it if a scope guard was leaked.
pub struct TrackSlots<const N: usize> {
    slots: [WeakSlot; N],
    /// Set while a scope is registered.
    owner: Cell<Option<Arc<WorkerShared>>>,
    _pinned: PhantomPinned,
}

impl<const N: usize> TrackSlots<N> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| WeakSlot::new()),
            owner: Cell::new(None),
            _pinned: PhantomPinned,
        }
    }

    /// Number of slots
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The slots, for inspection
    pub fn slots(&self) -> &[WeakSlot] {
        &self.slots
    }
}

impl<const N: usize> Default for TrackSlots<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for TrackSlots<N> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.scopes.lock().deregister(&self.slots);
        }
    }
}

/// A registered slot range.
struct SlotRange {
    start: NonNull<WeakSlot>,
    len: usize,
}

// SAFETY: a range points into a pinned `TrackSlots`, which deregisters itself
// under the owning scope lock before its memory goes away. Slots are atomics.
unsafe impl Send for SlotRange {}

impl SlotRange {
    fn slots(&self) -> &[WeakSlot] {
        // SAFETY: see `Send` above; the range is only read under the lock.
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.len) }
    }
}

/// The live registries of one worker.
#[derive(Default)]
pub(crate) struct ScopeList {
    ranges: Vec<SlotRange>,
}

impl ScopeList {
    fn register(&mut self, slots: &[WeakSlot]) {
        self.ranges.push(SlotRange {
            start: NonNull::from(slots).cast(),
            len: slots.len(),
        });
    }

    fn deregister(&mut self, slots: &[WeakSlot]) {
        let start = slots.as_ptr();
        if let Some(pos) = self
            .ranges
            .iter()
            .rposition(|range| std::ptr::eq(range.start.as_ptr(), start))
        {
            self.ranges.swap_remove(pos);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Zero every slot whose object this cycle is about to reclaim.
    fn invalidate_unmarked(&self, heap: &Heap) -> u64 {
        let mut zeroed = 0;
        for range in &self.ranges {
            for slot in range.slots() {
                let addr = slot.get();
                if addr != 0 && !heap.is_marked(addr) && slot.clear_if(addr) {
                    zeroed += 1;
                }
            }
        }
        zeroed
    }
}

/// Phase observer that zeroes unmarked tracked slots on entry to sweep.
#[derive(Debug)]
pub(crate) struct TrackedSlotInvalidator;

impl PhaseObserver for TrackedSlotInvalidator {
    fn phase_changed(&self, heap: &Heap, transition: PhaseTransition) {
        if transition.to != GcPhase::Sweep {
            return;
        }
        let mut zeroed = 0;
        let mut registries = 0;
        for worker in heap.workers() {
            let scopes = worker.scopes.lock();
            registries += scopes.len();
            zeroed += scopes.invalidate_unmarked(heap);
        }
        heap.note_slots_zeroed(zeroed);

        tracing::debug!(
            target: "otter::freegc",
            epoch = transition.epoch,
            registries,
            zeroed,
            "tracked slots invalidated"
        );
    }
}

/// Guard for one tracking scope.
///
/// Drains its registry exactly once: on [`TrackScope::free_tracked`], or when
/// dropped on any other exit path, including unwinding.
pub struct TrackScope<'a> {
    worker: &'a Worker,
    slots: &'a [WeakSlot],
    owner: &'a Cell<Option<Arc<WorkerShared>>>,
    next: usize,
}

impl Worker {
    /// Start a tracking scope backed by `slots`.
    ///
    /// # Panics
    /// Panics if `slots` already backs a live scope.
    pub fn enter_scope<'a, const N: usize>(
        &'a self,
        slots: Pin<&'a TrackSlots<N>>,
    ) -> TrackScope<'a> {
        let slots = slots.get_ref();
        let previous = slots.owner.replace(Some(Arc::clone(self.shared())));
        assert!(previous.is_none(), "tracking slots already back a live scope");

        self.shared().scopes.lock().register(&slots.slots);
        TrackScope {
            worker: self,
            slots: &slots.slots,
            owner: &slots.owner,
            next: 0,
        }
    }
}

impl TrackScope<'_> {
    /// Allocate an object whose lifetime ends with this scope.
    ///
    /// When every slot is taken the object is still allocated but left
    /// untracked; debug builds assert.
    pub fn allocate_tracked(&mut self, class: SizeClass, shape: PointerShape) -> usize {
        let allocated_at = self.worker.heap().epoch();
        let addr = self.worker.allocate(class, shape);
        self.worker.counters().tracked_allocs.bump();
        self.record(addr, allocated_at);
        addr
    }

    /// Record `addr`, allocated at epoch `allocated_at`, in the next slot.
    ///
    /// The slot is written under the worker's scope lock, which orders it
    /// against the invalidation on entry to `Sweep`. If a sweep began since
    /// the allocation, that invalidation could not see the slot and the
    /// object may already be reclaimed, so it is left untracked.
    fn record(&mut self, addr: usize, allocated_at: u64) {
        let counters = self.worker.counters();
        let Some(slot) = self.slots.get(self.next) else {
            counters.track_overflow.bump();
            if cfg!(debug_assertions) {
                panic!("tracking capacity {} exceeded", self.slots.len());
            }
            return;
        };

        let _scopes = self.worker.shared().scopes.lock();
        let state = self.worker.heap().state();
        if state.last_sweep_epoch() > allocated_at {
            counters.tracked_skipped.bump();
            return;
        }
        slot.set(addr, state.epoch());
        self.next += 1;
    }

    /// Slots used so far
    pub fn len(&self) -> usize {
        self.next
    }

    /// Whether nothing has been tracked yet
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    /// Registry capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Addresses still tracked (not zeroed by the collector).
    pub fn tracked(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots[..self.next]
            .iter()
            .map(WeakSlot::get)
            .filter(|&addr| addr != 0)
    }

    /// End the scope now, freeing every tracked object. Returns how many
    /// were reclaimed.
    pub fn free_tracked(mut self) -> usize {
        self.drain()
    }

    fn drain(&mut self) -> usize {
        let Some(owner) = self.owner.take() else {
            return 0;
        };

        let (mut freed, mut skipped) = (0u64, 0u64);
        {
            let mut scopes = owner.scopes.lock();
            for slot in &self.slots[..self.next] {
                match slot.take() {
                    0 => skipped += 1,
                    addr => {
                        if self.worker.free_owned(addr) {
                            freed += 1;
                        }
                    }
                }
            }
            scopes.deregister(self.slots);
        }

        let counters = self.worker.counters();
        counters.tracked_frees.add(freed);
        counters.tracked_skipped.add(skipped);
        self.next = 0;
        freed as usize
    }
}

impl Drop for TrackScope<'_> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for TrackScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackScope")
            .field("len", &self.next)
            .field("capacity", &self.slots.len())
            .finish()
    }
}
