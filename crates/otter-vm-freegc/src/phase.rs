//! Collector cooperation layer.
//!
//! Every other component reads the collector's phase and epoch from here
//! before acting. Only the collector driver advances the phase; components
//! that must react to a transition (the scope-tracking registry zeroing its
//! weak slots) register a [`PhaseObserver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::heap::Heap;
use crate::object::MarkColor;

/// Collector phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// Concurrent marking, write barriers active
    Mark = 1,
    /// Roots rescanned and the barrier buffer drained
    MarkTermination = 2,
    /// Unmarked objects are being reclaimed
    Sweep = 3,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => GcPhase::Mark,
            2 => GcPhase::MarkTermination,
            3 => GcPhase::Sweep,
            _ => GcPhase::Idle,
        }
    }
}

impl GcPhase {
    /// The phase that follows this one.
    pub fn next(self) -> GcPhase {
        match self {
            GcPhase::Idle => GcPhase::Mark,
            GcPhase::Mark => GcPhase::MarkTermination,
            GcPhase::MarkTermination => GcPhase::Sweep,
            GcPhase::Sweep => GcPhase::Idle,
        }
    }

    /// Whether write barriers must shade stored pointers.
    #[inline]
    pub fn is_marking(self) -> bool {
        matches!(self, GcPhase::Mark | GcPhase::MarkTermination)
    }

    /// Color given to objects handed out during this phase.
    ///
    /// Objects allocated while a cycle is running are black so that neither
    /// the marker nor the sweeper of that cycle touches them.
    #[inline]
    pub fn allocation_color(self) -> MarkColor {
        match self {
            GcPhase::Idle => MarkColor::White,
            _ => MarkColor::Black,
        }
    }
}

/// A completed phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    /// Phase before the transition
    pub from: GcPhase,
    /// Phase after the transition
    pub to: GcPhase,
    /// Epoch after the transition
    pub epoch: u64,
}

/// Hook invoked on every phase transition, on the collector's thread.
pub trait PhaseObserver: Send + Sync {
    /// Called after the phase and epoch have been updated.
    fn phase_changed(&self, heap: &Heap, transition: PhaseTransition);
}

/// Shared, read-mostly collector state.
pub struct CollectorState {
    phase: AtomicU8,
    epoch: AtomicU64,
    /// Epoch of the most recent transition into `Sweep`
    last_sweep: AtomicU64,
    observers: RwLock<Vec<Arc<dyn PhaseObserver>>>,
}

impl CollectorState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(GcPhase::Idle as u8),
            epoch: AtomicU64::new(0),
            last_sweep: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Current phase
    #[inline]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::SeqCst))
    }

    /// Number of phase transitions so far
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Epoch at which the latest sweep began, 0 before the first one.
    ///
    /// An object allocated at epoch `e` may have been reclaimed if this is
    /// greater than `e`.
    #[inline]
    pub fn last_sweep_epoch(&self) -> u64 {
        self.last_sweep.load(Ordering::SeqCst)
    }

    /// Color for an object published right now
    #[inline]
    pub fn allocation_color(&self) -> MarkColor {
        self.phase().allocation_color()
    }

    /// Register an observer for future transitions
    pub fn add_observer(&self, observer: Arc<dyn PhaseObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Move to the next phase, bump the epoch and notify observers.
    ///
    /// Reserved to the collector driver; the phase is written nowhere else.
    pub(crate) fn advance(&self, heap: &Heap) -> PhaseTransition {
        let from = self.phase();
        let to = from.next();
        self.phase.store(to as u8, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let transition = PhaseTransition { from, to, epoch };
        if to == GcPhase::Sweep {
            self.last_sweep.store(epoch, Ordering::SeqCst);
        }

        tracing::debug!(
            target: "otter::freegc",
            from = ?from,
            to = ?to,
            epoch,
            "collector phase transition"
        );

        // Observers may register further observers; don't hold the lock.
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.phase_changed(heap, transition);
        }
        transition
    }
}

impl std::fmt::Debug for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorState")
            .field("phase", &self.phase())
            .field("epoch", &self.epoch())
            .field("observers", &self.observer_count())
            .finish()
    }
}
