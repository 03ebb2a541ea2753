//! Root enumeration.
//!
//! The collector starts every cycle, and finishes marking, by asking a
//! [`RootProvider`] for the addresses the mutators hold. Anything not
//! reachable from a root is reclaimed, including objects a mutator only
//! holds in a local variable, so objects that must survive a cycle are
//! registered in a [`RootSet`].

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

/// Source of root addresses.
pub trait RootProvider {
    /// Call `visitor` with every root. Non-heap values are ignored.
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize));
}

impl RootProvider for () {
    fn visit_roots(&self, _visitor: &mut dyn FnMut(usize)) {}
}

impl RootProvider for [usize] {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        for &addr in self {
            visitor(addr);
        }
    }
}

impl<const N: usize> RootProvider for [usize; N] {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        self.as_slice().visit_roots(visitor);
    }
}

impl RootProvider for Vec<usize> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        self.as_slice().visit_roots(visitor);
    }
}

impl<T: RootProvider + ?Sized> RootProvider for std::sync::Arc<T> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        (**self).visit_roots(visitor);
    }
}

/// Thread-safe counted set of roots.
///
/// The same address may be inserted several times; it stays a root until
/// removed as many times.
#[derive(Debug, Default)]
pub struct RootSet {
    roots: Mutex<FxHashMap<usize, usize>>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to `addr`
    pub fn insert(&self, addr: usize) {
        self.lock().insert(addr);
    }

    /// Drop one reference to `addr`. Returns false if it was not a root.
    pub fn remove(&self, addr: usize) -> bool {
        self.lock().remove(addr)
    }

    /// Whether `addr` is currently a root
    pub fn contains(&self, addr: usize) -> bool {
        self.roots.lock().contains_key(&addr)
    }

    /// Number of distinct roots
    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }

    /// Hold the set locked.
    ///
    /// The collector cannot enumerate roots while the guard is alive, so an
    /// object allocated and inserted under the guard is never seen
    /// unrooted by a cycle that has already passed its final root scan.
    pub fn lock(&self) -> RootSetGuard<'_> {
        RootSetGuard(self.roots.lock())
    }
}

impl RootProvider for RootSet {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        for &addr in self.roots.lock().keys() {
            visitor(addr);
        }
    }
}

/// Exclusive access to a [`RootSet`].
pub struct RootSetGuard<'a>(MutexGuard<'a, FxHashMap<usize, usize>>);

impl RootSetGuard<'_> {
    /// Add one reference to `addr`
    pub fn insert(&mut self, addr: usize) {
        *self.0.entry(addr).or_insert(0) += 1;
    }

    /// Drop one reference to `addr`. Returns false if it was not a root.
    pub fn remove(&mut self, addr: usize) -> bool {
        let Some(count) = self.0.get_mut(&addr) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.0.remove(&addr);
        }
        true
    }
}
