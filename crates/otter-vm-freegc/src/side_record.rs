//! Side records: finalizers and cleanups attached to individual objects.
//!
//! An object carrying a side record is excluded from eager free: its memory
//! must survive until the collector decides the record can run.
//!
//! - objects with a finalizer found unmarked once marking is complete are
//!   resurrected, with everything they reach, before the sweep; their
//!   finalizers are queued and the queued objects are roots until they ran
//! - objects with only cleanups are freed by the sweeper, which queues their
//!   cleanups

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::block::SideRecordVerdict;

/// Out-of-band work attached to an object.
pub enum SideRecord {
    /// Runs with the object's address; the object is kept alive until then.
    Finalizer(Box<dyn FnOnce(usize) + Send>),
    /// Runs after the object has been reclaimed.
    Cleanup(Box<dyn FnOnce() + Send>),
}

impl SideRecord {
    fn is_finalizer(&self) -> bool {
        matches!(self, SideRecord::Finalizer(_))
    }
}

impl std::fmt::Debug for SideRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideRecord::Finalizer(_) => f.write_str("Finalizer"),
            SideRecord::Cleanup(_) => f.write_str("Cleanup"),
        }
    }
}

/// A record whose object was found dead, waiting to run.
struct PendingRecord {
    /// Object address; 0 for cleanups, whose object is already gone
    addr: usize,
    record: SideRecord,
}

/// What the sweeper learned from the table about one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepDecision {
    pub verdict: SideRecordVerdict,
    /// Whether records remain attached after this sweep
    pub still_attached: bool,
}

/// Address-keyed side-record table.
#[derive(Default)]
pub(crate) struct SideTable {
    records: Mutex<FxHashMap<usize, Vec<SideRecord>>>,
    pending: Mutex<Vec<PendingRecord>>,
    /// Finalizer objects whose finalizers are currently running
    running: Mutex<Vec<usize>>,
}

impl SideTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach a record. The caller sets the cell flag afterwards.
    pub(crate) fn attach(&self, addr: usize, record: SideRecord) {
        self.records.lock().entry(addr).or_default().push(record);
    }

    /// Number of objects with attached records.
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Queue the finalizers of every finalizable object `is_marked` rejects.
    ///
    /// Returns each such object and whether cleanups remain attached to it.
    /// The caller must mark the objects before anything is swept.
    pub(crate) fn queue_unmarked_finalizers(
        &self,
        is_marked: &dyn Fn(usize) -> bool,
    ) -> Vec<(usize, bool)> {
        let mut records = self.records.lock();
        let dead: Vec<usize> = records
            .iter()
            .filter(|(addr, list)| {
                list.iter().any(SideRecord::is_finalizer) && !is_marked(**addr)
            })
            .map(|(&addr, _)| addr)
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }

        let mut pending = self.pending.lock();
        let mut resurrected = Vec::with_capacity(dead.len());
        for addr in dead {
            let Some(list) = records.remove(&addr) else {
                continue;
            };
            let (finalizers, cleanups): (Vec<_>, Vec<_>) =
                list.into_iter().partition(SideRecord::is_finalizer);
            pending.extend(
                finalizers
                    .into_iter()
                    .map(|record| PendingRecord { addr, record }),
            );
            let still_attached = !cleanups.is_empty();
            if still_attached {
                records.insert(addr, cleanups);
            }
            resurrected.push((addr, still_attached));
        }
        resurrected
    }

    /// Called by the sweeper for an unmarked object flagged with records.
    ///
    /// A finalizer found here was attached after the resurrection pass; the
    /// object is kept but its referents are not.
    pub(crate) fn on_sweep(&self, addr: usize) -> SweepDecision {
        let Some(records) = self.records.lock().remove(&addr) else {
            return SweepDecision {
                verdict: SideRecordVerdict::Free,
                still_attached: false,
            };
        };

        let (finalizers, cleanups): (Vec<_>, Vec<_>) =
            records.into_iter().partition(SideRecord::is_finalizer);

        let mut pending = self.pending.lock();
        if finalizers.is_empty() {
            pending.extend(
                cleanups
                    .into_iter()
                    .map(|record| PendingRecord { addr: 0, record }),
            );
            return SweepDecision {
                verdict: SideRecordVerdict::Free,
                still_attached: false,
            };
        }

        pending.extend(
            finalizers
                .into_iter()
                .map(|record| PendingRecord { addr, record }),
        );
        drop(pending);

        let still_attached = !cleanups.is_empty();
        if still_attached {
            self.records.lock().insert(addr, cleanups);
        }
        SweepDecision {
            verdict: SideRecordVerdict::Keep,
            still_attached,
        }
    }

    /// Objects that must stay alive because their finalizers are queued.
    pub(crate) fn visit_pending_roots(&self, visitor: &mut dyn FnMut(usize)) {
        for entry in self.pending.lock().iter() {
            if entry.addr != 0 {
                visitor(entry.addr);
            }
        }
        for &addr in self.running.lock().iter() {
            visitor(addr);
        }
    }

    /// Number of queued records.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run every queued record outside of any lock. Returns how many ran.
    pub(crate) fn run_pending(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let roots: Vec<usize> = batch
            .iter()
            .filter(|e| e.addr != 0)
            .map(|e| e.addr)
            .collect();
        self.running.lock().extend_from_slice(&roots);

        let count = batch.len();
        for PendingRecord { addr, record } in batch {
            match record {
                SideRecord::Finalizer(f) => f(addr),
                SideRecord::Cleanup(f) => f(),
            }
        }

        let mut running = self.running.lock();
        for addr in roots {
            if let Some(pos) = running.iter().position(|&a| a == addr) {
                running.swap_remove(pos);
            }
        }
        count
    }
}

impl std::fmt::Debug for SideTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideTable")
            .field("objects", &self.len())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unknown_address_is_freed() {
        let table = SideTable::new();
        let decision = table.on_sweep(0x1000);
        assert_eq!(decision.verdict, SideRecordVerdict::Free);
        assert!(!decision.still_attached);
    }

    #[test]
    fn test_finalizer_resurrects_and_runs() {
        let table = SideTable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        table.attach(
            0x2000,
            SideRecord::Finalizer(Box::new(move |addr| seen2.store(addr, Ordering::SeqCst))),
        );
        assert_eq!(table.len(), 1);

        let decision = table.on_sweep(0x2000);
        assert_eq!(decision.verdict, SideRecordVerdict::Keep);
        assert!(!decision.still_attached);
        assert_eq!(table.len(), 0);

        let mut roots = Vec::new();
        table.visit_pending_roots(&mut |a| roots.push(a));
        assert_eq!(roots, vec![0x2000]);

        assert_eq!(table.run_pending(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0x2000);
        assert_eq!(table.pending_len(), 0);

        roots.clear();
        table.visit_pending_roots(&mut |a| roots.push(a));
        assert!(roots.is_empty());
    }

    #[test]
    fn test_cleanup_only_frees() {
        let table = SideTable::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        table.attach(
            0x3000,
            SideRecord::Cleanup(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let decision = table.on_sweep(0x3000);
        assert_eq!(decision.verdict, SideRecordVerdict::Free);

        // Cleanups are not roots
        let mut roots = Vec::new();
        table.visit_pending_roots(&mut |a| roots.push(a));
        assert!(roots.is_empty());

        assert_eq!(table.run_pending(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_keeps_cleanups_attached() {
        let table = SideTable::new();
        table.attach(0x4000, SideRecord::Cleanup(Box::new(|| {})));
        table.attach(0x4000, SideRecord::Finalizer(Box::new(|_| {})));

        let decision = table.on_sweep(0x4000);
        assert_eq!(decision.verdict, SideRecordVerdict::Keep);
        assert!(decision.still_attached);
        assert_eq!(table.len(), 1);
        assert_eq!(table.pending_len(), 1);
    }

    #[test]
    fn test_queue_unmarked_finalizers() {
        let table = SideTable::new();
        table.attach(0x5000, SideRecord::Finalizer(Box::new(|_| {})));
        table.attach(0x6000, SideRecord::Finalizer(Box::new(|_| {})));
        table.attach(0x6000, SideRecord::Cleanup(Box::new(|| {})));
        table.attach(0x7000, SideRecord::Finalizer(Box::new(|_| {})));
        table.attach(0x8000, SideRecord::Cleanup(Box::new(|| {})));

        let mut resurrected = table.queue_unmarked_finalizers(&|addr| addr == 0x7000);
        resurrected.sort_unstable();
        assert_eq!(resurrected, vec![(0x5000, false), (0x6000, true)]);
        assert_eq!(table.pending_len(), 2);
        // Marked and cleanup-only objects are left for the sweeper
        assert_eq!(table.len(), 3);

        let mut roots = Vec::new();
        table.visit_pending_roots(&mut |a| roots.push(a));
        roots.sort_unstable();
        assert_eq!(roots, vec![0x5000, 0x6000]);
    }
}
