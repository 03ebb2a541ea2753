//! Concurrent stress tests
//!
//! Several mutator threads allocate, track and eagerly free objects while a
//! background collector runs cycles on demand. Rooted canaries, and the
//! objects reachable only through them, must keep their contents, and every
//! cell must end up accounted for exactly once.

use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;

use otter_vm_freegc::{
    BLOCK_SIZE, BackgroundCollector, CellState, Collector, Heap, HeapConfig, PointerShape,
    RootSet, SizeClass, TrackSlots, Worker,
};

const THREADS: usize = 4;
const ITERATIONS: usize = 2_500;
const TRACK_CAPACITY: usize = 16;
/// Canary words holding pointers to its children; the rest hold a pattern
const CANARY_CHILDREN: usize = 4;
const CANARY_WORDS: usize = 8;
const CHILD_WORDS: usize = 4;
const MAX_CANARIES: usize = 32;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// xorshift64; deterministic per thread.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// Non-pointer word derived from an address. The low bit is set so it is
/// never the start of a cell and never keeps anything alive.
fn pattern(addr: usize, word: usize) -> usize {
    (addr.rotate_left(17) ^ word.wrapping_mul(0x9e37_79b9)) | 1
}

fn assert_allocated(heap: &Heap, addr: usize) {
    assert_eq!(
        heap.object_info(addr).map(|i| i.state),
        Some(CellState::Allocated),
        "object {addr:#x} reclaimed while reachable"
    );
}

/// A rooted `Scan` canary reaches its children only through its own words,
/// so the concurrent marker must scan it to keep them.
fn check_canary(heap: &Heap, canary: usize) {
    assert_allocated(heap, canary);
    for word in 0..CANARY_WORDS {
        let value = unsafe { heap.read_word(canary, word) };
        if word < CANARY_CHILDREN {
            assert_allocated(heap, value);
            for w in 0..CHILD_WORDS {
                assert_eq!(
                    unsafe { heap.read_word(value, w) },
                    pattern(value, w),
                    "child {value:#x} of canary {canary:#x} corrupted"
                );
            }
        } else {
            assert_eq!(
                value,
                pattern(canary, word),
                "canary {canary:#x} word {word} corrupted"
            );
        }
    }
}

/// Allocate a canary and its children and root it. Everything is linked
/// before the guard is released, so no root scan sees a partial canary.
fn plant_canary(worker: &Worker, roots: &RootSet) -> usize {
    let child_class = SizeClass::for_size(CHILD_WORDS * 8).unwrap();
    let canary_class = SizeClass::for_size(CANARY_WORDS * 8).unwrap();

    let mut guard = roots.lock();
    let canary = worker.allocate(canary_class, PointerShape::Scan);
    for word in 0..CANARY_CHILDREN {
        let child = worker.allocate(child_class, PointerShape::NoScan);
        for w in 0..CHILD_WORDS {
            unsafe { worker.write_word(child, w, pattern(child, w)) };
        }
        unsafe { worker.write_word(canary, word, child) };
    }
    for word in CANARY_CHILDREN..CANARY_WORDS {
        unsafe { worker.write_word(canary, word, pattern(canary, word)) };
    }
    guard.insert(canary);
    canary
}

fn stress_config() -> HeapConfig {
    HeapConfig {
        gc_trigger_bytes: 256 * 1024,
        mark_budget: 64,
        sweep_budget: 8,
        collector_interval: Duration::from_micros(200),
        ..HeapConfig::default()
    }
}

/// Body of one mutator thread. Returns the worker so the caller can audit
/// its free lists once the collector is stopped.
fn mutator(
    heap: Arc<Heap>,
    roots: Arc<RootSet>,
    collector: Arc<BackgroundCollector>,
    seed: u64,
) -> (Worker, Vec<usize>) {
    let worker = Worker::new(heap.clone());
    let slots = pin!(TrackSlots::<TRACK_CAPACITY>::new());
    let mut rng = Rng(seed);
    let mut canaries: Vec<usize> = Vec::new();

    for iteration in 0..ITERATIONS {
        // Allocate, track, drain. Every third scope roots its objects for
        // its duration, as a stack would, so they can be written and read
        // back while the collector scans them.
        let rooted = iteration % 3 == 0;
        let mut scope = worker.enter_scope(slots.as_ref());
        let count = 1 + rng.below(TRACK_CAPACITY);
        let mut objects = Vec::with_capacity(count);
        for _ in 0..count {
            let class = SizeClass::from_index(rng.below(10)).unwrap();
            let shape = if rng.below(2) == 0 {
                PointerShape::Scan
            } else {
                PointerShape::NoScan
            };
            if rooted {
                let mut guard = roots.lock();
                let addr = scope.allocate_tracked(class, shape);
                guard.insert(addr);
                objects.push((addr, shape));
            } else {
                scope.allocate_tracked(class, shape);
            }
        }

        let live: Vec<usize> = scope.tracked().collect();
        let distinct: HashSet<usize> = live.iter().copied().collect();
        assert_eq!(distinct.len(), live.len(), "duplicate live address");
        for addr in &live {
            assert!(!canaries.contains(addr), "tracked object aliases a canary");
        }

        if rooted {
            // Scan objects point at the previous object of the scope
            let mut prev = 0;
            for &(addr, shape) in &objects {
                let link = if shape.is_scan() { prev } else { 0 };
                unsafe {
                    worker.write_word(addr, 0, link);
                    worker.write_word(addr, 1, pattern(addr, 1));
                }
                prev = addr;
            }
            thread::yield_now();
            let mut prev = 0;
            for &(addr, shape) in &objects {
                assert_allocated(&heap, addr);
                let link = if shape.is_scan() { prev } else { 0 };
                assert_eq!(unsafe { heap.read_word(addr, 0) }, link);
                assert_eq!(unsafe { heap.read_word(addr, 1) }, pattern(addr, 1));
                prev = addr;
            }
            let mut guard = roots.lock();
            for &(addr, _) in &objects {
                assert!(guard.remove(addr));
            }
        }
        scope.free_tracked();

        if iteration % 20 == 0 {
            canaries.push(plant_canary(&worker, &roots));
            if canaries.len() > MAX_CANARIES {
                let old = canaries.remove(0);
                check_canary(&heap, old);
                assert!(roots.remove(old));
            }
        }

        // Rooted buffer grown to completion, then freed
        if iteration % 25 == 0 {
            let (mut addr, mut cap) = (0usize, 0usize);
            let target = 64 + rng.below(400);
            for len in 1..=target {
                if len > cap {
                    let mut guard = roots.lock();
                    let old = addr;
                    (addr, cap) = unsafe {
                        worker.grow_unaliased(old, cap, len, 8, PointerShape::NoScan, 1)
                    };
                    guard.insert(addr);
                    if old != 0 {
                        guard.remove(old);
                    }
                }
                unsafe { worker.write_word(addr, len - 1, len) };
            }
            for i in 0..target {
                assert_eq!(unsafe { heap.read_word(addr, i) }, i + 1);
            }
            let size = cap * 8;
            assert!(roots.remove(addr));
            worker.try_free(addr, size, PointerShape::NoScan);
        }

        if iteration % 100 == 0 {
            let before = collector.cycles();
            collector.request_cycle();
            for &canary in &canaries {
                check_canary(&heap, canary);
            }
            // Re-check once a cycle has completed while they were scanned
            if iteration % 500 == 0 {
                while collector.cycles() == before {
                    thread::yield_now();
                }
                for &canary in &canaries {
                    check_canary(&heap, canary);
                }
            }
        }
    }

    (worker, canaries)
}

#[test]
fn test_concurrent_eager_free_with_background_collector() {
    init_tracing();
    let heap = Heap::with_config(stress_config()).unwrap();
    let roots = Arc::new(RootSet::new());
    let collector = Arc::new(BackgroundCollector::spawn(heap.clone(), roots.clone()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            let roots = roots.clone();
            let collector = collector.clone();
            let seed = 0x2545_f491_4f6c_dd1d + t as u64;
            thread::spawn(move || mutator(heap, roots, collector, seed))
        })
        .collect();
    let results: Vec<(Worker, Vec<usize>)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let collector =
        Arc::try_unwrap(collector).unwrap_or_else(|_| panic!("collector still shared"));
    let background = collector.stop();
    assert!(background.cycles > 0, "no background cycle ran");

    // Every cached cell sits on exactly one free list
    let census = heap.census();
    let parked: usize = results.iter().map(|(w, _)| w.free_list_len()).sum();
    assert_eq!(parked, census.cached_cells);

    let stats = heap.free_stats();
    assert_eq!(stats.tracked_frees + stats.tracked_skipped, stats.tracked_allocs);
    assert_eq!(stats.track_overflow, 0);
    assert!(stats.frees_accepted > 0);
    assert!(stats.free_list_hits > 0);

    // A final cycle keeps every rooted canary intact
    let mut collector = Collector::new(heap.clone());
    collector.collect(&*roots);
    for (_, canaries) in &results {
        for &canary in canaries {
            check_canary(&heap, canary);
        }
    }
    assert_eq!(
        heap.census().cached_cells,
        results.iter().map(|(w, _)| w.free_list_len()).sum::<usize>()
    );

    drop(collector);
    drop(results);
    assert_eq!(heap.worker_count(), 0);
    assert_eq!(heap.census().cached_cells, 0);
}

#[test]
fn test_workers_racing_on_shared_blocks() {
    init_tracing();
    let heap = Heap::with_config(HeapConfig::with_arena_size(1024 * BLOCK_SIZE)).unwrap();
    let class = SizeClass::for_size(48).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            thread::spawn(move || {
                let worker = Worker::new(heap.clone());
                let tag = (t + 1) << 48;
                let mut kept = Vec::new();
                for round in 0..200 {
                    let batch: Vec<usize> = (0..64)
                        .map(|_| worker.allocate(class, PointerShape::NoScan))
                        .collect();
                    // Keep every other object, free the rest
                    for (i, &addr) in batch.iter().enumerate() {
                        if (i + round) % 2 == 0 {
                            unsafe { worker.write_word(addr, 0, tag | i) };
                            unsafe { worker.write_word(addr, 1, addr) };
                            kept.push((addr, tag | i));
                        } else {
                            assert!(worker.try_free(addr, 48, PointerShape::NoScan));
                        }
                    }
                    // A cell claimed twice would have been zeroed under us
                    for &(addr, value) in &kept {
                        assert_eq!(unsafe { heap.read_word(addr, 0) }, value);
                        assert_eq!(unsafe { heap.read_word(addr, 1) }, addr);
                    }
                }
                kept.len()
            })
        })
        .collect();

    let kept: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(kept, THREADS * 200 * 32);
    assert_eq!(heap.census().allocated_cells, kept);
    assert_eq!(heap.free_stats().rejected(), 0);
}
