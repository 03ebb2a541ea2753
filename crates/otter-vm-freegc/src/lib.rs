//! # Otter VM eager-reclaim heap
//!
//! Size-classed heap for a concurrent mark-sweep collector, with three ways
//! for code that has proven an object dead to hand it back before the next
//! cycle.
//!
//! ## Design
//!
//! - **Allocation**: per-worker free lists per span class (size class x
//!   pointer shape), falling back to free cells of shared 16KB blocks
//! - **Eager free**: [`Worker::try_free`] validates an address and parks the
//!   cell on the worker's free list; rejections are silent
//! - **Grow-and-free**: [`Worker::grow_unaliased`] frees a buffer's old
//!   storage as soon as its contents have been copied
//! - **Scope tracking**: [`TrackScope`] frees every object it tracked when the
//!   scope exits; the collector zeroes slots of objects it sweeps
//! - **Collector**: budgeted, phase-driven mark-sweep ([`Collector`],
//!   [`BackgroundCollector`]) that skips cells owned by free lists
//!
//! Objects are plain addresses. Everything that dereferences one is
//! `unsafe`; everything that only decides whether to reclaim one is not.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod block;
pub mod collector;
pub mod config;
pub mod error;
mod free;
mod grow;
pub mod heap;
pub mod object;
pub mod phase;
pub mod roots;
pub mod scope;
mod side_record;
pub mod size_class;
pub mod stats;
pub mod worker;

pub use collector::{BackgroundCollector, Collector};
pub use config::HeapConfig;
pub use error::{ConfigError, RejectReason};
pub use heap::{Heap, HeapCensus};
pub use object::{CellState, MarkColor, ObjectInfo};
pub use phase::{CollectorState, GcPhase, PhaseObserver, PhaseTransition};
pub use roots::{RootProvider, RootSet, RootSetGuard};
pub use scope::{TrackScope, TrackSlots, WeakSlot};
pub use size_class::{
    BLOCK_SIZE, LARGE_OBJECT_THRESHOLD, PointerShape, SizeClass, SpanClass, next_capacity,
    rounded_size,
};
pub use stats::{CollectorStats, FreeStats};
pub use worker::Worker;
