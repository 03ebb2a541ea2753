//! Error types for otter-vm-freegc
//!
//! The allocation and free paths never fail in the error-return sense; the
//! only recoverable errors come from building a heap with a bad configuration.

use thiserror::Error;

/// Invalid [`HeapConfig`](crate::HeapConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Arena must hold at least one block and be a whole number of blocks
    #[error("arena size {size} must be a non-zero multiple of {block_size} bytes")]
    ArenaSize {
        /// Requested arena size
        size: usize,
        /// Required granularity
        block_size: usize,
    },

    /// Free-size bounds are inverted
    #[error("min_free_size ({min}) exceeds max_free_size ({max})")]
    InvertedFreeBounds {
        /// Configured minimum
        min: usize,
        /// Configured maximum
        max: usize,
    },

    /// Eager free cannot classify objects above the largest size class
    #[error("max_free_size ({max}) exceeds the largest size class ({limit})")]
    MaxFreeTooLarge {
        /// Configured maximum
        max: usize,
        /// Largest small-object size
        limit: usize,
    },

    /// Collector budgets must make progress
    #[error("{name} must be greater than zero")]
    ZeroBudget {
        /// Name of the offending field
        name: &'static str,
    },
}

/// Why an eager free declined to reclaim an object.
///
/// Rejections are not errors: they only forgo an optimization, and are
/// surfaced solely through [`FreeStats`](crate::FreeStats) counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Eager free is switched off in the heap configuration.
    Disabled,
    /// Address is outside the heap (stack slot, foreign memory) or not the
    /// start of an object.
    NotInHeap,
    /// Size below `min_free_size`.
    TooSmall,
    /// Size above `max_free_size`, or a large object.
    TooLarge,
    /// A finalizer or cleanup is attached.
    SideRecord,
    /// Size or pointer shape disagree with the object's block.
    Mismatch,
    /// The object is not currently allocated (already freed, or swept).
    NotAllocated,
}

impl RejectReason {
    /// Short name used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Disabled => "disabled",
            RejectReason::NotInHeap => "not_in_heap",
            RejectReason::TooSmall => "too_small",
            RejectReason::TooLarge => "too_large",
            RejectReason::SideRecord => "side_record",
            RejectReason::Mismatch => "mismatch",
            RejectReason::NotAllocated => "not_allocated",
        }
    }
}
