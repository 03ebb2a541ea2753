//! Heap configuration

use std::time::Duration;

use crate::error::ConfigError;
use crate::size_class::{BLOCK_SIZE, LARGE_OBJECT_THRESHOLD};

/// Heap configuration
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Bytes reserved for the arena; a multiple of the block size (default: 64MB)
    pub arena_size: usize,
    /// Eager free is declined below this size (default: 16 bytes)
    pub min_free_size: usize,
    /// Eager free is declined above this size (default: 8KB)
    pub max_free_size: usize,
    /// Master switch for eager free (default: on)
    pub eager_free: bool,
    /// Slow-path bytes allocated between cycles before a collection is due
    /// (default: 4MB)
    pub gc_trigger_bytes: usize,
    /// Gray objects processed per background mark step (default: 256)
    pub mark_budget: usize,
    /// Blocks swept per background sweep step (default: 32)
    pub sweep_budget: usize,
    /// Background collector polling interval (default: 1ms)
    pub collector_interval: Duration,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_size: 64 * 1024 * 1024,      // 64MB
            min_free_size: 16,                 // smallest size class
            max_free_size: LARGE_OBJECT_THRESHOLD,
            eager_free: true,
            gc_trigger_bytes: 4 * 1024 * 1024, // 4MB
            mark_budget: 256,
            sweep_budget: 32,
            collector_interval: Duration::from_millis(1),
        }
    }
}

impl HeapConfig {
    /// Default configuration with a custom arena size.
    pub fn with_arena_size(arena_size: usize) -> Self {
        Self {
            arena_size,
            ..Self::default()
        }
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_size == 0 || !self.arena_size.is_multiple_of(BLOCK_SIZE) {
            return Err(ConfigError::ArenaSize {
                size: self.arena_size,
                block_size: BLOCK_SIZE,
            });
        }
        if self.min_free_size > self.max_free_size {
            return Err(ConfigError::InvertedFreeBounds {
                min: self.min_free_size,
                max: self.max_free_size,
            });
        }
        if self.max_free_size > LARGE_OBJECT_THRESHOLD {
            return Err(ConfigError::MaxFreeTooLarge {
                max: self.max_free_size,
                limit: LARGE_OBJECT_THRESHOLD,
            });
        }
        if self.mark_budget == 0 {
            return Err(ConfigError::ZeroBudget {
                name: "mark_budget",
            });
        }
        if self.sweep_budget == 0 {
            return Err(ConfigError::ZeroBudget {
                name: "sweep_budget",
            });
        }
        Ok(())
    }

    /// Number of blocks in the arena.
    pub fn arena_blocks(&self) -> usize {
        self.arena_size / BLOCK_SIZE
    }
}
