//! Grow-and-free for unaliased buffers.
//!
//! When a growable buffer has exactly one live reference, its old storage is
//! dead the moment the contents have been copied out, so it can go straight
//! back to the free list instead of waiting for a cycle.

use crate::size_class::{PointerShape, next_capacity};
use crate::worker::Worker;

impl Worker {
    /// Grow a buffer so it can hold `new_len` elements.
    ///
    /// `extra` is the number of elements about to be appended: the first
    /// `new_len - extra` elements are copied. Returns the new address and
    /// element capacity. The old storage (`old_cap * elem_size` bytes) is
    /// eagerly freed when the address changed; the buffer returned is never
    /// freed here. Zero-sized elements never allocate.
    ///
    /// # Safety
    /// `old_addr` is either 0 (no storage yet) or the only live reference to
    /// a buffer of `old_cap` elements of `elem_size` bytes, allocated with
    /// `shape`. The caller must not use `old_addr` afterwards.
    ///
    /// # Panics
    /// Panics on capacity overflow.
    pub unsafe fn grow_unaliased(
        &self,
        old_addr: usize,
        old_cap: usize,
        new_len: usize,
        elem_size: usize,
        shape: PointerShape,
        extra: usize,
    ) -> (usize, usize) {
        if elem_size == 0 {
            return (old_addr, new_len);
        }
        debug_assert!(extra <= new_len);
        self.counters().grow_calls.bump();

        let new_cap = next_capacity(old_cap, new_len, elem_size);
        let new_addr = self.allocate_bytes(new_cap * elem_size, shape);

        let old_len = new_len.saturating_sub(extra).min(old_cap);
        let copy_bytes = old_len * elem_size;
        if old_addr != 0 && copy_bytes > 0 {
            if shape.is_scan() {
                // SAFETY: the caller guarantees `old_addr` holds `old_cap`
                // elements; the new buffer is at least as large.
                unsafe { self.heap().copy_scan_words(old_addr, new_addr, copy_bytes) };
            } else {
                // SAFETY: as above; pointer-free memory is never scanned.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        old_addr as *const u8,
                        new_addr as *mut u8,
                        copy_bytes,
                    )
                };
            }
        }

        if old_addr != 0
            && old_addr != new_addr
            && self.try_free(old_addr, old_cap * elem_size, shape)
        {
            self.counters().grow_frees.bump();
        }
        (new_addr, new_cap)
    }
}
