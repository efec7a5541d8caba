//! Per-page free bitmap.
//!
//! A heap page is 4096 bytes carved at 128-byte granularity, so one
//! `u32` tracks a whole page: bit set = chunk free. The heap trusts this
//! map completely; a request to reserve a non-free run or release a
//! non-allocated one means the map and the allocation records have
//! diverged, and that is an integrity violation, not an error the caller
//! can handle.

use crate::core::error::fatal_error;

pub const PAGE_SIZE: usize = 4096;
pub const CHUNK_SIZE: usize = 128;
pub const CHUNKS_PER_PAGE: u32 = (PAGE_SIZE / CHUNK_SIZE) as u32;

/// Number of 128-byte chunks covering `bytes`.
pub fn chunks_for(bytes: usize) -> u32 {
    (bytes.div_ceil(CHUNK_SIZE)) as u32
}

/// Free map of one page: bit i set means chunk i is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBitmap(u32);

impl FreeBitmap {
    pub fn all_free() -> Self {
        Self(u32::MAX)
    }

    fn run_mask(first: u32, count: u32) -> u32 {
        debug_assert!(count >= 1 && first + count <= CHUNKS_PER_PAGE);
        if count == 32 {
            u32::MAX
        } else {
            ((1u32 << count) - 1) << first
        }
    }

    /// First chunk index where `count` contiguous free chunks start, if
    /// any.
    pub fn find_run(&self, count: u32) -> Option<u32> {
        if count == 0 || count > CHUNKS_PER_PAGE {
            return None;
        }
        for first in 0..=(CHUNKS_PER_PAGE - count) {
            let mask = Self::run_mask(first, count);
            if self.0 & mask == mask {
                return Some(first);
            }
        }
        None
    }

    /// Mark a run allocated. The run must be entirely free.
    pub fn reserve(&mut self, first: u32, count: u32) {
        let mask = Self::run_mask(first, count);
        if self.0 & mask != mask {
            fatal_error(&format!(
                "heap bitmap corrupt: reserving non-free run {first}+{count} in {:#010x}",
                self.0
            ));
        }
        self.0 &= !mask;
    }

    /// Mark a run free again. The run must be entirely allocated;
    /// anything else is a double free.
    pub fn release(&mut self, first: u32, count: u32) {
        let mask = Self::run_mask(first, count);
        if self.0 & mask != 0 {
            fatal_error(&format!(
                "heap bitmap corrupt: double free of run {first}+{count} in {:#010x}",
                self.0
            ));
        }
        self.0 |= mask;
    }

    pub fn is_run_allocated(&self, first: u32, count: u32) -> bool {
        self.0 & Self::run_mask(first, count) == 0
    }

    /// No chunk allocated.
    pub fn is_empty(&self) -> bool {
        self.0 == u32::MAX
    }

    /// No chunk free.
    pub fn is_full(&self) -> bool {
        self.0 == 0
    }

    pub fn free_chunks(&self) -> u32 {
        self.0.count_ones()
    }
}
