//! Per-thread encoding session.
//!
//! A session bundles the bump arena that backs scratch buffers with the
//! running statistics for everything encoded through it. One session per
//! compile thread; the arena is reset between functions by the owner,
//! never mid-encode.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;

/// Shared per-thread state for the encoding pipeline.
pub struct EncodeSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<EncodeStats>,
}

impl<'arena> EncodeSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(EncodeStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn record_function(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_encoded += 1;
        stats.bytes_emitted += code_size as u64;
    }

    pub fn record_shortening(&self, branches: u32, bytes_saved: u32, align_bytes: u32) {
        let mut stats = self.stats.borrow_mut();
        stats.branches_shortened += branches as u64;
        stats.bytes_saved += bytes_saved as u64;
        stats.align_bytes += align_bytes as u64;
    }

    pub fn record_shortening_rollback(&self) {
        self.stats.borrow_mut().shortening_rollbacks += 1;
    }

    pub fn stats(&self) -> EncodeStats {
        self.stats.borrow().clone()
    }
}

/// Counters accumulated across one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub functions_encoded: u64,
    pub bytes_emitted: u64,
    pub branches_shortened: u64,
    pub bytes_saved: u64,
    pub align_bytes: u64,
    pub shortening_rollbacks: u64,
}

impl fmt::Display for EncodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Encoding session statistics:")?;
        writeln!(f, "  Functions encoded: {}", self.functions_encoded)?;
        writeln!(f, "  Bytes emitted: {}", self.bytes_emitted)?;
        writeln!(
            f,
            "  Branches shortened: {} ({} bytes saved)",
            self.branches_shortened, self.bytes_saved
        )?;
        writeln!(f, "  Alignment bytes inserted: {}", self.align_bytes)?;
        writeln!(f, "  Shortening rollbacks: {}", self.shortening_rollbacks)
    }
}
