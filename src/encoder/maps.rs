//! Offset-indexed side tables built during emission.
//!
//! Each table maps a byte offset in the emitted code to metadata the
//! execution engine consumes: throw map (statement boundaries), inlinee
//! frame map, bailout records, and lazy-bailout points. Entries are plain
//! value types keyed by their original offset and kept in ascending
//! order, so the shortening pass renumbers them with a pure merge and a
//! "snapshot" is nothing more than a clone.

use crate::core::error::fatal_error;
use crate::ir::{BailoutInfo, InlineeCallInfo};

/// Statement boundary: byte offset -> source statement index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PragmaEntry {
    pub offset: u32,
    pub statement: u32,
}

/// Inlinee frame boundary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineeFrameEntry {
    pub offset: u32,
    pub info: InlineeCallInfo,
    pub is_start: bool,
}

/// Deoptimization record keyed by post-encode offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BailoutEntry {
    pub offset: u32,
    pub info: BailoutInfo,
}

/// Lazy-bailout point keyed by post-encode offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyBailoutEntry {
    pub offset: u32,
}

/// All offset-bearing side tables of one compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideTables {
    pub throw_map: Vec<PragmaEntry>,
    pub inlinee_frames: Vec<InlineeFrameEntry>,
    pub bailouts: Vec<BailoutEntry>,
    pub lazy_bailouts: Vec<LazyBailoutEntry>,
}

fn check_monotonic(last: Option<u32>, next: u32, table: &str) {
    if let Some(last) = last {
        if next < last {
            fatal_error(&format!(
                "{table} offsets regressed: {next} after {last}"
            ));
        }
    }
}

impl SideTables {
    pub fn push_pragma(&mut self, offset: u32, statement: u32) {
        check_monotonic(self.throw_map.last().map(|e| e.offset), offset, "throw map");
        self.throw_map.push(PragmaEntry { offset, statement });
    }

    pub fn push_inlinee(&mut self, offset: u32, info: InlineeCallInfo, is_start: bool) {
        check_monotonic(
            self.inlinee_frames.last().map(|e| e.offset),
            offset,
            "inlinee frame map",
        );
        self.inlinee_frames.push(InlineeFrameEntry {
            offset,
            info,
            is_start,
        });
    }

    pub fn push_bailout(&mut self, offset: u32, info: BailoutInfo) {
        check_monotonic(self.bailouts.last().map(|e| e.offset), offset, "bailout map");
        self.bailouts.push(BailoutEntry { offset, info });
    }

    pub fn push_lazy_bailout(&mut self, offset: u32) {
        check_monotonic(
            self.lazy_bailouts.last().map(|e| e.offset),
            offset,
            "lazy bailout list",
        );
        self.lazy_bailouts.push(LazyBailoutEntry { offset });
    }

    /// Rewrite every offset through `map`, walking each table in its
    /// (already ascending) original-offset order. `map` must be
    /// monotone, which the layout-delta construction guarantees.
    pub fn renumber(&mut self, mut map: impl FnMut(u32) -> u32) {
        for e in self.throw_map.iter_mut() {
            e.offset = map(e.offset);
        }
        for e in self.inlinee_frames.iter_mut() {
            e.offset = map(e.offset);
        }
        for e in self.bailouts.iter_mut() {
            e.offset = map(e.offset);
        }
        for e in self.lazy_bailouts.iter_mut() {
            e.offset = map(e.offset);
        }
    }
}
