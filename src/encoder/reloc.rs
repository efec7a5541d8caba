//! Deferred fixups over the scratch buffer.
//!
//! Any operand whose final value depends on code layout or load address is
//! emitted as a zeroed placeholder plus a [`RelocEntry`]. Entries stay
//! non-decreasing in buffer offset (jump-table slots in the tail are
//! exempt, they live past the end of the instruction stream), which lets
//! both the shortening pass and [`RelocTable::apply`] work in a single
//! forward sweep.

use std::ops::Range;

use crate::core::error::fatal_error;
use crate::ir::LabelId;

/// Final PC assigned to each label during emission.
#[derive(Debug, Clone)]
pub struct LabelPcs {
    pcs: Vec<Option<u32>>,
}

impl LabelPcs {
    pub fn new(count: u32) -> Self {
        Self {
            pcs: vec![None; count as usize],
        }
    }

    /// Grow the label space (internal labels for jump tables and inlinee
    /// patch points are allocated past the function's own labels).
    pub fn alloc_internal(&mut self) -> LabelId {
        self.pcs.push(None);
        (self.pcs.len() - 1) as LabelId
    }

    pub fn define(&mut self, id: LabelId, pc: u32) {
        let slot = &mut self.pcs[id as usize];
        debug_assert!(slot.is_none(), "label {id} defined twice");
        *slot = Some(pc);
    }

    /// Resolved PC of a label. Calling this for an undefined label means
    /// the legality check was bypassed, which is an integrity violation.
    pub fn pc(&self, id: LabelId) -> u32 {
        match self.pcs.get(id as usize) {
            Some(Some(pc)) => *pc,
            _ => fatal_error(&format!("relocation against undefined label {id}")),
        }
    }

    /// Rewrite every defined PC through `map` (used by the shortening
    /// pass to shift labels by the cumulative layout delta).
    pub fn renumber(&mut self, mut map: impl FnMut(u32) -> u32) {
        for slot in self.pcs.iter_mut() {
            if let Some(pc) = slot {
                *pc = map(*pc);
            }
        }
    }
}

/// Kind of deferred fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Long relative branch; 4-byte displacement. `cond` distinguishes
    /// Jcc (`0F 8x`) from Jmp (`E9`) geometry.
    BranchRel32 { cond: bool },
    /// Short relative branch; 1-byte displacement.
    BranchRel8 { cond: bool },
    /// 8-byte absolute use of a label's final address.
    LabelUse,
    /// 4-byte inlinee-call-info patch: the label's final base-relative
    /// offset, written into an immediate.
    InlineeOffset,
    /// Zero-width marker on a loop-top label that wants 16-byte
    /// alignment. Carries no payload; consumed by the shortening pass.
    AlignedLabel,
}

/// One deferred fixup. `offset` addresses the payload bytes (for
/// `AlignedLabel`, the label position itself).
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub kind: RelocKind,
    pub offset: u32,
    pub label: LabelId,
    pub in_tail: bool,
}

impl RelocEntry {
    /// Placeholder length in bytes.
    pub fn payload_len(&self) -> u32 {
        match self.kind {
            RelocKind::BranchRel32 { .. } => 4,
            RelocKind::BranchRel8 { .. } => 1,
            RelocKind::LabelUse => 8,
            RelocKind::InlineeOffset => 4,
            RelocKind::AlignedLabel => 0,
        }
    }

    /// Offset of the first byte of the owning instruction (branches
    /// carry their opcode bytes ahead of the payload).
    pub fn instr_start(&self) -> u32 {
        match self.kind {
            RelocKind::BranchRel32 { cond: true } => self.offset - 2,
            RelocKind::BranchRel32 { cond: false } => self.offset - 1,
            RelocKind::BranchRel8 { .. } => self.offset - 1,
            _ => self.offset,
        }
    }

    /// Encoded length of the owning branch instruction.
    pub fn branch_len(&self) -> u32 {
        match self.kind {
            RelocKind::BranchRel32 { cond: true } => 6,
            RelocKind::BranchRel32 { cond: false } => 5,
            RelocKind::BranchRel8 { .. } => 2,
            _ => self.payload_len(),
        }
    }

    /// Bytes saved by rewriting this long branch short (4 for Jcc, 3 for
    /// Jmp).
    pub fn shortening_saving(&self) -> u32 {
        self.branch_len() - 2
    }
}

/// Ordered fixup list for one compile.
#[derive(Debug, Clone, Default)]
pub struct RelocTable {
    entries: Vec<RelocEntry>,
    last_main_offset: u32,
}

impl RelocTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: RelocEntry) {
        if !entry.in_tail {
            if entry.offset < self.last_main_offset {
                fatal_error(&format!(
                    "relocation entries out of order: {} after {}",
                    entry.offset, self.last_main_offset
                ));
            }
            self.last_main_offset = entry.offset;
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelocEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RelocEntry> {
        self.entries.iter_mut()
    }

    /// Placeholder byte ranges, sorted by offset; these are the checksum
    /// exclusions shared by all validation phases.
    pub fn payload_ranges(&self) -> Vec<Range<u32>> {
        let mut ranges: Vec<Range<u32>> = self
            .entries
            .iter()
            .filter(|e| e.payload_len() > 0)
            .map(|e| e.offset..e.offset + e.payload_len())
            .collect();
        ranges.sort_by_key(|r| r.start);
        ranges
    }

    /// Resolve every fixup against the final base address, writing into
    /// the relocated code image. Single forward pass; any target outside
    /// `[base, base + code_size)` is an integrity violation.
    pub fn apply(&self, code: &mut [u8], base: u64, code_size: u32, labels: &LabelPcs) {
        debug_assert!(code.len() >= code_size as usize);
        for entry in &self.entries {
            if matches!(entry.kind, RelocKind::AlignedLabel) {
                continue;
            }
            let target_pc = labels.pc(entry.label);
            // The absolute target must land inside the published code
            // region.
            let target_abs = base + target_pc as u64;
            if target_pc >= code_size || target_abs < base {
                fatal_error(&format!(
                    "relocation target {target_abs:#x} outside [{base:#x}, {:#x})",
                    base + code_size as u64
                ));
            }
            let at = entry.offset as usize;
            let len = entry.payload_len() as usize;
            if at + len > code.len() {
                fatal_error("relocation payload outside code buffer");
            }
            match entry.kind {
                RelocKind::BranchRel32 { .. } => {
                    let rel = target_pc as i64 - (entry.offset as i64 + 4);
                    code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
                }
                RelocKind::BranchRel8 { .. } => {
                    let rel = target_pc as i64 - (entry.offset as i64 + 1);
                    if rel < i8::MIN as i64 || rel > i8::MAX as i64 {
                        fatal_error(&format!(
                            "short branch at {} cannot reach target {target_pc}",
                            entry.offset
                        ));
                    }
                    code[at] = rel as i8 as u8;
                }
                RelocKind::LabelUse => {
                    code[at..at + 8].copy_from_slice(&target_abs.to_le_bytes());
                }
                RelocKind::InlineeOffset => {
                    code[at..at + 4].copy_from_slice(&target_pc.to_le_bytes());
                }
                RelocKind::AlignedLabel => unreachable!(),
            }
        }
        log::trace!(
            "applied {} relocations against base {base:#x}",
            self.entries.len()
        );
    }
}
