//! One-shot branch shortening and loop-top alignment.
//!
//! All branches are emitted long. This pass walks the relocation table
//! once, in ascending offset order, and retypes every long branch whose
//! displacement fits a signed byte after accounting for the bytes saved
//! by shortenings decided earlier in program order. Every loop-top label
//! off a 16-byte boundary at its settled address is then padded up to the
//! boundary with multi-byte NOPs, bounded by [`MAX_LOOP_ALIGN_PAD`];
//! emission never aligns, so this holds whether or not any branch shrank.
//! There is no iteration to a fixpoint: if an alignment insertion
//! invalidates a decided short, the whole pass rolls back and the long
//! encoding stands.
//!
//! The pass never mutates its inputs until it has a fully valid result:
//! the new buffer and renumbered side tables are built on clones, the
//! old and new buffers are checksummed over matching ranges, and only
//! then is everything committed. A checksum disagreement at that point
//! means the rebuild corrupted a byte it had no business touching, which
//! is fatal.

use std::ops::Range;

use crate::core::error::fatal_error;
use crate::encoder::checksum::{checksum, merge_exclusions};
use crate::encoder::maps::SideTables;
use crate::encoder::reloc::{LabelPcs, RelocKind, RelocTable};
use crate::ir::Opcode;
use crate::x64::emitter::nop_run;
use crate::x64::opcodes::desc;

/// Upper bound on NOP bytes inserted ahead of one loop-top label.
pub const MAX_LOOP_ALIGN_PAD: u32 = 12;

#[derive(Debug, Clone, Copy)]
pub struct ShortenOptions {
    pub max_align_pad: u32,
}

impl Default for ShortenOptions {
    fn default() -> Self {
        Self {
            max_align_pad: MAX_LOOP_ALIGN_PAD,
        }
    }
}

/// Result of one shortening attempt. `code` is `Some` only when the pass
/// committed; on a no-op or rollback the caller keeps its buffer.
#[derive(Debug, Default)]
pub struct ShortenOutcome {
    pub code: Option<Vec<u8>>,
    pub branches_shortened: u32,
    pub bytes_saved: u32,
    pub align_bytes: u32,
    pub rolled_back: bool,
}

/// One branch marked for the rel8 rewrite.
#[derive(Debug, Clone, Copy)]
struct Short {
    reloc_idx: usize,
    start: u32,
    len: u32,
    saving: u32,
    /// Total savings including this one, for prefix-sum lookups.
    cum_after: u32,
}

/// One NOP insertion ahead of a shifted loop-top label.
#[derive(Debug, Clone, Copy)]
struct Pad {
    pc: u32,
    pad: u32,
    cum_after: u32,
}

/// Bytes removed by shortenings that lie strictly before `x`.
fn saved_before(shorts: &[Short], x: u32) -> u32 {
    let idx = shorts.partition_point(|s| s.start < x);
    if idx == 0 {
        0
    } else {
        shorts[idx - 1].cum_after
    }
}

/// Bytes inserted by pads at or before `x`. A pad sits between the label
/// and everything emitted before it, so the label itself (and anything at
/// its offset) lands after the pad.
fn padded_through(pads: &[Pad], x: u32) -> u32 {
    let idx = pads.partition_point(|p| p.pc <= x);
    if idx == 0 {
        0
    } else {
        pads[idx - 1].cum_after
    }
}

fn shifted(shorts: &[Short], pads: &[Pad], x: u32) -> u32 {
    x - saved_before(shorts, x) + padded_through(pads, x)
}

/// Run the shortening pass over the scratch buffer. `code` holds the main
/// code followed by the deferred jump tables; `main_code_size` is where
/// the tables begin. Side tables are renumbered and the relocation/label
/// state rewritten only when the pass commits.
pub fn shorten(
    code: &[u8],
    main_code_size: u32,
    relocs: &mut RelocTable,
    labels: &mut LabelPcs,
    tables: &mut SideTables,
    opts: &ShortenOptions,
) -> ShortenOutcome {
    // Phase 1: mark shorts in ascending offset order. A branch's tentative
    // displacement accounts for savings already decided (all of which lie
    // before it) plus its own, since bytes past its start shift too.
    let mut shorts: Vec<Short> = Vec::new();
    let mut cum = 0u32;
    for (idx, entry) in relocs.iter().enumerate() {
        let kind = entry.kind;
        if !matches!(kind, RelocKind::BranchRel32 { .. }) || entry.in_tail {
            continue;
        }
        let start = entry.instr_start();
        let len = entry.branch_len();
        let saving = entry.shortening_saving();
        let target = labels.pc(entry.label);

        let new_start = start - cum;
        let new_target = if target > start {
            target - cum - saving
        } else {
            target - saved_before(&shorts, target)
        };
        let disp = new_target as i64 - (new_start as i64 + 2);
        if i8::try_from(disp).is_ok() {
            cum += saving;
            shorts.push(Short {
                reloc_idx: idx,
                start,
                len,
                saving,
                cum_after: cum,
            });
        }
    }
    // Phase 2: pad every loop top to a 16-byte boundary at its settled
    // address. The max-pad bound is the only reason to leave one
    // unaligned.
    let mut pads: Vec<Pad> = Vec::new();
    let mut pad_cum = 0u32;
    for entry in relocs.iter() {
        if !matches!(entry.kind, RelocKind::AlignedLabel) {
            continue;
        }
        let pc = entry.offset;
        let moved = pc - saved_before(&shorts, pc) + pad_cum;
        let rem = moved % 16;
        if rem == 0 {
            continue;
        }
        let pad = 16 - rem;
        if pad > opts.max_align_pad {
            continue;
        }
        pad_cum += pad;
        pads.push(Pad {
            pc,
            pad,
            cum_after: pad_cum,
        });
    }
    if shorts.is_empty() && pads.is_empty() {
        return ShortenOutcome::default();
    }

    // Phase 3: recheck every short against the final layout. Alignment
    // insertions only ever grow a displacement, so a single recheck
    // suffices; any miss rolls the whole pass back.
    for (idx, entry) in relocs.iter().enumerate() {
        let Some(short) = shorts.iter().find(|s| s.reloc_idx == idx) else {
            continue;
        };
        let target = labels.pc(entry.label);
        let new_start = shifted(&shorts, &pads, short.start);
        let new_target = shifted(&shorts, &pads, target);
        let disp = new_target as i64 - (new_start as i64 + 2);
        if i8::try_from(disp).is_err() {
            log::debug!(
                "branch shortening rolled back: branch at {:#x} no longer reaches {:#x}",
                short.start,
                target
            );
            return ShortenOutcome {
                rolled_back: true,
                ..ShortenOutcome::default()
            };
        }
    }

    let total_saved = shorts.last().map(|s| s.cum_after).unwrap_or(0);
    let total_pad = pads.last().map(|p| p.cum_after).unwrap_or(0);

    // Phase 4: rebuild the buffer. Verbatim segments, 2-byte short
    // encodings with zeroed rel8 placeholders, NOP runs at pad points, and
    // the jump tables copied through untouched.
    let main = &code[..main_code_size as usize];
    let mut out: Vec<u8> =
        Vec::with_capacity(code.len() - total_saved as usize + total_pad as usize);
    let mut nop_ranges: Vec<Range<u32>> = Vec::new();
    let mut short_spans: Vec<Range<u32>> = Vec::new();

    let mut pos = 0usize;
    let mut short_it = shorts.iter().peekable();
    let mut pad_it = pads.iter().peekable();
    loop {
        let next_short = short_it.peek().map(|s| s.start);
        let next_pad = pad_it.peek().map(|p| p.pc);
        // A pad at the same offset as a branch start goes first: the label
        // precedes the instruction.
        let take_pad = match (next_short, next_pad) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(s), Some(p)) => p <= s,
        };
        if take_pad {
            let pad = pad_it.next().unwrap();
            out.extend_from_slice(&main[pos..pad.pc as usize]);
            pos = pad.pc as usize;
            let at = out.len() as u32;
            nop_run(&mut out, pad.pad as usize);
            nop_ranges.push(at..at + pad.pad);
        } else if let Some(short) = short_it.next() {
            out.extend_from_slice(&main[pos..short.start as usize]);
            let at = out.len() as u32;
            let opcode = if main[short.start as usize] == 0x0F {
                let cc = main[short.start as usize + 1] & 0x0F;
                desc(Opcode::Jcc).template[1] | cc
            } else {
                desc(Opcode::Jmp).template[1]
            };
            out.push(opcode);
            out.push(0);
            short_spans.push(at..at + 2);
            pos = (short.start + short.len) as usize;
        } else {
            break;
        }
    }
    out.extend_from_slice(&main[pos..]);
    if out.len() as u32 != main_code_size - total_saved + total_pad {
        fatal_error("shortened buffer size disagrees with the layout delta");
    }
    out.extend_from_slice(&code[main_code_size as usize..]);

    // Phase 5: renumber relocations, labels, and side tables by the
    // cumulative delta, all on clones.
    let mut new_relocs = relocs.clone();
    let mut short_it = shorts.iter().peekable();
    for (idx, entry) in new_relocs.iter_mut().enumerate() {
        if short_it.peek().map(|s| s.reloc_idx) == Some(idx) {
            let short = short_it.next().unwrap();
            let cond = matches!(entry.kind, RelocKind::BranchRel32 { cond: true });
            entry.kind = RelocKind::BranchRel8 { cond };
            entry.offset = shifted(&shorts, &pads, short.start) + 1;
        } else {
            entry.offset = shifted(&shorts, &pads, entry.offset);
        }
    }
    let mut new_labels = labels.clone();
    new_labels.renumber(|pc| shifted(&shorts, &pads, pc));
    let mut new_tables = tables.clone();
    new_tables.renumber(|off| shifted(&shorts, &pads, off));

    // Phase 6: both buffers must agree byte-for-byte outside relocation
    // payloads, rewritten branch spans, and inserted NOP runs.
    let old_spans: Vec<Range<u32>> = shorts.iter().map(|s| s.start..s.start + s.len).collect();
    let old_excl = merge_exclusions(&relocs.payload_ranges(), &old_spans);
    let new_excl = merge_exclusions(
        &merge_exclusions(&new_relocs.payload_ranges(), &short_spans),
        &nop_ranges,
    );
    if checksum(code, &old_excl) != checksum(&out, &new_excl) {
        fatal_error("code checksum mismatch after branch shortening");
    }

    log::debug!(
        "shortened {} branches ({} bytes saved, {} alignment bytes)",
        shorts.len(),
        total_saved,
        total_pad
    );

    *relocs = new_relocs;
    *labels = new_labels;
    *tables = new_tables;
    ShortenOutcome {
        code: Some(out),
        branches_shortened: shorts.len() as u32,
        bytes_saved: total_saved,
        align_bytes: total_pad,
        rolled_back: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::reloc::RelocEntry;

    fn jmp_long(target_payload: &mut Vec<u8>) {
        target_payload.push(0xE9);
        target_payload.extend_from_slice(&[0, 0, 0, 0]);
    }

    fn jcc_long(code: &mut Vec<u8>, cc: u8) {
        code.push(0x0F);
        code.push(0x80 | cc);
        code.extend_from_slice(&[0, 0, 0, 0]);
    }

    fn branch32(offset: u32, label: u32, cond: bool) -> RelocEntry {
        RelocEntry {
            kind: RelocKind::BranchRel32 { cond },
            offset,
            label,
            in_tail: false,
        }
    }

    #[test]
    fn forward_jmp_within_reach_is_shortened() {
        let mut code = Vec::new();
        jmp_long(&mut code);
        code.extend(std::iter::repeat(0x90).take(10));
        let main = code.len() as u32; // 15

        let mut relocs = RelocTable::new();
        relocs.push(branch32(1, 0, false));
        let mut labels = LabelPcs::new(1);
        labels.define(0, 15);
        let mut tables = SideTables::default();

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.bytes_saved, 3);
        assert_eq!(outcome.align_bytes, 0);
        assert!(!outcome.rolled_back);

        let new_code = outcome.code.unwrap();
        assert_eq!(new_code.len(), 12);
        assert_eq!(new_code[0], 0xEB);
        assert_eq!(labels.pc(0), 12);

        let entry = relocs.iter().next().unwrap();
        assert_eq!(entry.kind, RelocKind::BranchRel8 { cond: false });
        assert_eq!(entry.offset, 1);

        // Resolving against the new layout writes a rel8 of 10.
        let mut resolved = new_code.clone();
        relocs.apply(&mut resolved, 0x1000, 12, &labels);
        assert_eq!(resolved[1], 10);
    }

    #[test]
    fn out_of_reach_branch_is_left_alone() {
        let mut code = Vec::new();
        jmp_long(&mut code);
        code.extend(std::iter::repeat(0x90).take(200));
        let main = code.len() as u32;

        let mut relocs = RelocTable::new();
        relocs.push(branch32(1, 0, false));
        let mut labels = LabelPcs::new(1);
        labels.define(0, main);
        let mut tables = SideTables::default();

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert!(outcome.code.is_none());
        assert_eq!(outcome.bytes_saved, 0);
        assert_eq!(labels.pc(0), main);
        assert_eq!(relocs.iter().next().unwrap().offset, 1);
    }

    #[test]
    fn mixed_reach_shortens_only_the_near_branch() {
        // A long conditional over ~250 bytes, then a jmp over 43.
        let mut code = Vec::new();
        jcc_long(&mut code, 0x4); // offsets 0..6, label 0 at the end
        code.extend(std::iter::repeat(0x90).take(94)); // up to 100
        jmp_long(&mut code); // 100..105, label 1 at 150
        code.extend(std::iter::repeat(0x90).take(145));
        let main = code.len() as u32; // 250

        let mut relocs = RelocTable::new();
        relocs.push(branch32(2, 0, true));
        relocs.push(branch32(101, 1, false));
        let mut labels = LabelPcs::new(2);
        labels.define(0, 250);
        labels.define(1, 150);
        let mut tables = SideTables::default();
        tables.push_bailout(150, crate::ir::BailoutInfo {
            bailout_id: 7,
            kind: crate::ir::BailoutKind::Normal,
        });

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.branches_shortened, 1);
        assert_eq!(outcome.bytes_saved, 3);

        let new_code = outcome.code.unwrap();
        assert_eq!(new_code.len(), 247);
        // The conditional keeps its long form and its offset.
        let entries: Vec<_> = relocs.iter().copied().collect();
        assert_eq!(entries[0].kind, RelocKind::BranchRel32 { cond: true });
        assert_eq!(entries[0].offset, 2);
        // The jmp was rewritten in place.
        assert_eq!(entries[1].kind, RelocKind::BranchRel8 { cond: false });
        assert_eq!(entries[1].offset, 101);
        assert_eq!(new_code[100], 0xEB);

        // Labels and side tables past the rewrite shifted by the saving.
        assert_eq!(labels.pc(0), 247);
        assert_eq!(labels.pc(1), 147);
        assert_eq!(tables.bailouts[0].offset, 147);
    }

    #[test]
    fn shifted_loop_top_is_realigned() {
        // jmp to an aligned label at 16; shortening moves it to 13, so a
        // 3-byte NOP run restores the boundary.
        let mut code = Vec::new();
        jmp_long(&mut code);
        code.extend(std::iter::repeat(0x90).take(11)); // label at 16
        code.extend(std::iter::repeat(0x90).take(16));
        let main = code.len() as u32; // 32

        let mut relocs = RelocTable::new();
        relocs.push(branch32(1, 0, false));
        relocs.push(RelocEntry {
            kind: RelocKind::AlignedLabel,
            offset: 16,
            label: 0,
            in_tail: false,
        });
        let mut labels = LabelPcs::new(1);
        labels.define(0, 16);
        let mut tables = SideTables::default();

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.bytes_saved, 3);
        assert_eq!(outcome.align_bytes, 3);

        let new_code = outcome.code.unwrap();
        assert_eq!(new_code.len(), 32);
        assert_eq!(labels.pc(0), 16);
        assert_eq!(labels.pc(0) % 16, 0);
        // The pad sits right before the label: a 3-byte canonical NOP.
        assert_eq!(&new_code[13..16], &[0x0F, 0x1F, 0x00]);
    }

    #[test]
    fn unshifted_loop_top_is_still_aligned() {
        // No branch shrinks here, but the loop top sits at 7 and must be
        // padded out to 16 all the same.
        let mut code = Vec::new();
        code.extend(std::iter::repeat(0x90).take(7));
        code.extend(std::iter::repeat(0x90).take(20));
        let main = code.len() as u32; // 27

        let mut relocs = RelocTable::new();
        relocs.push(RelocEntry {
            kind: RelocKind::AlignedLabel,
            offset: 7,
            label: 0,
            in_tail: false,
        });
        let mut labels = LabelPcs::new(1);
        labels.define(0, 7);
        let mut tables = SideTables::default();
        tables.push_pragma(10, 1);

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.branches_shortened, 0);
        assert_eq!(outcome.bytes_saved, 0);
        assert_eq!(outcome.align_bytes, 9);

        let new_code = outcome.code.unwrap();
        assert_eq!(new_code.len(), 36);
        assert_eq!(labels.pc(0), 16);
        assert_eq!(tables.throw_map[0].offset, 19);
    }

    #[test]
    fn oversized_pad_leaves_the_loop_top_alone() {
        // A loop top at 14 would need 2 bytes; one at 1 would need 15,
        // past the bound, so only the first is padded.
        let code = vec![0x90; 40];
        let main = code.len() as u32;

        let mut relocs = RelocTable::new();
        relocs.push(RelocEntry {
            kind: RelocKind::AlignedLabel,
            offset: 1,
            label: 0,
            in_tail: false,
        });
        relocs.push(RelocEntry {
            kind: RelocKind::AlignedLabel,
            offset: 14,
            label: 1,
            in_tail: false,
        });
        let mut labels = LabelPcs::new(2);
        labels.define(0, 1);
        labels.define(1, 14);
        let mut tables = SideTables::default();

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.align_bytes, 2);
        assert_eq!(labels.pc(0), 1);
        assert_eq!(labels.pc(1), 16);
    }

    #[test]
    fn alignment_overflow_rolls_back_whole_pass() {
        // The jmp's rel8 budget is exactly consumed; an 11-byte pad ahead
        // of its target pushes the displacement past i8 range.
        let mut code = Vec::new();
        jmp_long(&mut code);
        code.extend(std::iter::repeat(0x90).take(125)); // target at 130
        code.extend(std::iter::repeat(0x90).take(20));
        let main = code.len() as u32;

        let mut relocs = RelocTable::new();
        relocs.push(branch32(1, 0, false));
        relocs.push(RelocEntry {
            kind: RelocKind::AlignedLabel,
            offset: 8,
            label: 1,
            in_tail: false,
        });
        let mut labels = LabelPcs::new(2);
        labels.define(0, 130);
        labels.define(1, 8);
        let mut tables = SideTables::default();

        let before: Vec<_> = relocs.iter().copied().collect();
        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert!(outcome.rolled_back);
        assert!(outcome.code.is_none());

        // Nothing was touched.
        assert_eq!(labels.pc(0), 130);
        assert_eq!(labels.pc(1), 8);
        let after: Vec<_> = relocs.iter().copied().collect();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.kind, a.kind);
            assert_eq!(b.offset, a.offset);
        }
    }

    #[test]
    fn backward_branch_uses_settled_target() {
        // Label at 0, filler, then a jmp back to it from offset 20.
        let mut code = Vec::new();
        code.extend(std::iter::repeat(0x90).take(20));
        jmp_long(&mut code);
        let main = code.len() as u32; // 25

        let mut relocs = RelocTable::new();
        relocs.push(branch32(21, 0, false));
        let mut labels = LabelPcs::new(1);
        labels.define(0, 0);
        let mut tables = SideTables::default();

        let outcome = shorten(
            &code,
            main,
            &mut relocs,
            &mut labels,
            &mut tables,
            &ShortenOptions::default(),
        );
        assert_eq!(outcome.bytes_saved, 3);
        let new_code = outcome.code.unwrap();
        assert_eq!(new_code.len(), 22);

        let mut resolved = new_code.clone();
        relocs.apply(&mut resolved, 0x1000, 22, &labels);
        // rel8 from the end of the short encoding at 20..22 back to 0.
        assert_eq!(resolved[21] as i8, -22);
    }
}
