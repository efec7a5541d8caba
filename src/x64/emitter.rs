//! Bit-level x86-64 instruction encoding.
//!
//! This is the per-instruction half of the pipeline: one lowered
//! instruction in, bytes out, relocation entries recorded for anything
//! whose value depends on final layout. Byte selection is driven by the
//! opcode descriptor table; this module owns the REX/ModRM/SIB plumbing
//! and the operand-shape dispatch.
//!
//! All data operations are encoded at 64-bit operand size (the runtime's
//! values are machine words); push/pop and indirect calls default to
//! 64-bit without REX.W, and the inlinee patch point is a deliberate
//! 32-bit immediate.

use crate::core::error::{JitError, JitResult};
use crate::encoder::buffer::EncodeBuffer;
use crate::encoder::reloc::{RelocEntry, RelocKind, RelocTable};
use crate::ir::{CondCode, LabelId, MachOp, Opcode, Operand};
use crate::x64::opcodes::{desc, flags, EncodingForm};
use crate::x64::regs::Reg;

/// Encodes single instructions into the scratch buffer.
pub struct Emitter;

const MOD_INDIR: u8 = 0b00;
const MOD_DISP8: u8 = 0b01;
const MOD_DISP32: u8 = 0b10;
const MOD_REG: u8 = 0b11;

#[inline]
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

#[inline]
fn sib(scale_log2: u8, index: u8, base: u8) -> u8 {
    (scale_log2 << 6) | ((index & 7) << 3) | (base & 7)
}

/// Emit a REX prefix. `w` selects 64-bit operand size; `r`/`x`/`b`
/// extend the ModRM reg, SIB index, and rm/base fields. The prefix is
/// skipped entirely when no bit is set.
#[inline]
fn emit_rex(buf: &mut EncodeBuffer<'_>, w: bool, r: u8, x: u8, b: u8) {
    let byte = 0x40 | ((w as u8) << 3) | (r << 2) | (x << 1) | b;
    if byte != 0x40 {
        buf.emit_u8(byte);
    }
}

fn scale_log2(scale: u8, opcode: Opcode) -> JitResult<u8> {
    match scale {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        _ => Err(JitError::InvalidOperands {
            opcode,
            reason: "scale must be 1, 2, 4 or 8",
        }),
    }
}

/// Emit ModRM (+SIB, +displacement) addressing `[base + index*scale + offset]`
/// with `reg_field` in the reg slot. REX extension bits are the caller's
/// responsibility since the prefix precedes the opcode byte.
fn emit_mem(
    buf: &mut EncodeBuffer<'_>,
    reg_field: u8,
    base: Reg,
    index: Option<(Reg, u8)>,
    offset: i32,
) {
    // rbp/r13 as base cannot use mod=00 (that slot means disp32-no-base),
    // so force at least a disp8.
    let needs_disp = offset != 0 || base.low3() == 5;
    let (mode, disp8) = if !needs_disp {
        (MOD_INDIR, false)
    } else if (i8::MIN as i32..=i8::MAX as i32).contains(&offset) {
        (MOD_DISP8, true)
    } else {
        (MOD_DISP32, false)
    };

    match index {
        None if base.low3() != 4 => {
            buf.emit_u8(modrm(mode, reg_field, base.low3()));
        }
        None => {
            // rsp/r12 as base always needs a SIB byte with index=none.
            buf.emit_u8(modrm(mode, reg_field, 4));
            buf.emit_u8(sib(0, 4, base.low3()));
        }
        Some((idx, log2)) => {
            buf.emit_u8(modrm(mode, reg_field, 4));
            buf.emit_u8(sib(log2, idx.low3(), base.low3()));
        }
    }

    if needs_disp {
        if disp8 {
            buf.emit_u8(offset as i8 as u8);
        } else {
            buf.emit_i32(offset);
        }
    }
}

fn index_rex_bit(index: Option<(Reg, u8)>) -> u8 {
    index.map(|(r, _)| r.rex_bit()).unwrap_or(0)
}

fn check_index(index: Option<Reg>, opcode: Opcode) -> JitResult<Option<Reg>> {
    if let Some(idx) = index {
        // rsp cannot be an index register (its slot encodes "none").
        if idx.low3() == 4 && idx.rex_bit() == 0 {
            return Err(JitError::InvalidOperands {
                opcode,
                reason: "rsp cannot be used as an index register",
            });
        }
    }
    Ok(index)
}

impl Emitter {
    /// Encode an ordinary machine op.
    pub fn encode_op(
        op: &MachOp,
        buf: &mut EncodeBuffer<'_>,
        relocs: &mut RelocTable,
    ) -> JitResult<()> {
        let d = desc(op.opcode);
        match d.form {
            EncodingForm::ModRm => Self::encode_modrm_op(op, buf, relocs),
            EncodingForm::PlusReg => Self::encode_plus_reg(op, buf),
            EncodingForm::Special => Self::encode_special(op, buf),
            EncodingForm::Empty => Err(JitError::UnsupportedInstruction(op.opcode)),
        }
    }

    fn encode_modrm_op(
        op: &MachOp,
        buf: &mut EncodeBuffer<'_>,
        relocs: &mut RelocTable,
    ) -> JitResult<()> {
        let d = desc(op.opcode);
        let invalid = |reason| JitError::InvalidOperands {
            opcode: op.opcode,
            reason,
        };
        let emit_opcode = |buf: &mut EncodeBuffer<'_>, byte: u8| {
            if let Some(lead) = d.lead_in {
                buf.emit_u8(lead);
            }
            buf.emit_u8(byte);
        };

        match (op.dst, op.src) {
            (Some(Operand::Reg(dst)), Some(Operand::Reg(src))) => {
                // test only has the r/m,reg direction; everything else
                // uses the reg,r/m (load) template.
                let (byte, reg, rm) = if op.opcode == Opcode::Test {
                    (d.template[1], src, dst)
                } else {
                    (d.template[0], dst, src)
                };
                emit_rex(buf, true, reg.rex_bit(), 0, rm.rex_bit());
                emit_opcode(buf, byte);
                buf.emit_u8(modrm(MOD_REG, reg.low3(), rm.low3()));
                Ok(())
            }
            (
                Some(Operand::Reg(dst)),
                Some(Operand::Indir {
                    base,
                    index,
                    scale,
                    offset,
                }),
            ) => {
                let index = check_index(index, op.opcode)?
                    .map(|i| Ok::<_, JitError>((i, scale_log2(scale, op.opcode)?)))
                    .transpose()?;
                emit_rex(buf, true, dst.rex_bit(), index_rex_bit(index), base.rex_bit());
                emit_opcode(buf, d.template[0]);
                emit_mem(buf, dst.low3(), base, index, offset);
                Ok(())
            }
            (
                Some(Operand::Indir {
                    base,
                    index,
                    scale,
                    offset,
                }),
                Some(Operand::Reg(src)),
            ) => {
                if d.template[1] == 0 {
                    return Err(invalid("no store form for this opcode"));
                }
                let index = check_index(index, op.opcode)?
                    .map(|i| Ok::<_, JitError>((i, scale_log2(scale, op.opcode)?)))
                    .transpose()?;
                emit_rex(buf, true, src.rex_bit(), index_rex_bit(index), base.rex_bit());
                emit_opcode(buf, d.template[1]);
                emit_mem(buf, src.low3(), base, index, offset);
                Ok(())
            }
            (Some(Operand::Reg(dst)), Some(Operand::Imm(imm))) => {
                Self::encode_reg_imm(op.opcode, dst, imm, buf)
            }
            (
                Some(Operand::Indir {
                    base,
                    index,
                    scale,
                    offset,
                }),
                Some(Operand::Imm(imm)),
            ) => {
                if !d.has(flags::HAS_IMM_FORM) {
                    return Err(invalid("no immediate form for this opcode"));
                }
                let imm32 = i32::try_from(imm).map_err(|_| invalid("immediate exceeds 32 bits"))?;
                let index = check_index(index, op.opcode)?
                    .map(|i| Ok::<_, JitError>((i, scale_log2(scale, op.opcode)?)))
                    .transpose()?;
                emit_rex(buf, true, 0, index_rex_bit(index), base.rex_bit());
                buf.emit_u8(d.template[2]);
                emit_mem(buf, d.digit, base, index, offset);
                buf.emit_i32(imm32);
                Ok(())
            }
            (Some(Operand::Reg(dst)), Some(Operand::Label(label))) => {
                // A label's final address as a value (jump-table base):
                // imm64 placeholder patched once layout settles.
                if op.opcode != Opcode::Mov {
                    return Err(invalid("label-address source requires mov"));
                }
                emit_rex(buf, true, 0, 0, dst.rex_bit());
                buf.emit_u8(0xB8 | dst.low3());
                let offset = buf.emit_placeholder(8);
                relocs.push(RelocEntry {
                    kind: RelocKind::LabelUse,
                    offset,
                    label,
                    in_tail: false,
                });
                Ok(())
            }
            (Some(Operand::Reg(dst)), Some(Operand::MemRef(addr))) => {
                // Absolute runtime address materialized as imm64.
                if op.opcode != Opcode::Mov {
                    return Err(invalid("absolute address source requires mov"));
                }
                emit_rex(buf, true, 0, 0, dst.rex_bit());
                buf.emit_u8(0xB8 | dst.low3());
                buf.emit_u64(addr);
                Ok(())
            }
            _ => Err(invalid("operand shape not encodable")),
        }
    }

    fn encode_reg_imm(
        opcode: Opcode,
        dst: Reg,
        imm: i64,
        buf: &mut EncodeBuffer<'_>,
    ) -> JitResult<()> {
        let d = desc(opcode);
        let invalid = |reason| JitError::InvalidOperands { opcode, reason };
        if !d.has(flags::HAS_IMM_FORM) {
            return Err(invalid("no immediate form for this opcode"));
        }

        let fits32 = i32::try_from(imm).is_ok();
        if opcode == Opcode::Mov {
            if fits32 && d.has(flags::SHRINK_IMM) {
                // Canonical short form: C7 /0 with sign-extended imm32.
                emit_rex(buf, true, 0, 0, dst.rex_bit());
                buf.emit_u8(d.template[2]);
                buf.emit_u8(modrm(MOD_REG, d.digit, dst.low3()));
                buf.emit_i32(imm as i32);
            } else {
                emit_rex(buf, true, 0, 0, dst.rex_bit());
                buf.emit_u8(0xB8 | dst.low3());
                buf.emit_u64(imm as u64);
            }
            return Ok(());
        }

        if !fits32 {
            return Err(invalid("immediate exceeds 32 bits"));
        }
        let imm = imm as i32;
        let fits8 = i8::try_from(imm).is_ok();
        emit_rex(buf, true, 0, 0, dst.rex_bit());
        if fits8 && opcode != Opcode::Test {
            // 0x83 group: sign-extended imm8 form of the 0x81 group.
            buf.emit_u8(0x83);
            buf.emit_u8(modrm(MOD_REG, d.digit, dst.low3()));
            buf.emit_u8(imm as i8 as u8);
        } else {
            buf.emit_u8(d.template[2]);
            buf.emit_u8(modrm(MOD_REG, d.digit, dst.low3()));
            buf.emit_i32(imm);
        }
        Ok(())
    }

    fn encode_plus_reg(op: &MachOp, buf: &mut EncodeBuffer<'_>) -> JitResult<()> {
        let d = desc(op.opcode);
        match (op.dst, op.src) {
            (Some(Operand::Reg(reg)), None) => {
                // Push/pop default to 64-bit; only REX.B is ever needed.
                emit_rex(buf, false, 0, 0, reg.rex_bit());
                buf.emit_u8(d.template[0] | reg.low3());
                Ok(())
            }
            (
                Some(Operand::Indir {
                    base,
                    index,
                    scale,
                    offset,
                }),
                None,
            ) => {
                let index = check_index(index, op.opcode)?
                    .map(|i| Ok::<_, JitError>((i, scale_log2(scale, op.opcode)?)))
                    .transpose()?;
                emit_rex(buf, false, 0, index_rex_bit(index), base.rex_bit());
                buf.emit_u8(d.template[1]);
                emit_mem(buf, d.digit, base, index, offset);
                Ok(())
            }
            (Some(Operand::Imm(imm)), None) if d.has(flags::HAS_IMM_FORM) => {
                let imm32 = i32::try_from(imm).map_err(|_| JitError::InvalidOperands {
                    opcode: op.opcode,
                    reason: "push immediate exceeds 32 bits",
                })?;
                buf.emit_u8(d.template[2]);
                buf.emit_i32(imm32);
                Ok(())
            }
            _ => Err(JitError::InvalidOperands {
                opcode: op.opcode,
                reason: "operand shape not encodable",
            }),
        }
    }

    fn encode_special(op: &MachOp, buf: &mut EncodeBuffer<'_>) -> JitResult<()> {
        match op.opcode {
            Opcode::Nop => {
                buf.emit_u8(0x90);
                Ok(())
            }
            Opcode::Ret => {
                buf.emit_u8(0xC3);
                Ok(())
            }
            Opcode::Call => Self::encode_call(op, buf),
            other => Err(JitError::UnsupportedInstruction(other)),
        }
    }

    fn encode_call(op: &MachOp, buf: &mut EncodeBuffer<'_>) -> JitResult<()> {
        let d = desc(Opcode::Call);
        match (op.dst, op.src) {
            (Some(Operand::Reg(target)), None) => {
                emit_rex(buf, false, 0, 0, target.rex_bit());
                buf.emit_u8(d.template[0]);
                buf.emit_u8(modrm(MOD_REG, d.digit, target.low3()));
                Ok(())
            }
            (
                Some(Operand::Indir {
                    base,
                    index,
                    scale,
                    offset,
                }),
                None,
            ) => {
                let index = check_index(index, Opcode::Call)?
                    .map(|i| Ok::<_, JitError>((i, scale_log2(scale, Opcode::Call)?)))
                    .transpose()?;
                emit_rex(buf, false, 0, index_rex_bit(index), base.rex_bit());
                buf.emit_u8(d.template[0]);
                emit_mem(buf, d.digit, base, index, offset);
                Ok(())
            }
            (Some(Operand::MemRef(addr)), None) => {
                // Helper call to an absolute address: materialize through
                // rax (documented scratch for helper calls) and call it.
                emit_rex(buf, true, 0, 0, 0);
                buf.emit_u8(0xB8);
                buf.emit_u64(addr);
                buf.emit_u8(d.template[0]);
                buf.emit_u8(modrm(MOD_REG, d.digit, 0));
                Ok(())
            }
            _ => Err(JitError::InvalidOperands {
                opcode: Opcode::Call,
                reason: "operand shape not encodable",
            }),
        }
    }

    /// Encode a relative branch in its long form with a zeroed
    /// displacement and record the fixup.
    pub fn encode_branch(
        cond: Option<CondCode>,
        target: LabelId,
        buf: &mut EncodeBuffer<'_>,
        relocs: &mut RelocTable,
    ) {
        match cond {
            Some(cc) => {
                let d = desc(Opcode::Jcc);
                buf.emit_u8(d.lead_in.unwrap_or(0x0F));
                buf.emit_u8(d.template[0] | cc.encoding());
                let offset = buf.emit_placeholder(4);
                relocs.push(RelocEntry {
                    kind: RelocKind::BranchRel32 { cond: true },
                    offset,
                    label: target,
                    in_tail: false,
                });
            }
            None => {
                let d = desc(Opcode::Jmp);
                buf.emit_u8(d.template[0]);
                let offset = buf.emit_placeholder(4);
                relocs.push(RelocEntry {
                    kind: RelocKind::BranchRel32 { cond: false },
                    offset,
                    label: target,
                    in_tail: false,
                });
            }
        }
    }

    /// Encode the multi-way branch head: load the jump table's final
    /// address (a label placed at the buffer tail) and jump through it.
    pub fn encode_multi_branch(
        index: Reg,
        scratch: Reg,
        table_label: LabelId,
        buf: &mut EncodeBuffer<'_>,
        relocs: &mut RelocTable,
    ) -> JitResult<()> {
        check_index(Some(index), Opcode::MultiBranch)?;

        // mov scratch, imm64 <table address>
        emit_rex(buf, true, 0, 0, scratch.rex_bit());
        buf.emit_u8(0xB8 | scratch.low3());
        let offset = buf.emit_placeholder(8);
        relocs.push(RelocEntry {
            kind: RelocKind::LabelUse,
            offset,
            label: table_label,
            in_tail: false,
        });

        // jmp [scratch + index*8]
        let d = desc(Opcode::MultiBranch);
        emit_rex(buf, false, 0, index.rex_bit(), scratch.rex_bit());
        buf.emit_u8(d.template[0]);
        emit_mem(buf, d.digit, scratch, Some((index, 3)), 0);
        Ok(())
    }

    /// Encode the inlinee patch point: a 32-bit immediate that will hold
    /// the final base-relative offset of the inlinee boundary.
    pub fn encode_inlinee_start(
        dst: Reg,
        patch_label: LabelId,
        buf: &mut EncodeBuffer<'_>,
        relocs: &mut RelocTable,
    ) {
        let d = desc(Opcode::InlineeStart);
        emit_rex(buf, false, 0, 0, dst.rex_bit());
        buf.emit_u8(d.template[0]);
        buf.emit_u8(modrm(MOD_REG, d.digit, dst.low3()));
        let offset = buf.emit_placeholder(4);
        relocs.push(RelocEntry {
            kind: RelocKind::InlineeOffset,
            offset,
            label: patch_label,
            in_tail: false,
        });
    }
}

/// Canonical multi-byte NOP encodings, one row per length 1..=9.
#[rustfmt::skip]
static NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Append `len` bytes of alignment padding as canonical multi-byte NOPs.
pub fn nop_run(out: &mut Vec<u8>, mut len: usize) {
    while len > 0 {
        let chunk = len.min(NOPS.len());
        out.extend_from_slice(NOPS[chunk - 1]);
        len -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::regs::{R12, R13, R8, RAX, RBP, RCX, RDX, RSP};
    use bumpalo::Bump;

    fn encode(op: MachOp) -> Vec<u8> {
        let arena = Bump::new();
        let mut buf = EncodeBuffer::new_in(&arena, 64);
        let mut relocs = RelocTable::new();
        Emitter::encode_op(&op, &mut buf, &mut relocs).unwrap();
        buf.as_slice().to_vec()
    }

    fn rr(opcode: Opcode, dst: Reg, src: Reg) -> MachOp {
        MachOp {
            opcode,
            dst: Some(Operand::Reg(dst)),
            src: Some(Operand::Reg(src)),
        }
    }

    #[test]
    fn reg_reg_forms() {
        assert_eq!(encode(rr(Opcode::Mov, RAX, RCX)), vec![0x48, 0x8B, 0xC1]);
        assert_eq!(encode(rr(Opcode::Add, RDX, R8)), vec![0x49, 0x03, 0xD0]);
        assert_eq!(encode(rr(Opcode::Xor, R8, R8)), vec![0x4D, 0x33, 0xC0]);
        // imul has a 0F lead-in.
        assert_eq!(
            encode(rr(Opcode::IMul, RAX, RCX)),
            vec![0x48, 0x0F, 0xAF, 0xC1]
        );
        // test uses the r/m,reg direction.
        assert_eq!(encode(rr(Opcode::Test, RAX, RCX)), vec![0x48, 0x85, 0xC8]);
    }

    #[test]
    fn immediate_canonicalization() {
        // Small immediates take the sign-extended 0x83 group.
        let add4 = encode(MachOp {
            opcode: Opcode::Add,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Imm(4)),
        });
        assert_eq!(add4, vec![0x48, 0x83, 0xC0, 0x04]);

        let add_big = encode(MachOp {
            opcode: Opcode::Add,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Imm(0x100)),
        });
        assert_eq!(add_big, vec![0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]);

        // mov shrinks a fitting imm64 to the C7 form...
        let mov_small = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RCX)),
            src: Some(Operand::Imm(7)),
        });
        assert_eq!(mov_small, vec![0x48, 0xC7, 0xC1, 0x07, 0x00, 0x00, 0x00]);

        // ...and keeps B8+r imm64 for wide values.
        let mov_wide = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Imm(0x1_0000_0000)),
        });
        assert_eq!(mov_wide[..2], [0x48, 0xB8]);
        assert_eq!(mov_wide.len(), 10);
    }

    #[test]
    fn memory_addressing_edge_cases() {
        // rsp base forces a SIB byte.
        let load_rsp = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Indir {
                base: RSP,
                index: None,
                scale: 1,
                offset: 0,
            }),
        });
        assert_eq!(load_rsp, vec![0x48, 0x8B, 0x04, 0x24]);

        // rbp base forces a disp8 even at offset 0.
        let load_rbp = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Indir {
                base: RBP,
                index: None,
                scale: 1,
                offset: 0,
            }),
        });
        assert_eq!(load_rbp, vec![0x48, 0x8B, 0x45, 0x00]);

        // r13 shares rbp's low bits and the same rule.
        let load_r13 = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Indir {
                base: R13,
                index: None,
                scale: 1,
                offset: 0,
            }),
        });
        assert_eq!(load_r13, vec![0x49, 0x8B, 0x45, 0x00]);

        // Scaled index goes through SIB.
        let store = encode(MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Indir {
                base: RAX,
                index: Some(RCX),
                scale: 8,
                offset: 16,
            }),
            src: Some(Operand::Reg(RDX)),
        });
        assert_eq!(store, vec![0x48, 0x89, 0x54, 0xC8, 0x10]);
    }

    #[test]
    fn rsp_cannot_index() {
        let arena = Bump::new();
        let mut buf = EncodeBuffer::new_in(&arena, 64);
        let mut relocs = RelocTable::new();
        let op = MachOp {
            opcode: Opcode::Mov,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Indir {
                base: RAX,
                index: Some(RSP),
                scale: 1,
                offset: 0,
            }),
        };
        assert!(Emitter::encode_op(&op, &mut buf, &mut relocs).is_err());
    }

    #[test]
    fn push_pop_and_call() {
        let push = encode(MachOp {
            opcode: Opcode::Push,
            dst: Some(Operand::Reg(R12)),
            src: None,
        });
        assert_eq!(push, vec![0x41, 0x54]);

        let pop = encode(MachOp {
            opcode: Opcode::Pop,
            dst: Some(Operand::Reg(RBP)),
            src: None,
        });
        assert_eq!(pop, vec![0x5D]);

        let call = encode(MachOp {
            opcode: Opcode::Call,
            dst: Some(Operand::Reg(RAX)),
            src: None,
        });
        assert_eq!(call, vec![0xFF, 0xD0]);
    }

    #[test]
    fn branches_emit_placeholders_and_relocs() {
        let arena = Bump::new();
        let mut buf = EncodeBuffer::new_in(&arena, 64);
        let mut relocs = RelocTable::new();

        Emitter::encode_branch(Some(CondCode::Equal), 3, &mut buf, &mut relocs);
        Emitter::encode_branch(None, 3, &mut buf, &mut relocs);

        let bytes = buf.as_slice();
        assert_eq!(&bytes[..2], &[0x0F, 0x84]);
        assert_eq!(bytes[6], 0xE9);
        assert_eq!(relocs.len(), 2);
        let entries: Vec<_> = relocs.iter().collect();
        assert_eq!(entries[0].offset, 2);
        assert_eq!(entries[0].branch_len(), 6);
        assert_eq!(entries[1].offset, 7);
        assert_eq!(entries[1].branch_len(), 5);
    }

    #[test]
    fn emitted_bytes_decode_with_iced() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic};

        let mut bytes = Vec::new();
        bytes.extend(encode(rr(Opcode::Mov, RAX, RCX)));
        bytes.extend(encode(MachOp {
            opcode: Opcode::Add,
            dst: Some(Operand::Reg(RAX)),
            src: Some(Operand::Imm(4)),
        }));
        bytes.extend(encode(MachOp {
            opcode: Opcode::Ret,
            dst: None,
            src: None,
        }));

        let mut decoder = Decoder::new(64, &bytes, DecoderOptions::NONE);
        let mnemonics: Vec<Mnemonic> = decoder.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            vec![Mnemonic::Mov, Mnemonic::Add, Mnemonic::Ret]
        );
    }

    #[test]
    fn nop_runs_are_exact_length_and_decode_as_nops() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic};
        for len in 1..=24usize {
            let mut out = Vec::new();
            nop_run(&mut out, len);
            assert_eq!(out.len(), len);
            let mut decoder = Decoder::new(64, &out, DecoderOptions::NONE);
            for instr in decoder.iter() {
                assert_eq!(instr.mnemonic(), Mnemonic::Nop);
            }
        }
    }
}
