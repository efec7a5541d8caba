//! Opcode descriptor table.
//!
//! One immutable record per opcode, holding everything the emitter needs
//! to pick bytes: the encoding form, the byte template for each operand
//! direction, the two-byte escape prefix where required, the ModRM digit
//! of the immediate form, and canonicalization/size flags. The table is a
//! plain `static` indexed by the opcode discriminant and is shared
//! read-only across compile threads.

use crate::ir::Opcode;

/// How an opcode's bytes are assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingForm {
    /// Occupies a list slot but emits no bytes itself.
    Empty,
    /// Standard two-operand ModRM encoding.
    ModRm,
    /// Register encoded in the low bits of the opcode byte (push/pop).
    PlusReg,
    /// Hand-assembled sequence (branches, call, ret, nop runs).
    Special,
}

pub mod flags {
    pub const NONE: u16 = 0;
    /// Has an immediate-operand form (`template[2]` + `digit`).
    pub const HAS_IMM_FORM: u16 = 1 << 0;
    /// Operand size defaults to 64-bit without REX.W (push/pop).
    pub const DEFAULT_64: u16 = 1 << 1;
    /// A 64-bit immediate that fits 32 bits is canonicalized to the
    /// shorter sign-extended form.
    pub const SHRINK_IMM: u16 = 1 << 2;
    /// Never produces bytes.
    pub const NO_BYTES: u16 = 1 << 3;
    /// Emission records an entry in an offset-indexed side table.
    pub const SIDE_TABLE: u16 = 1 << 4;
    /// Relative branch with a 1-byte displacement form, eligible for the
    /// shortening pass.
    pub const SHORTENABLE: u16 = 1 << 5;
}

/// Descriptor record for one opcode.
///
/// Template byte meaning depends on the form. For `ModRm`:
/// `template[0]` is the reg<-r/m (load) opcode, `template[1]` the
/// r/m<-reg (store) opcode, `template[2]` the immediate form. For
/// branches: `template[0]` is the long (rel32) opcode base and
/// `template[1]` the short (rel8) base.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeDesc {
    pub op: Opcode,
    pub form: EncodingForm,
    pub template: [u8; 3],
    /// Two-byte escape prefix (0x0F) when the primary opcode needs it.
    pub lead_in: Option<u8>,
    /// ModRM /digit of the immediate or single-operand memory form.
    pub digit: u8,
    pub flags: u16,
}

impl OpcodeDesc {
    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

use flags::*;
use EncodingForm::*;

const fn desc_row(
    op: Opcode,
    form: EncodingForm,
    template: [u8; 3],
    lead_in: Option<u8>,
    digit: u8,
    flags: u16,
) -> OpcodeDesc {
    OpcodeDesc {
        op,
        form,
        template,
        lead_in,
        digit,
        flags,
    }
}

#[rustfmt::skip]
static TABLE: [OpcodeDesc; Opcode::COUNT] = [
    desc_row(Opcode::Label,        Empty,   [0x00, 0x00, 0x00], None,       0, NO_BYTES),
    desc_row(Opcode::Pragma,       Empty,   [0x00, 0x00, 0x00], None,       0, NO_BYTES | SIDE_TABLE),
    desc_row(Opcode::Nop,          Special, [0x90, 0x00, 0x00], None,       0, NONE),
    desc_row(Opcode::Mov,          ModRm,   [0x8B, 0x89, 0xC7], None,       0, HAS_IMM_FORM | SHRINK_IMM),
    desc_row(Opcode::Lea,          ModRm,   [0x8D, 0x00, 0x00], None,       0, NONE),
    desc_row(Opcode::Add,          ModRm,   [0x03, 0x01, 0x81], None,       0, HAS_IMM_FORM),
    desc_row(Opcode::Sub,          ModRm,   [0x2B, 0x29, 0x81], None,       5, HAS_IMM_FORM),
    desc_row(Opcode::IMul,         ModRm,   [0xAF, 0x00, 0x00], Some(0x0F), 0, NONE),
    desc_row(Opcode::And,          ModRm,   [0x23, 0x21, 0x81], None,       4, HAS_IMM_FORM),
    desc_row(Opcode::Or,           ModRm,   [0x0B, 0x09, 0x81], None,       1, HAS_IMM_FORM),
    desc_row(Opcode::Xor,          ModRm,   [0x33, 0x31, 0x81], None,       6, HAS_IMM_FORM),
    desc_row(Opcode::Cmp,          ModRm,   [0x3B, 0x39, 0x81], None,       7, HAS_IMM_FORM),
    desc_row(Opcode::Test,         ModRm,   [0x85, 0x85, 0xF7], None,       0, HAS_IMM_FORM),
    desc_row(Opcode::Push,         PlusReg, [0x50, 0xFF, 0x68], None,       6, DEFAULT_64 | HAS_IMM_FORM),
    desc_row(Opcode::Pop,          PlusReg, [0x58, 0x8F, 0x00], None,       0, DEFAULT_64),
    desc_row(Opcode::Call,         Special, [0xFF, 0x00, 0x00], None,       2, NONE),
    desc_row(Opcode::Ret,          Special, [0xC3, 0x00, 0x00], None,       0, NONE),
    desc_row(Opcode::Jmp,          Special, [0xE9, 0xEB, 0x00], None,       0, SHORTENABLE),
    desc_row(Opcode::Jcc,          Special, [0x80, 0x70, 0x00], Some(0x0F), 0, SHORTENABLE),
    desc_row(Opcode::MultiBranch,  Special, [0xFF, 0x00, 0x00], None,       4, NONE),
    desc_row(Opcode::InlineeStart, Special, [0xC7, 0x00, 0x00], None,       0, SIDE_TABLE),
    desc_row(Opcode::InlineeEnd,   Empty,   [0x00, 0x00, 0x00], None,       0, NO_BYTES | SIDE_TABLE),
];

/// Look up the descriptor for an opcode.
#[inline]
pub fn desc(op: Opcode) -> &'static OpcodeDesc {
    &TABLE[op.index()]
}
