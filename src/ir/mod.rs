//! Input contract of the back end: the lowered, machine-shaped
//! instruction list handed over by the optimizer.
//!
//! Everything here is produced upstream and consumed read-only by the
//! encoder. Instructions arrive with registers and addressing modes
//! already selected; the back end's job is purely to turn them into
//! bytes. A [`FunctionBody`] owns the list plus the label space, and
//! [`FunctionBody::validate`] is the legality predicate the encoder
//! asserts before touching its scratch buffer.

use crate::core::error::{JitError, JitResult};
use crate::x64::regs::Reg;

/// Index into a function's label space.
pub type LabelId = u32;

/// Conservative upper bound on the encoded size of any single
/// instruction, used to reserve the scratch buffer. The largest shapes we
/// emit are `mov r64, imm64` (10 bytes) and the expanded multi-way branch
/// sequence head (10 bytes), so 16 leaves headroom for prefixes.
pub const MAX_INSTR_SIZE: usize = 16;

/// Opcodes known to the descriptor table.
///
/// This covers byte-producing machine ops as well as the pseudo-ops that
/// occupy a list slot but emit nothing themselves (`Label`, `Pragma`) or
/// expand into a canned sequence (`MultiBranch`, inlinee markers). The
/// discriminant doubles as the index into the opcode descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Label = 0,
    Pragma,
    Nop,
    Mov,
    Lea,
    Add,
    Sub,
    IMul,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Push,
    Pop,
    Call,
    Ret,
    Jmp,
    Jcc,
    MultiBranch,
    InlineeStart,
    InlineeEnd,
}

impl Opcode {
    /// Number of opcodes; the descriptor table has exactly this many rows.
    pub const COUNT: usize = 22;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// x86 condition codes, in hardware encoding order (the value is the low
/// nibble of the Jcc opcode byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CondCode {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveEq = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEq = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterEq = 0xD,
    LessEq = 0xE,
    Greater = 0xF,
}

impl CondCode {
    #[inline]
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// A typed operand of a lowered instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// `[base + index*scale + offset]`; `scale` is 1, 2, 4 or 8.
    Indir {
        base: Reg,
        index: Option<Reg>,
        scale: u8,
        offset: i32,
    },
    /// Use of a label's final address as a value (e.g. jump-table base).
    Label(LabelId),
    /// Absolute address of a runtime structure or helper.
    MemRef(u64),
}

/// Why native code may need to fall back to the interpreter at a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutKind {
    Normal,
    TypeGuard,
    DebuggerStep,
}

/// Deoptimization record attached to an instruction. The payload that
/// reconstructs interpreter state lives upstream; the encoder only needs
/// the id and kind to key the bailout map by final byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BailoutInfo {
    pub bailout_id: u32,
    pub kind: BailoutKind,
}

/// Synthetic stack-frame metadata for a logically inlined call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineeCallInfo {
    pub inlinee_id: u32,
    pub frame_slots: u32,
}

/// An ordinary byte-producing machine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachOp {
    pub opcode: Opcode,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
}

/// One entry of the lowered instruction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Branch target. `aligned` marks a loop top that should land on a
    /// 16-byte boundary after layout settles.
    Label { id: LabelId, aligned: bool },
    /// Statement boundary: records its emitted offset in the throw map
    /// but produces no bytes.
    Pragma { statement: u32 },
    /// Ordinary machine op, optionally carrying deoptimization metadata.
    Op {
        op: MachOp,
        bailout: Option<BailoutInfo>,
        lazy_bailout: bool,
    },
    /// Conditional (`cond: Some`) or unconditional relative branch.
    Branch {
        cond: Option<CondCode>,
        target: LabelId,
    },
    /// Multi-target (switch) branch through a jump table deferred to the
    /// buffer tail. `index` holds the zero-based case number; `scratch`
    /// is a register the sequence may clobber.
    MultiBranch {
        index: Reg,
        scratch: Reg,
        targets: Vec<LabelId>,
    },
    /// Start of an inlined call region; emits an inlinee-call-info patch
    /// point resolved against the final base address.
    InlineeStart { info: InlineeCallInfo, dst: Reg },
    /// End of an inlined call region.
    InlineeEnd { info: InlineeCallInfo },
}

impl Instr {
    /// The descriptor-table opcode this entry encodes through.
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::Label { .. } => Opcode::Label,
            Instr::Pragma { .. } => Opcode::Pragma,
            Instr::Op { op, .. } => op.opcode,
            Instr::Branch { cond: Some(_), .. } => Opcode::Jcc,
            Instr::Branch { cond: None, .. } => Opcode::Jmp,
            Instr::MultiBranch { .. } => Opcode::MultiBranch,
            Instr::InlineeStart { .. } => Opcode::InlineeStart,
            Instr::InlineeEnd { .. } => Opcode::InlineeEnd,
        }
    }

    /// Worst-case emitted size of this entry, excluding jump-table slots
    /// (those are accounted separately as tail bytes).
    pub fn max_encoded_size(&self) -> usize {
        match self {
            Instr::Label { .. } | Instr::Pragma { .. } => 0,
            // mov scratch, imm64 (10) + jmp [scratch + index*8], which
            // takes 5 bytes when the scratch register forces a disp8.
            Instr::MultiBranch { .. } => 15,
            _ => MAX_INSTR_SIZE,
        }
    }
}

/// A finalized, lowered function: the instruction list plus its label
/// space and an optional extra legality hook installed by the lowerer.
pub struct FunctionBody {
    pub instrs: Vec<Instr>,
    pub label_count: u32,
    /// Extra per-instruction legality predicate from upstream; `None`
    /// means the structural checks in [`validate`](Self::validate) are
    /// the whole contract.
    pub legality_hook: Option<fn(&Instr) -> bool>,
}

impl FunctionBody {
    pub fn new(instrs: Vec<Instr>, label_count: u32) -> Self {
        Self {
            instrs,
            label_count,
            legality_hook: None,
        }
    }

    /// Total bytes of jump-table slots this function defers to the
    /// buffer tail (8 bytes per target).
    pub fn jump_table_bytes(&self) -> usize {
        self.instrs
            .iter()
            .map(|i| match i {
                Instr::MultiBranch { targets, .. } => targets.len() * 8,
                _ => 0,
            })
            .sum()
    }

    /// Post-lowering legality predicate. The encoder asserts this before
    /// reserving its scratch buffer; failures here are caller bugs, not
    /// integrity violations, so they surface as ordinary errors.
    pub fn validate(&self) -> JitResult<()> {
        let mut defined = vec![false; self.label_count as usize];

        let illegal = |reason: String| JitError::IllegalFunction { reason };

        for instr in &self.instrs {
            match instr {
                Instr::Label { id, .. } => {
                    let slot = defined
                        .get_mut(*id as usize)
                        .ok_or_else(|| illegal(format!("label {id} out of range")))?;
                    if *slot {
                        return Err(illegal(format!("label {id} defined twice")));
                    }
                    *slot = true;
                }
                Instr::Branch { target, .. } => {
                    if *target >= self.label_count {
                        return Err(illegal(format!("branch target {target} out of range")));
                    }
                }
                Instr::MultiBranch { targets, .. } => {
                    if targets.is_empty() {
                        return Err(illegal("multi-branch with no targets".into()));
                    }
                    for t in targets {
                        if *t >= self.label_count {
                            return Err(illegal(format!("switch target {t} out of range")));
                        }
                    }
                }
                Instr::Op { op, .. } => {
                    Self::validate_op(op)?;
                }
                Instr::Pragma { .. } | Instr::InlineeStart { .. } | Instr::InlineeEnd { .. } => {}
            }
            if let Some(hook) = self.legality_hook {
                if !hook(instr) {
                    return Err(illegal(format!(
                        "lowerer legality hook rejected {:?}",
                        instr.opcode()
                    )));
                }
            }
        }

        for (id, seen) in defined.iter().enumerate() {
            if !seen {
                return Err(illegal(format!("label {id} never defined")));
            }
        }
        Ok(())
    }

    fn validate_op(op: &MachOp) -> JitResult<()> {
        use Opcode::*;
        let invalid = |reason| JitError::InvalidOperands {
            opcode: op.opcode,
            reason,
        };
        match op.opcode {
            Nop | Ret => Ok(()),
            Push | Pop | Call => match (&op.dst, &op.src) {
                (Some(Operand::Reg(_)), None) => Ok(()),
                (Some(Operand::Indir { .. }), None) if op.opcode != Pop => Ok(()),
                (Some(Operand::MemRef(_)), None) if op.opcode == Call => Ok(()),
                _ => Err(invalid("expects a single register or memory operand")),
            },
            Mov | Lea | Add | Sub | IMul | And | Or | Xor | Cmp | Test => {
                match (&op.dst, &op.src) {
                    (Some(_), Some(_)) => {
                        if op.opcode == Lea && !matches!(op.src, Some(Operand::Indir { .. })) {
                            return Err(invalid("lea source must be a memory form"));
                        }
                        if matches!(op.dst, Some(Operand::Imm(_))) {
                            return Err(invalid("destination cannot be an immediate"));
                        }
                        Ok(())
                    }
                    _ => Err(invalid("expects two operands")),
                }
            }
            Label | Pragma | Jmp | Jcc | MultiBranch | InlineeStart | InlineeEnd => {
                Err(JitError::UnsupportedInstruction(op.opcode))
            }
        }
    }
}
