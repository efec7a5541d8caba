//! Encoding pipeline orchestration.
//!
//! [`Encoder::encode`] drives one function from lowered instruction list
//! to executable bytes: legality check, scratch-buffer reservation,
//! per-instruction emission with deferred relocations, jump tables at
//! the buffer tail, the optional shortening pass, heap placement inside
//! a writable window, relocation resolution against the real base, and
//! a final checksum validation over the published bytes.
//!
//! [`Encoder::encode_unplaced`] stops before the heap so tests and
//! ahead-of-time consumers can inspect the position-independent image.

pub mod buffer;
pub mod checksum;
pub mod maps;
pub mod reloc;
pub mod shorten;

use crate::core::error::{fatal_error, JitError, JitResult};
use crate::core::session::EncodeSession;
use crate::encoder::buffer::EncodeBuffer;
use crate::encoder::checksum::checksum;
use crate::encoder::maps::SideTables;
use crate::encoder::reloc::{LabelPcs, RelocEntry, RelocKind, RelocTable};
use crate::encoder::shorten::{shorten, ShortenOptions};
use crate::heap::{ExecutableHeap, HeapAllocation};
use crate::ir::{FunctionBody, Instr, LabelId, MAX_INSTR_SIZE};
use crate::x64::emitter::Emitter;

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub shorten_branches: bool,
    pub shorten: ShortenOptions,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            shorten_branches: true,
            shorten: ShortenOptions::default(),
        }
    }
}

/// Position-independent result of encoding one function: the code image
/// (main code followed by jump tables) plus everything needed to place
/// it at a real address.
#[derive(Debug)]
pub struct EncodeOutput {
    pub code: Vec<u8>,
    pub main_code_size: u32,
    pub relocs: RelocTable,
    pub labels: LabelPcs,
    pub tables: SideTables,
    pub checksum: u32,
    pub branches_shortened: u32,
    pub bytes_saved: u32,
    pub align_bytes: u32,
    pub shortening_rolled_back: bool,
}

/// Fixed-size unwind record written into the allocation's secondary
/// grant: version, flags, reserved, code size.
pub const UNWIND_RECORD_SIZE: usize = 8;

fn unwind_record(code_size: u32) -> [u8; UNWIND_RECORD_SIZE] {
    let mut rec = [0u8; UNWIND_RECORD_SIZE];
    rec[0] = 1;
    rec[4..8].copy_from_slice(&code_size.to_le_bytes());
    rec
}

/// A function placed in the executable heap, ready to run.
pub struct EncodedFunction {
    entry: usize,
    code_size: usize,
    allocation: HeapAllocation,
    pub tables: SideTables,
    pub checksum: u32,
}

impl EncodedFunction {
    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// The published execute-read bytes.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.entry as *const u8, self.code_size) }
    }

    pub fn allocation(&self) -> &HeapAllocation {
        &self.allocation
    }

    /// Give the allocation back to the caller, typically to hand it to
    /// [`ExecutableHeap::free`].
    pub fn into_allocation(self) -> HeapAllocation {
        self.allocation
    }

    /// Reinterpret the entry point as a function pointer.
    ///
    /// # Safety
    /// The encoded code must be valid for the signature `F`.
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        let ptr = self.entry as *const u8;
        unsafe { std::mem::transmute_copy(&ptr) }
    }
}

pub struct Encoder;

impl Encoder {
    /// Encode a function to a relocatable image without placing it.
    pub fn encode_unplaced(
        body: &FunctionBody,
        session: &EncodeSession<'_>,
        opts: &EncodeOptions,
    ) -> JitResult<EncodeOutput> {
        body.validate()?;

        let capacity = body.instrs.len() * MAX_INSTR_SIZE + body.jump_table_bytes();
        let mut buf = EncodeBuffer::new_in(session.arena(), capacity);
        let mut relocs = RelocTable::new();
        let mut labels = LabelPcs::new(body.label_count);
        let mut tables = SideTables::default();
        let mut table_jobs: Vec<(LabelId, &[LabelId])> = Vec::new();

        for instr in &body.instrs {
            let at = buf.offset();
            match instr {
                Instr::Label { id, aligned } => {
                    labels.define(*id, at);
                    if *aligned {
                        relocs.push(RelocEntry {
                            kind: RelocKind::AlignedLabel,
                            offset: at,
                            label: *id,
                            in_tail: false,
                        });
                    }
                }
                Instr::Pragma { statement } => {
                    tables.push_pragma(at, *statement);
                }
                Instr::Op {
                    op,
                    bailout,
                    lazy_bailout,
                } => {
                    Emitter::encode_op(op, &mut buf, &mut relocs)?;
                    if let Some(info) = bailout {
                        tables.push_bailout(buf.offset(), *info);
                    }
                    if *lazy_bailout {
                        tables.push_lazy_bailout(buf.offset());
                    }
                }
                Instr::Branch { cond, target } => {
                    Emitter::encode_branch(*cond, *target, &mut buf, &mut relocs);
                }
                Instr::MultiBranch {
                    index,
                    scratch,
                    targets,
                } => {
                    let table_label = labels.alloc_internal();
                    Emitter::encode_multi_branch(
                        *index,
                        *scratch,
                        table_label,
                        &mut buf,
                        &mut relocs,
                    )?;
                    table_jobs.push((table_label, targets));
                }
                Instr::InlineeStart { info, dst } => {
                    let patch_label = labels.alloc_internal();
                    labels.define(patch_label, at);
                    tables.push_inlinee(at, *info, true);
                    Emitter::encode_inlinee_start(*dst, patch_label, &mut buf, &mut relocs);
                }
                Instr::InlineeEnd { info } => {
                    tables.push_inlinee(buf.offset(), *info, false);
                }
            }
        }

        let main_code_size = buf.offset();

        // Jump tables live past the main code: one 8-byte absolute slot
        // per target, each a tail relocation.
        for (table_label, targets) in table_jobs {
            labels.define(table_label, buf.offset());
            for &target in targets {
                let offset = buf.emit_placeholder(8);
                relocs.push(RelocEntry {
                    kind: RelocKind::LabelUse,
                    offset,
                    label: target,
                    in_tail: true,
                });
            }
        }

        // Emission-phase validation: the incrementally folded CRC must
        // agree with a fresh pass over the buffer minus the placeholders.
        let emitted = checksum(buf.as_slice(), &relocs.payload_ranges());
        if emitted != buf.crc_value() {
            fatal_error("code checksum mismatch after emission");
        }
        log::debug!(
            "emitted {} bytes (+{} table bytes), {} relocations",
            main_code_size,
            buf.offset() - main_code_size,
            relocs.len()
        );

        let mut code = buf.as_slice().to_vec();
        let mut main_size = main_code_size;
        let mut branches_shortened = 0;
        let mut bytes_saved = 0;
        let mut align_bytes = 0;
        let mut rolled_back = false;
        if opts.shorten_branches {
            let outcome = shorten(
                &code,
                main_code_size,
                &mut relocs,
                &mut labels,
                &mut tables,
                &opts.shorten,
            );
            branches_shortened = outcome.branches_shortened;
            bytes_saved = outcome.bytes_saved;
            align_bytes = outcome.align_bytes;
            rolled_back = outcome.rolled_back;
            if let Some(new_code) = outcome.code {
                main_size = main_code_size - outcome.bytes_saved + outcome.align_bytes;
                code = new_code;
            }
        }

        let final_checksum = checksum(&code, &relocs.payload_ranges());
        Ok(EncodeOutput {
            code,
            main_code_size: main_size,
            relocs,
            labels,
            tables,
            checksum: final_checksum,
            branches_shortened,
            bytes_saved,
            align_bytes,
            shortening_rolled_back: rolled_back,
        })
    }

    /// Encode a function and place it in the executable heap.
    pub fn encode(
        body: &FunctionBody,
        heap: &ExecutableHeap,
        session: &EncodeSession<'_>,
        opts: &EncodeOptions,
    ) -> JitResult<EncodedFunction> {
        let out = Self::encode_unplaced(body, session, opts)?;
        if out.shortening_rolled_back {
            session.record_shortening_rollback();
        } else {
            session.record_shortening(out.branches_shortened, out.bytes_saved, out.align_bytes);
        }

        let total = out.code.len();
        if total == 0 {
            return Err(JitError::IllegalFunction {
                reason: "function encodes to zero bytes".into(),
            });
        }
        let mut allocation = heap.alloc(total, 1, UNWIND_RECORD_SIZE, true)?;
        let base = allocation.addr() as u64;
        let code_size = total as u32;

        heap.write(&allocation, |dst| {
            dst[..total].copy_from_slice(&out.code);
            out.relocs.apply(&mut dst[..total], base, code_size, &out.labels);
            // The relocated image may differ from the scratch image only
            // inside relocation payloads.
            if checksum(&dst[..total], &out.relocs.payload_ranges()) != out.checksum {
                fatal_error("code checksum mismatch after relocation");
            }
        });

        if let Some(grant) = allocation.secondary.as_mut() {
            let record = unwind_record(code_size);
            grant.as_mut_slice()[..UNWIND_RECORD_SIZE].copy_from_slice(&record);
        }

        session.record_function(total);
        log::debug!("placed {total} bytes at {base:#x}");
        Ok(EncodedFunction {
            entry: allocation.addr(),
            code_size: total,
            allocation,
            tables: out.tables,
            checksum: out.checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BailoutInfo, BailoutKind, MachOp, Opcode, Operand};
    use crate::x64::regs::{RAX, RCX, RDX};
    use bumpalo::Bump;

    fn op(opcode: Opcode, dst: Option<Operand>, src: Option<Operand>) -> Instr {
        Instr::Op {
            op: MachOp { opcode, dst, src },
            bailout: None,
            lazy_bailout: false,
        }
    }

    #[test]
    fn straight_line_code_encodes_in_order() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena);
        let body = FunctionBody::new(
            vec![
                op(
                    Opcode::Mov,
                    Some(Operand::Reg(RAX)),
                    Some(Operand::Imm(42)),
                ),
                op(Opcode::Ret, None, None),
            ],
            0,
        );
        let out = Encoder::encode_unplaced(&body, &session, &EncodeOptions::default()).unwrap();
        assert_eq!(
            out.code,
            vec![0x48, 0xC7, 0xC0, 42, 0, 0, 0, 0xC3]
        );
        assert_eq!(out.main_code_size, 8);
        assert!(out.relocs.is_empty());
    }

    #[test]
    fn side_tables_record_offsets() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena);
        let body = FunctionBody::new(
            vec![
                Instr::Pragma { statement: 3 },
                Instr::Op {
                    op: MachOp {
                        opcode: Opcode::Add,
                        dst: Some(Operand::Reg(RAX)),
                        src: Some(Operand::Reg(RCX)),
                    },
                    bailout: Some(BailoutInfo {
                        bailout_id: 9,
                        kind: BailoutKind::TypeGuard,
                    }),
                    lazy_bailout: true,
                },
                op(Opcode::Ret, None, None),
            ],
            0,
        );
        let out = Encoder::encode_unplaced(&body, &session, &EncodeOptions::default()).unwrap();
        assert_eq!(out.tables.throw_map[0].offset, 0);
        assert_eq!(out.tables.throw_map[0].statement, 3);
        // add rax, rcx is 3 bytes; both records key the following offset.
        assert_eq!(out.tables.bailouts[0].offset, 3);
        assert_eq!(out.tables.lazy_bailouts[0].offset, 3);
    }

    #[test]
    fn jump_table_lands_at_the_tail() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena);
        let body = FunctionBody::new(
            vec![
                Instr::Label {
                    id: 0,
                    aligned: false,
                },
                Instr::Label {
                    id: 1,
                    aligned: false,
                },
                Instr::MultiBranch {
                    index: RCX,
                    scratch: RDX,
                    targets: vec![0, 1, 0],
                },
                op(Opcode::Ret, None, None),
            ],
            2,
        );
        let out = Encoder::encode_unplaced(
            &body,
            &session,
            &EncodeOptions {
                shorten_branches: false,
                ..Default::default()
            },
        )
        .unwrap();
        // mov rdx, imm64 (10) + jmp [rdx+rcx*8] (3) + ret (1).
        assert_eq!(out.main_code_size, 14);
        assert_eq!(out.code.len(), 14 + 3 * 8);
        // Three tail slots plus the table-base use.
        let tail: Vec<_> = out.relocs.iter().filter(|e| e.in_tail).collect();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].offset, 14);
        // The internal table label resolves to the tail.
        assert_eq!(out.labels.pc(2), 14);
    }

    #[test]
    fn checksum_covers_the_final_image() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena);
        let body = FunctionBody::new(
            vec![
                Instr::Label {
                    id: 0,
                    aligned: false,
                },
                op(
                    Opcode::Add,
                    Some(Operand::Reg(RAX)),
                    Some(Operand::Imm(1)),
                ),
                Instr::Branch {
                    cond: None,
                    target: 0,
                },
                op(Opcode::Ret, None, None),
            ],
            1,
        );
        let out = Encoder::encode_unplaced(&body, &session, &EncodeOptions::default()).unwrap();
        assert_eq!(
            out.checksum,
            checksum(&out.code, &out.relocs.payload_ranges())
        );
    }

    #[test]
    fn undefined_label_is_rejected_before_emission() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena);
        let body = FunctionBody::new(
            vec![Instr::Branch {
                cond: None,
                target: 5,
            }],
            1,
        );
        let err =
            Encoder::encode_unplaced(&body, &session, &EncodeOptions::default()).unwrap_err();
        assert!(matches!(err, JitError::IllegalFunction { .. }));
    }
}
