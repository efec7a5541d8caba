//! emberjit - native code emission back end for a dynamic-language JIT.
//!
//! The crate takes a lowered, machine-shaped instruction list and turns
//! it into executable memory: per-instruction x86-64 encoding into a
//! scratch buffer, deferred relocation of branches and label uses, a
//! one-shot branch shortening pass with loop alignment and whole-pass
//! rollback, CRC validation at every phase boundary, and a bucketed W^X
//! executable heap with per-page free bitmaps.
//!
//! # Primary Usage
//!
//! ```ignore
//! use emberjit::core::EncodeSession;
//! use emberjit::encoder::{EncodeOptions, Encoder};
//! use emberjit::heap::{ExecutableHeap, HeapOptions};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = EncodeSession::new(&arena);
//! let heap = ExecutableHeap::new(HeapOptions::default());
//!
//! let func = Encoder::encode(&body, &heap, &session, &EncodeOptions::default())?;
//! let entry: unsafe extern "C" fn() -> i64 = unsafe { func.as_fn() };
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - the lowered instruction list handed over by the optimizer
//! - [`x64`] - register ids, opcode descriptors, bit-level emission
//! - [`encoder`] - pipeline orchestration, relocation, shortening, checksums
//! - [`heap`] - bucketed executable memory with W^X protection
//! - [`core`] - session, statistics, error policy

pub mod core;
pub mod encoder;
pub mod heap;
pub mod ir;
pub mod x64;

pub use crate::core::{EncodeSession, EncodeStats, JitError, JitResult};
pub use crate::encoder::{EncodeOptions, EncodedFunction, Encoder};
pub use crate::heap::{ExecutableHeap, HeapAllocation, HeapOptions};
pub use crate::ir::{FunctionBody, Instr, MachOp, Opcode, Operand};
