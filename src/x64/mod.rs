//! x86-64 target: register ids, the opcode descriptor table, and the
//! bit-level instruction emitter.

pub mod emitter;
pub mod opcodes;
pub mod regs;

pub use emitter::Emitter;
pub use regs::Reg;
