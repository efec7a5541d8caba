//! Error types for the emberjit back end.
//!
//! Two failure regimes exist, and they must never be mixed up. Resource
//! exhaustion (the OS refusing a page, a secondary grant not fitting) is an
//! ordinary checked result that the caller handles, typically by falling
//! back to a slower execution tier. Integrity violations (checksum
//! mismatch, heap bitmap corruption, a relocation resolving outside the
//! code region) mean generated code can no longer be trusted; those paths
//! call [`fatal_error`] and abort without unwinding back into the compiler.

use thiserror::Error;

use crate::ir::Opcode;

/// Main error type for the encoding pipeline and the executable heap.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("instruction list failed legality check: {reason}")]
    IllegalFunction { reason: String },

    #[error("unsupported operand combination for {opcode:?}: {reason}")]
    InvalidOperands {
        opcode: Opcode,
        reason: &'static str,
    },

    #[error("no encoding form for {0:?} in this position")]
    UnsupportedInstruction(Opcode),

    #[error("executable heap could not satisfy {requested} bytes")]
    OutOfExecutableMemory { requested: usize },

    #[error("unwind data allocation of {requested} bytes failed")]
    UnwindAllocation { requested: usize },
}

/// Result type alias for encode operations.
pub type JitResult<T> = Result<T, JitError>;

/// Report an integrity violation and terminate the process.
///
/// Continuing after undetected corruption of generated code is unsafe, so
/// this never returns and never unwinds: the abort happens before any
/// destructor in the compile pipeline can observe the broken state.
pub fn fatal_error(msg: &str) -> ! {
    log::error!("fatal jit integrity violation: {msg}");
    std::process::abort()
}
