//! Shared infrastructure: error types, fatal-error policy, and the
//! per-thread encoding session.

pub mod error;
pub mod session;

pub use error::{fatal_error, JitError, JitResult};
pub use session::{EncodeSession, EncodeStats};
