//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.  The stdin
//! bridge has its own small [`PipeError`] because its `WouldBlock` variant is
//! control flow, not a failure, and must never be folded into generic error
//! handling.

/// WASI errno value carried by a would-block read.
///
/// This is the sandbox ABI's equivalent of POSIX `EAGAIN`; the guest runtime
/// recognizes it and retries the read on a later scheduling tick.
pub const ERRNO_AGAIN: u16 = 6;

/// Unified error type for the sandbox crate.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A mount or in-memory filesystem could not be set up.
    #[error("filesystem creation error: {0}")]
    Creation(String),

    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// The process could not be spawned (module invalid, mounts could not be
    /// attached, or resources were exhausted at start).
    #[error("spawn error: {0}")]
    Spawn(String),

    /// A Wasm trap was raised during execution.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// An I/O error occurred (e.g. reading a `.wasm` file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors returned by the stdin bridge.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipeError {
    /// No bytes are buffered right now; the caller must retry later.
    ///
    /// Transient and expected.  Carries the stable errno the guest-facing
    /// boundary reports, so the sandboxed runtime can distinguish it from a
    /// real failure.
    #[error("read would block (errno {code})")]
    WouldBlock {
        /// The errno value crossing the sandbox boundary.
        code: u16,
    },

    /// The stream reached end-of-input (or the other half was dropped).
    #[error("pipe is closed")]
    Closed,
}

impl PipeError {
    /// The canonical would-block error with the fixed [`ERRNO_AGAIN`] code.
    pub fn would_block() -> Self {
        Self::WouldBlock { code: ERRNO_AGAIN }
    }
}
