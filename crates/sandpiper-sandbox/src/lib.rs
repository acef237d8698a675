//! Sandpiper WASI sandbox.
//!
//! This crate hosts language-server binaries compiled to sandboxed wasm
//! modules: it loads them, builds their virtual filesystem view, bridges
//! their stdin to an asynchronous host without ever blocking the guest's
//! cooperative scheduler, and supervises the process lifecycle.
//!
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode;
//!   [`PipeError`] carries the transient would-block signal.
//! - **[`loader`]** -- [`ModuleLoader`] compiles and registers modules on the
//!   shared engine.
//! - **[`mounts`]** -- [`MountTable`], [`MountPoint`], and [`MemoryFs`] give
//!   the guest a workspace pass-through plus private in-memory directories.
//! - **[`pipe`]** -- [`StdinBridge`] adapts asynchronous host writes to the
//!   guest's blocking-read contract via would-block signalling.
//! - **[`process`]** -- [`Supervisor`] spawns processes in run-to-completion
//!   or run-as-server mode and hands out [`ProcessHandle`]s.
//! - **[`sink`]** -- explicit [`DiagnosticSink`] handles for guest stderr
//!   and lifecycle events.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod loader;
pub mod mounts;
pub mod pipe;
pub mod process;
pub mod sink;

// Re-export the most commonly used types at the crate root.
pub use error::{PipeError, Result, SandboxError, ERRNO_AGAIN};
pub use loader::ModuleLoader;
pub use mounts::{MemoryFs, MountPoint, MountTable, GUEST_HOME, GUEST_TMP, GUEST_WORKSPACE};
pub use pipe::{StdinBridge, StdinWriter};
pub use process::{
    CompletedProcess, MemoryLimits, ProcessConfig, ProcessHandle, ProcessStatus, Supervisor,
};
pub use sink::{DiagnosticSink, NullSink, SharedSink, TracingSink};
