//! Sandpiper stdio-to-RPC transport.
//!
//! Turns a sandboxed server process's stdio streams into a duplex JSON-RPC
//! channel and exposes the hosted server's line-oriented textual command
//! protocol as correlated request/reply pairs.
//!
//! - **[`error`]** -- [`TransportError`] enumerates every failure mode.
//! - **[`framing`]** -- Content-Length frame codec over chunked byte
//!   streams.
//! - **[`jsonrpc`]** -- the JSON-RPC 2.0 message model.
//! - **[`client`]** -- [`RpcClient`] with id-correlated pending requests.
//! - **[`transport`]** -- [`ServerConnection`] owning the process for the
//!   session, plus [`PathConverters`] for host/guest URI translation.
//! - **[`command`]** -- the textual [`Command`] encoder and the
//!   FIFO-correlated [`CommandChannel`].
//! - **[`launcher`]** -- [`ServerLauncher`]/[`HostProfile`] assembling
//!   mounts, bridge, process, and session.

pub mod client;
pub mod command;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod launcher;
pub mod transport;

// Re-export the most commonly used types at the crate root.
pub use client::RpcClient;
pub use command::{Command, CommandChannel, COMMAND_METHOD, COMMAND_TAG};
pub use error::{Result, TransportError};
pub use framing::{encode_frame, FrameDecoder};
pub use jsonrpc::{Incoming, Notification, Request, Response};
pub use launcher::{
    HostProfile, ServerLauncher, ServerSession, DATA_DIR_ENV, GUEST_DATA_DIR, HOME_ENV,
    SERVER_PROCESS_NAME,
};
pub use transport::{PathConverters, ServerConnection};
