//! Transport error types.

use sandpiper_sandbox::{PipeError, SandboxError};

/// Unified error type for the transport crate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A malformed frame arrived on the RPC transport.  The textual protocol
    /// has no resynchronization marker, so the session must close.
    #[error("malformed frame on rpc transport: {0}")]
    Stream(String),

    /// The server answered a request with an error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message from the server.
        message: String,
    },

    /// The channel closed before a reply arrived; every pending request
    /// resolves with this.
    #[error("rpc channel closed before a reply arrived")]
    ChannelClosed,

    /// A URI could not be translated between host and guest path spaces.
    #[error("uri translation failed: {0}")]
    Uri(String),

    /// Failure in the underlying sandbox layer.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Failure writing to the server's stdin bridge.
    #[error("stdin pipe error: {0}")]
    Pipe(#[from] PipeError),

    /// A frame payload was not valid JSON.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
