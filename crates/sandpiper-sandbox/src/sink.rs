//! Diagnostic sinks.
//!
//! Guest stderr and process lifecycle transitions are reported through an
//! explicit [`DiagnosticSink`] handle passed in at construction time, with a
//! lifecycle tied to the owning session.  [`TracingSink`] is the default
//! implementation.

use std::sync::Arc;

use crate::process::ProcessStatus;

/// Receives diagnostic output from a supervised process.
pub trait DiagnosticSink: Send + Sync {
    /// Raw stderr bytes from the guest, delivered in emission order.
    fn stderr_chunk(&self, chunk: &[u8]);

    /// A process lifecycle transition (running, exited, killed).
    fn status(&self, name: &str, status: ProcessStatus);
}

/// Forwards diagnostics to the `tracing` subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn stderr_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines().filter(|l| !l.is_empty()) {
            tracing::debug!(target: "guest", "{line}");
        }
    }

    fn status(&self, name: &str, status: ProcessStatus) {
        tracing::info!(process = name, ?status, "process status changed");
    }
}

/// Discards all diagnostics.  Useful in tests.
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn stderr_chunk(&self, _chunk: &[u8]) {}

    fn status(&self, _name: &str, _status: ProcessStatus) {}
}

/// Shared sink handle used across the supervisor and transport layers.
pub type SharedSink = Arc<dyn DiagnosticSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_sink_handles_invalid_utf8() {
        let sink = TracingSink;
        sink.stderr_chunk(&[0xFF, 0xFE, b'\n', b'o', b'k']);
    }

    #[test]
    fn null_sink_is_silent() {
        let sink = NullSink;
        sink.stderr_chunk(b"anything");
        sink.status("p", ProcessStatus::Exited(0));
    }
}
