//! Non-blocking stdin bridge.
//!
//! The guest runtime's read primitive is a synchronous call that must either
//! return buffered bytes immediately or fail with a would-block signal -- it
//! must never suspend the calling thread, because that thread is
//! cooperatively scheduled inside the sandbox.  [`StdinBridge`] reconciles
//! that contract with a host that feeds stdin asynchronously: host-side
//! writes append to a FIFO buffer at arbitrary times, guest-side reads drain
//! it or fail with [`PipeError::WouldBlock`] and retry on a later tick.
//!
//! The bridge is a dedicated wrapper type around the buffer; it exposes only
//! the translated read/write contract rather than patching behavior onto a
//! foreign pipe object.  Single writer, single reader.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use wasmtime_wasi::{HostInputStream, StdinStream, StreamError, StreamResult, Subscribe};

use crate::error::PipeError;

/// Ordered byte queue plus end-of-stream flag.
///
/// The fill level is the number of unread bytes; it never goes negative and
/// every write/read is applied atomically under the bridge lock, so a read
/// cannot observe a partially-applied write.
#[derive(Debug, Default)]
struct PipeBuffer {
    queue: VecDeque<u8>,
    closed: bool,
}

struct PipeShared {
    buffer: Mutex<PipeBuffer>,
    readable: Notify,
}

impl PipeShared {
    fn read(&self, max: Option<usize>) -> std::result::Result<Bytes, PipeError> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.queue.is_empty() {
            if buffer.closed {
                return Err(PipeError::Closed);
            }
            // Never an empty success and never a suspended caller: the guest
            // retries on a later scheduling tick.
            return Err(PipeError::would_block());
        }
        let n = max
            .unwrap_or(buffer.queue.len())
            .min(buffer.queue.len());
        let drained: Vec<u8> = buffer.queue.drain(..n).collect();
        Ok(Bytes::from(drained))
    }

    fn has_data_or_eof(&self) -> bool {
        let buffer = self.buffer.lock().unwrap();
        !buffer.queue.is_empty() || buffer.closed
    }
}

/// Guest-facing half of the bridge.
///
/// Attached to a process via
/// [`ProcessConfig::with_stdin`](crate::process::ProcessConfig::with_stdin);
/// also usable directly for tests and diagnostics.
pub struct StdinBridge {
    shared: Arc<PipeShared>,
}

/// Host-facing half of the bridge.
///
/// Writes append in submission order.  A zero-length write marks
/// end-of-stream exactly once; the caller must sequence it after the
/// consuming process has been spawned, or the guest never observes it.
pub struct StdinWriter {
    shared: Arc<PipeShared>,
}

impl StdinBridge {
    /// Create a connected bridge/writer pair.
    pub fn new() -> (Self, StdinWriter) {
        let shared = Arc::new(PipeShared {
            buffer: Mutex::new(PipeBuffer::default()),
            readable: Notify::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            StdinWriter { shared },
        )
    }

    /// Drain up to `max` buffered bytes in FIFO order (everything buffered
    /// when `max` is `None`).
    ///
    /// Fails with [`PipeError::WouldBlock`] when the fill level is zero and
    /// the stream is still open, and with [`PipeError::Closed`] once
    /// end-of-stream has been reached and fully drained.
    pub fn read(&self, max: Option<usize>) -> std::result::Result<Bytes, PipeError> {
        self.shared.read(max)
    }

    /// Number of unread bytes currently buffered.
    pub fn fill_level(&self) -> usize {
        self.shared.buffer.lock().unwrap().queue.len()
    }
}

impl StdinWriter {
    /// Append bytes to the buffer and wake any waiting reader.
    ///
    /// A zero-length `bytes` marks end-of-stream; a second zero-length write
    /// is a no-op.  Non-empty writes after end-of-stream fail with
    /// [`PipeError::Closed`].
    pub fn write(&self, bytes: &[u8]) -> std::result::Result<(), PipeError> {
        {
            let mut buffer = self.shared.buffer.lock().unwrap();
            if bytes.is_empty() {
                buffer.closed = true;
            } else {
                if buffer.closed {
                    return Err(PipeError::Closed);
                }
                buffer.queue.extend(bytes);
            }
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Mark end-of-stream.  Equivalent to a zero-length [`write`](Self::write).
    pub fn close(&self) {
        // write(&[]) only fails on a non-empty write after close.
        let _ = self.write(&[]);
    }

    /// Whether end-of-stream has been marked.
    pub fn is_closed(&self) -> bool {
        self.shared.buffer.lock().unwrap().closed
    }
}

/// The WASI stream handed to the guest's stdin descriptor.
struct GuestStdin {
    shared: Arc<PipeShared>,
}

#[async_trait]
impl Subscribe for GuestStdin {
    async fn ready(&mut self) {
        loop {
            let notified = self.shared.readable.notified();
            if self.shared.has_data_or_eof() {
                return;
            }
            notified.await;
        }
    }
}

impl HostInputStream for GuestStdin {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        match self.shared.read(Some(size)) {
            Ok(bytes) => Ok(bytes),
            // The stream-level representation of would-block: no bytes ready,
            // the shim retries after `ready` resolves.  The errno translation
            // happens at the guest ABI boundary, not here.
            Err(PipeError::WouldBlock { .. }) => Ok(Bytes::new()),
            Err(PipeError::Closed) => Err(StreamError::Closed),
        }
    }
}

impl StdinStream for StdinBridge {
    fn stream(&self) -> Box<dyn HostInputStream> {
        Box::new(GuestStdin {
            shared: Arc::clone(&self.shared),
        })
    }

    fn isatty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERRNO_AGAIN;

    #[test]
    fn read_on_empty_open_pipe_would_block() {
        let (bridge, _writer) = StdinBridge::new();
        assert_eq!(bridge.fill_level(), 0);
        let err = bridge.read(None).expect_err("empty read must not succeed");
        assert_eq!(err, PipeError::WouldBlock { code: ERRNO_AGAIN });
    }

    #[test]
    fn reads_observe_writes_in_fifo_order() {
        let (bridge, writer) = StdinBridge::new();
        writer.write(b"alpha ").expect("write must succeed");
        writer.write(b"beta ").expect("write must succeed");
        writer.write(b"gamma").expect("write must succeed");
        assert_eq!(bridge.fill_level(), 16);

        let mut observed = Vec::new();
        loop {
            match bridge.read(Some(4)) {
                Ok(chunk) => observed.extend_from_slice(&chunk),
                Err(PipeError::WouldBlock { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(observed, b"alpha beta gamma");
        assert_eq!(bridge.fill_level(), 0);
    }

    #[test]
    fn bounded_read_leaves_remainder() {
        let (bridge, writer) = StdinBridge::new();
        writer.write(b"0123456789").expect("write must succeed");

        let first = bridge.read(Some(4)).expect("read must succeed");
        assert_eq!(&first[..], b"0123");
        assert_eq!(bridge.fill_level(), 6);

        let rest = bridge.read(None).expect("read must succeed");
        assert_eq!(&rest[..], b"456789");
    }

    #[test]
    fn zero_length_write_marks_eof_once() {
        let (bridge, writer) = StdinBridge::new();
        writer.write(b"tail").expect("write must succeed");
        writer.write(&[]).expect("eof write must succeed");
        assert!(writer.is_closed());

        // Second zero-length write is a no-op.
        writer.write(&[]).expect("second eof write is a no-op");
        assert!(writer.is_closed());

        // Remaining bytes still drain, then the pipe reports closed.
        let rest = bridge.read(None).expect("drain must succeed");
        assert_eq!(&rest[..], b"tail");
        assert_eq!(bridge.read(None), Err(PipeError::Closed));
    }

    #[test]
    fn write_after_eof_fails() {
        let (_bridge, writer) = StdinBridge::new();
        writer.close();
        assert_eq!(writer.write(b"late"), Err(PipeError::Closed));
    }

    #[test]
    fn guest_stream_maps_would_block_to_empty_read() {
        let (bridge, writer) = StdinBridge::new();
        let mut stream = bridge.stream();

        let empty = stream.read(16).expect("open stream read must succeed");
        assert!(empty.is_empty());

        writer.write(b"data").expect("write must succeed");
        let chunk = stream.read(16).expect("read must succeed");
        assert_eq!(&chunk[..], b"data");

        writer.close();
        assert!(matches!(stream.read(16), Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn ready_resolves_when_data_arrives() {
        let (bridge, writer) = StdinBridge::new();
        let mut stream = bridge.stream();

        let waiter = tokio::spawn(async move {
            stream.ready().await;
            stream.read(64)
        });

        // Give the waiter a chance to park before feeding it.
        tokio::task::yield_now().await;
        writer.write(b"wake up").expect("write must succeed");

        let chunk = waiter
            .await
            .expect("waiter must not panic")
            .expect("read must succeed");
        assert_eq!(&chunk[..], b"wake up");
    }

    #[tokio::test]
    async fn ready_resolves_on_eof() {
        let (bridge, writer) = StdinBridge::new();
        let mut stream = bridge.stream();

        let waiter = tokio::spawn(async move {
            stream.ready().await;
        });

        tokio::task::yield_now().await;
        writer.close();
        waiter.await.expect("waiter must not panic");
    }
}
