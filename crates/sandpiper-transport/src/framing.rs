//! Frame codec for the stdio transport.
//!
//! Messages are framed with a header block:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! Encoding is a single allocation; decoding is incremental because the
//! server's stdout arrives as arbitrary byte chunks, not whole frames.

use crate::error::{Result, TransportError};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length:";

/// Encode one payload as a framed message.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental decoder assembling frames from a chunked byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes into the decoder.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to take the next complete frame payload.
    ///
    /// Returns `Ok(None)` when more bytes are needed.  A header block
    /// without a valid `Content-Length` is a [`TransportError::Stream`];
    /// there is no way to resynchronize after one.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(header_end) = find_subslice(&self.buffer, HEADER_TERMINATOR) else {
            return Ok(None);
        };

        let header_text = std::str::from_utf8(&self.buffer[..header_end])
            .map_err(|_| TransportError::Stream("header block is not valid utf-8".into()))?;

        let mut content_length: Option<usize> = None;
        for line in header_text.split("\r\n") {
            let lower = line.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix(CONTENT_LENGTH) {
                content_length = Some(value.trim().parse().map_err(|_| {
                    TransportError::Stream(format!("invalid Content-Length header: {line}"))
                })?);
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        let content_length = content_length
            .ok_or_else(|| TransportError::Stream("missing Content-Length header".into()))?;

        let body_start = header_end + HEADER_TERMINATOR.len();
        if self.buffer.len() < body_start + content_length {
            return Ok(None);
        }

        let payload = self.buffer[body_start..body_start + content_length].to_vec();
        self.buffer.drain(..body_start + content_length);
        Ok(Some(payload))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
