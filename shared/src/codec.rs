//! Newline-terminated codec for SCPI message exchange
//!
//! Every program message and every response is framed as:
//! ```text
//! [ N bytes: ASCII message ][ '\n' ]
//! ```
//!
//! A trailing `'\r'` before the terminator is tolerated and stripped, since
//! several instruments answer with CRLF.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Write termination character
pub const TERMINATOR: u8 = b'\n';

/// Maximum line size (16 MB) to prevent memory exhaustion on runaway streams
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Line too large: {0} bytes (max: {MAX_LINE_SIZE})")]
    LineTooLarge(usize),

    #[error("Message contains an embedded terminator")]
    EmbeddedTerminator,

    #[error("Response is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a program message into a terminated byte buffer
pub fn encode(message: &str) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(message.len() + 1);
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a program message directly into a provided buffer
pub fn encode_into(message: &str, buf: &mut BytesMut) -> Result<(), CodecError> {
    if message.len() > MAX_LINE_SIZE {
        return Err(CodecError::LineTooLarge(message.len()));
    }
    if message.as_bytes().contains(&TERMINATOR) {
        return Err(CodecError::EmbeddedTerminator);
    }

    buf.reserve(message.len() + 1);
    buf.put_slice(message.as_bytes());
    buf.put_u8(TERMINATOR);

    Ok(())
}

/// Try to decode one terminated line from a buffer
///
/// Returns:
/// - `Ok(Some(line))` if a complete line was decoded (terminator removed)
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
    let Some(pos) = buf.iter().position(|b| *b == TERMINATOR) else {
        if buf.len() > MAX_LINE_SIZE {
            return Err(CodecError::LineTooLarge(buf.len()));
        }
        return Ok(None);
    };

    let mut line = buf.split_to(pos);
    buf.advance(1);

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    String::from_utf8(line.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Decoder state for streaming decoding
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Partial line data being accumulated
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create a new line decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next line from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete lines
    pub fn decode_next(&mut self) -> Result<Option<String>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Drop any partial data, used after a timed-out exchange
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
