//! Frame codec for the control-process channel.
//!
//! Wire format:
//! ```text
//! [UTF-8 JSON object][0x03]
//! ```
//! Every message is a single JSON object followed by one ETX (0x03) byte.  A
//! newline (`\n`) is also accepted as a terminator on input so that line-based
//! test fixtures and debugging tools can talk to the broker directly.  Output
//! always uses ETX.
//!
//! # Streaming (for beginners)
//!
//! A local socket is a *stream*: one `read()` can return half a message, or
//! three messages glued together.  [`decode_frame`] therefore works on a byte
//! slice and reports how many bytes it consumed, returning
//! [`ProtocolError::InsufficientData`] when no terminator has arrived yet.
//! [`FrameDecoder`] wraps that in an owned buffer so callers can simply
//! `extend()` with whatever the socket produced and pull frames until `None`.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

/// Frame terminator written after every outbound message.
pub const FRAME_TERMINATOR: u8 = 0x03;

/// Alternative terminator accepted on input.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Default upper bound for a buffered, not-yet-terminated frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded frame: always a JSON object.
pub type Frame = Map<String, Value>;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// No terminator found yet; more bytes are needed.
    #[error("insufficient data: {available} byte(s) buffered without a terminator")]
    InsufficientData { available: usize },

    /// The frame between two terminators was empty or whitespace only.
    #[error("empty frame")]
    EmptyFrame { consumed: usize },

    /// The frame was not valid UTF-8 JSON, or not a JSON object.
    #[error("malformed frame: {reason}")]
    MalformedFrame { consumed: usize, reason: String },

    /// A frame grew past the configured limit without a terminator.
    #[error("frame exceeds {limit} bytes without a terminator")]
    FrameTooLarge { limit: usize },

    /// The value to encode could not be serialized.
    #[error("failed to serialize frame: {0}")]
    Serialize(String),
}

impl ProtocolError {
    /// Number of bytes the caller must discard to skip past the offending
    /// frame, if the error is frame-local.
    pub fn consumed(&self) -> Option<usize> {
        match self {
            ProtocolError::EmptyFrame { consumed }
            | ProtocolError::MalformedFrame { consumed, .. } => Some(*consumed),
            _ => None,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a JSON value as one terminated frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if `serde_json` rejects the value.
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::codec::{decode_frame, encode_frame};
/// use serde_json::json;
///
/// let bytes = encode_frame(&json!({"id": 1, "method": "info"})).unwrap();
/// assert_eq!(*bytes.last().unwrap(), 0x03);
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame["method"], "info");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf =
        serde_json::to_vec(value).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    buf.push(FRAME_TERMINATOR);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the decoded object and the number of bytes consumed including the
/// terminator.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] if no terminator is present.
/// - [`ProtocolError::EmptyFrame`] / [`ProtocolError::MalformedFrame`] for a
///   bad frame; both carry the byte count to skip.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let end = find_terminator(bytes).ok_or(ProtocolError::InsufficientData {
        available: bytes.len(),
    })?;
    let consumed = end + 1;
    let raw = &bytes[..end];

    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::EmptyFrame { consumed });
    }

    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok((map, consumed)),
        Ok(other) => Err(ProtocolError::MalformedFrame {
            consumed,
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(ProtocolError::MalformedFrame {
            consumed,
            reason: e.to_string(),
        }),
    }
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Accumulates raw bytes and yields complete frames.
///
/// Empty frames are skipped silently.  A malformed frame is removed from the
/// buffer and reported once; the next call continues with the following
/// frame, so a single bad message never wedges the channel.
///
/// Bytes already searched for a terminator are not searched again, so a
/// large frame arriving in many small reads is scanned once.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` known to hold no terminator.
    scanned: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder with [`DEFAULT_MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder that rejects frames larger than `max_frame_size`.
    pub fn with_limit(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            scanned: 0,
            max_frame_size,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedFrame`] for a frame that was skipped,
    /// or [`ProtocolError::FrameTooLarge`] after discarding an oversized
    /// partial frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(offset) = find_terminator(&self.buf[self.scanned..]) else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_size {
                    self.buf.clear();
                    self.scanned = 0;
                    return Err(ProtocolError::FrameTooLarge {
                        limit: self.max_frame_size,
                    });
                }
                return Ok(None);
            };
            let frame_len = self.scanned + offset + 1;
            let result = decode_frame(&self.buf[..frame_len]);
            self.buf.drain(..frame_len);
            self.scanned = 0;
            match result {
                Ok((frame, _)) => return Ok(Some(frame)),
                Err(ProtocolError::EmptyFrame { consumed }) => {
                    trace!("skipping empty frame ({consumed} bytes)");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .iter()
        .position(|b| *b == FRAME_TERMINATOR || *b == LINE_TERMINATOR)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
