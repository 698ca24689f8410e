//! The frame envelope and its stream codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! 9A 00 00 00 03      array(3) head, non-canonical 4-byte length (magic)
//! <headers>           null when empty, else map<u32 -> header value>
//! 1A XX XX XX XX      uint32, always the 4-byte form = message type id
//! <payload>           byte string holding the encoded message
//! ```
//!
//! The magic is deliberately non-canonical so receivers can use it as a
//! sync marker; every encoder MUST produce it. The decoder additionally
//! accepts the canonical `83` head (with a warning) and parses damaged
//! `9A` lengths best-effort.
//!
//! Decoding is defensive: a per-frame byte cap (1 MiB by default) bounds
//! every read and skip, so a corrupted length field cannot trigger a huge
//! allocation, and arbitrary input yields a [`ParseResult`], never a
//! panic.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cbor::{Reader, Token, Writer};
use crate::diag::{Diagnostic, DiagnosticContext, ParseResult};
use crate::errors::ProtocolError;

/// The frame sync magic: non-canonical array(3) head.
pub const FRAME_MAGIC: [u8; 5] = [0x9A, 0x00, 0x00, 0x00, 0x03];

/// Default per-frame byte cap.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A header value. Headers are a small open-ended key/value channel next
/// to the typed payload (trace ids, routing hints).
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// UTF-8 text
    Text(String),
    /// Signed integer
    Int(i64),
    /// Boolean
    Bool(bool),
    /// Opaque bytes
    Bytes(Bytes),
    /// Floating point
    Float(f64),
}

/// One wire frame: headers, message type id, and the encoded payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Frame headers; empty encodes as CBOR null
    pub headers: BTreeMap<u32, HeaderValue>,
    /// 32-bit message type id
    pub message_type_id: u32,
    /// Encoded message payload
    pub payload: Bytes,
}

impl Frame {
    /// Frame with no headers.
    #[must_use]
    pub fn new(message_type_id: u32, payload: impl Into<Bytes>) -> Self {
        Self { headers: BTreeMap::new(), message_type_id, payload: payload.into() }
    }

    /// Builder-style header attachment.
    #[must_use]
    pub fn with_header(mut self, key: u32, value: HeaderValue) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Encode this frame. Deterministic: the same frame always produces
    /// the same bytes (headers are emitted in ascending key order).
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut w = Writer::with_capacity(self.payload.len() + 32);
        w.frame_magic();
        if self.headers.is_empty() {
            w.null();
        } else {
            w.map(self.headers.len() as u64);
            for (key, value) in &self.headers {
                w.uint(u64::from(*key));
                match value {
                    HeaderValue::Text(s) => w.text(s),
                    HeaderValue::Int(i) => w.int(*i),
                    HeaderValue::Bool(b) => w.bool(*b),
                    HeaderValue::Bytes(b) => w.bytes(b),
                    HeaderValue::Float(f) => w.f64(*f),
                }
            }
        }
        w.u32_fixed(self.message_type_id);
        w.bytes(&self.payload);
        dst.put_slice(w.as_slice());
    }

    /// Encode to a fresh buffer.
    #[must_use]
    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Decode one frame from a complete input with the default byte cap.
///
/// Returns `None` on clean EOF (empty input). Truncated input fails with
/// a `READ_ERROR` diagnostic rather than waiting for more bytes; use
/// [`FrameCodec`] for incremental stream decoding.
#[must_use]
pub fn decode_frame(input: &[u8]) -> Option<ParseResult<Frame>> {
    decode_frame_with_cap(input, DEFAULT_MAX_FRAME_BYTES)
}

/// [`decode_frame`] with an explicit byte cap.
#[must_use]
pub fn decode_frame_with_cap(input: &[u8], max_bytes: usize) -> Option<ParseResult<Frame>> {
    if input.is_empty() {
        return None;
    }
    match parse_step(input, max_bytes) {
        Step::Done(result, _) => Some(result),
        Step::Incomplete => Some(ParseResult::failure(vec![Diagnostic::error(
            "READ_ERROR",
            "input ends in the middle of a frame",
        )])),
    }
}

/// Outcome of one incremental parse attempt.
enum Step<T> {
    /// A complete item and the number of input bytes it consumed
    Done(T, usize),
    /// More input is needed
    Incomplete,
}

/// Error channel inside the frame parser. `Incomplete` escapes to the
/// stream layer; everything else becomes a failure diagnostic.
enum FrameError {
    Incomplete,
    Abort(Diagnostic),
}

impl From<ProtocolError> for FrameError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Incomplete => Self::Incomplete,
            ProtocolError::CapExceeded { offset } => Self::Abort(
                Diagnostic::error("READ_ERROR", "frame exceeds the per-frame byte cap").at(offset),
            ),
            other => {
                let offset = other.offset();
                let mut diag = Diagnostic::error("INVALID_FRAME", other.to_string());
                diag.byte_offset = offset;
                Self::Abort(diag)
            },
        }
    }
}

fn parse_step(input: &[u8], max_bytes: usize) -> Step<ParseResult<Frame>> {
    let (outcome, diagnostics) = DiagnosticContext::capture(|| {
        let mut r = Reader::new(input, max_bytes);
        parse_frame(&mut r).map(|frame| (frame, r.position()))
    });
    match outcome {
        Ok((frame, consumed)) => Step::Done(ParseResult::success(frame, diagnostics), consumed),
        Err(FrameError::Incomplete) => Step::Incomplete,
        Err(FrameError::Abort(diag)) => {
            let mut diagnostics = diagnostics;
            diagnostics.push(diag);
            // framing is lost; the stream layer drains the buffer
            Step::Done(ParseResult::failure(diagnostics), input.len())
        },
    }
}

fn parse_frame(r: &mut Reader<'_>) -> Result<Frame, FrameError> {
    let first = r.take(1).map_err(FrameError::from)?[0];
    let element_count: u64 = match first {
        0x9A => {
            let raw = r.take(4).map_err(FrameError::from)?;
            let count = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if count != 3 {
                DiagnosticContext::warning_at(
                    "INVALID_ARRAY_LENGTH",
                    format!("frame array length is {count}, expected 3"),
                    1,
                );
            }
            u64::from(count)
        },
        0x83 => {
            DiagnosticContext::warning_at(
                "CANONICAL_ARRAY_HEADER",
                "frame uses the canonical array(3) head instead of the sync magic",
                0,
            );
            3
        },
        other => {
            return Err(FrameError::Abort(
                Diagnostic::error("INVALID_MAGIC", format!("invalid frame start byte {other:#04x}"))
                    .at(0),
            ));
        },
    };

    if element_count < 3 {
        return Err(FrameError::Abort(
            Diagnostic::error("INVALID_FRAME", "frame array holds fewer than 3 elements").at(0),
        ));
    }

    let headers = parse_headers(r)?;

    let type_offset = r.position();
    let message_type_id = match r.read_token().map_err(FrameError::from)? {
        Token::Uint(id) if id <= u64::from(u32::MAX) => id as u32,
        _ => {
            return Err(FrameError::Abort(
                Diagnostic::error("INVALID_FRAME", "message type id must be an unsigned integer")
                    .at(type_offset),
            ));
        },
    };

    let payload_offset = r.position();
    let payload = match r.read_token().map_err(FrameError::from)? {
        Token::Bytes(len) => Bytes::copy_from_slice(r.take_len(len).map_err(FrameError::from)?),
        _ => {
            return Err(FrameError::Abort(
                Diagnostic::error("INVALID_FRAME", "frame payload must be a byte string")
                    .at(payload_offset),
            ));
        },
    };

    // best-effort tolerance for a damaged length: skip the extras so the
    // stream stays aligned
    for _ in 3..element_count {
        r.skip_value().map_err(FrameError::from)?;
    }

    Ok(Frame { headers, message_type_id, payload })
}

fn parse_headers(r: &mut Reader<'_>) -> Result<BTreeMap<u32, HeaderValue>, FrameError> {
    let offset = r.position();
    let mut probe = r.clone();
    let entries = match probe.read_token().map_err(FrameError::from)? {
        Token::Null => {
            *r = probe;
            return Ok(BTreeMap::new());
        },
        Token::Map(n) => {
            *r = probe;
            n
        },
        _ => {
            DiagnosticContext::warning_at(
                "INVALID_FRAME",
                "headers element is neither a map nor null; treating as empty",
                offset,
            );
            r.skip_value().map_err(FrameError::from)?;
            return Ok(BTreeMap::new());
        },
    };

    let mut headers = BTreeMap::new();
    for _ in 0..entries {
        let key_offset = r.position();
        let mut key_probe = r.clone();
        let key = match key_probe.read_token().map_err(FrameError::from)? {
            Token::Uint(k) if k <= u64::from(u32::MAX) => {
                *r = key_probe;
                Some(k as u32)
            },
            _ => {
                DiagnosticContext::warning_at(
                    "UNSUPPORTED_HEADER",
                    "header key is not an unsigned integer; entry skipped",
                    key_offset,
                );
                r.skip_value().map_err(FrameError::from)?;
                None
            },
        };

        let value_offset = r.position();
        let mut value_probe = r.clone();
        let value = match value_probe.read_token().map_err(FrameError::from)? {
            Token::Text(len) => {
                let raw = value_probe.take_len(len).map_err(FrameError::from)?;
                match std::str::from_utf8(raw) {
                    Ok(s) => {
                        let s = s.to_owned();
                        *r = value_probe;
                        Some(HeaderValue::Text(s))
                    },
                    Err(_) => {
                        *r = value_probe;
                        DiagnosticContext::warning_at(
                            "UNSUPPORTED_HEADER",
                            "header text value is not valid UTF-8; entry skipped",
                            value_offset,
                        );
                        None
                    },
                }
            },
            Token::Uint(n) => {
                *r = value_probe;
                match i64::try_from(n) {
                    Ok(i) => Some(HeaderValue::Int(i)),
                    Err(_) => {
                        DiagnosticContext::warning_at(
                            "UNSUPPORTED_HEADER",
                            "header integer value out of range; entry skipped",
                            value_offset,
                        );
                        None
                    },
                }
            },
            Token::Nint(n) => {
                *r = value_probe;
                if n <= i64::MAX as u64 {
                    Some(HeaderValue::Int(-1 - (n as i64)))
                } else {
                    DiagnosticContext::warning_at(
                        "UNSUPPORTED_HEADER",
                        "header integer value out of range; entry skipped",
                        value_offset,
                    );
                    None
                }
            },
            Token::Bool(b) => {
                *r = value_probe;
                Some(HeaderValue::Bool(b))
            },
            Token::Bytes(len) => {
                let raw = value_probe.take_len(len).map_err(FrameError::from)?;
                let bytes = Bytes::copy_from_slice(raw);
                *r = value_probe;
                Some(HeaderValue::Bytes(bytes))
            },
            Token::Float(f) => {
                *r = value_probe;
                Some(HeaderValue::Float(f))
            },
            // null is tolerated on the wire; it decodes as "absent"
            Token::Null => {
                *r = value_probe;
                None
            },
            _ => {
                DiagnosticContext::warning_at(
                    "UNSUPPORTED_HEADER",
                    "header value type is not supported; entry skipped",
                    value_offset,
                );
                r.skip_value().map_err(FrameError::from)?;
                None
            },
        };

        if let (Some(key), Some(value)) = (key, value) {
            headers.insert(key, value);
        }
    }
    Ok(headers)
}

/// Incremental frame codec for [`tokio_util::codec::FramedRead`] /
/// [`tokio_util::codec::FramedWrite`].
///
/// Decode items are [`ParseResult<Frame>`] values: parse failures are
/// yielded as items, not stream errors, so the session layer can report
/// diagnostics before closing. After a failure the codec is poisoned —
/// framing cannot resync — and drains all further input.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    poisoned: bool,
}

impl FrameCodec {
    /// Codec with the default 1 MiB frame cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Codec with an explicit per-frame byte cap.
    #[must_use]
    pub fn with_max_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes, poisoned: false }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = ParseResult<Frame>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.poisoned {
            src.clear();
            return Ok(None);
        }
        if src.is_empty() {
            return Ok(None);
        }
        match parse_step(&src[..], self.max_frame_bytes) {
            Step::Done(result, consumed) => {
                if result.is_failure() {
                    self.poisoned = true;
                    src.clear();
                } else {
                    src.advance(consumed.min(src.len()));
                }
                Ok(Some(result))
            },
            Step::Incomplete => {
                if src.len() >= self.max_frame_bytes {
                    self.poisoned = true;
                    src.clear();
                    Ok(Some(ParseResult::failure(vec![Diagnostic::error(
                        "READ_ERROR",
                        "frame did not complete within the per-frame byte cap",
                    )])))
                } else {
                    Ok(None)
                }
            },
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() || self.poisoned {
            return Ok(None);
        }
        self.poisoned = true;
        src.clear();
        Ok(Some(ParseResult::failure(vec![Diagnostic::error(
            "READ_ERROR",
            "stream ended in the middle of a frame",
        )])))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst);
        Ok(())
    }
}
