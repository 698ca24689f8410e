//! Error types for the EnergyNet wire format.
//!
//! These errors stay inside the codec: the public decoding surface reports
//! outcomes as [`ParseResult`](crate::diag::ParseResult) values carrying
//! [`Diagnostic`](crate::diag::Diagnostic)s, and never lets an error cross
//! the decoder boundary as a panic or a bare `Err`.

use thiserror::Error;

/// Low-level decode failures produced by the CBOR reader and the value
/// codec.
///
/// `Incomplete` is special: during stream decoding it means "wait for more
/// bytes", while inside a bounded payload it means the payload is
/// truncated. `CapExceeded` is always fatal for the frame being decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input ended in the middle of a data item
    #[error("unexpected end of input")]
    Incomplete,

    /// A read or skip would cross the per-frame byte cap
    #[error("byte cap exceeded at offset {offset}")]
    CapExceeded {
        /// Offset at which the cap was hit
        offset: usize,
    },

    /// Structurally invalid CBOR
    #[error("malformed CBOR at offset {offset}: {reason}")]
    Malformed {
        /// Offset of the offending byte
        offset: usize,
        /// What was wrong
        reason: &'static str,
    },

    /// A data item of the wrong kind where a specific kind was required
    #[error("expected {expected} at offset {offset}")]
    UnexpectedType {
        /// Offset of the offending item
        offset: usize,
        /// Human-readable description of the expected item
        expected: &'static str,
    },

    /// A tagged value carried a different type id than the field requires
    #[error("wrong value tag at offset {offset}: expected {expected:#04x}, found {found:#x}")]
    WrongTag {
        /// Offset of the tag key
        offset: usize,
        /// The type id the field requires
        expected: u8,
        /// The type id found on the wire
        found: u64,
    },

    /// A required message field was absent
    #[error("missing required field `{field}` in {message}")]
    MissingField {
        /// Message name
        message: &'static str,
        /// Field name
        field: &'static str,
    },

    /// A timestamp value did not parse as RFC 3339 text
    #[error("invalid timestamp at offset {offset}: {text:?}")]
    InvalidTimestamp {
        /// Offset of the text item
        offset: usize,
        /// The offending text
        text: String,
    },

    /// An enum field carried a discriminant outside its closed set
    #[error("unknown {name} discriminant {value:#04x} at offset {offset}")]
    UnknownDiscriminant {
        /// Enum name
        name: &'static str,
        /// The wire discriminant
        value: u64,
        /// Offset of the discriminant
        offset: usize,
    },
}

impl ProtocolError {
    /// Byte offset the error is anchored to, when it has one.
    #[must_use]
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::Incomplete | Self::MissingField { .. } => None,
            Self::CapExceeded { offset }
            | Self::Malformed { offset, .. }
            | Self::UnexpectedType { offset, .. }
            | Self::WrongTag { offset, .. }
            | Self::InvalidTimestamp { offset, .. }
            | Self::UnknownDiscriminant { offset, .. } => Some(*offset),
        }
    }
}

/// Convenient Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
