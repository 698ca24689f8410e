//! Message registry: type-id dispatch and the lenient/strict parse modes.
//!
//! The registry is the only place payload bytes become [`Message`] values.
//! Lenient mode (the default) tolerates unknown type ids — they come back
//! as [`Message::Unknown`] with an `UNKNOWN_MESSAGE_TYPE` warning — and
//! lets inner warnings ride on a successful parse. Strict mode runs the
//! lenient parser, promotes every warning to an error, and forces any
//! diagnosed parse to failure.
//!
//! Value-codec failures never escape as errors: they are caught here and
//! reported as `PARSE_ERROR` diagnostics.

use bytes::Bytes;

use crate::diag::{Diagnostic, DiagnosticContext, ParseResult};
use crate::frame::Frame;
use crate::message::Message;

/// How tolerant a parse should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Tolerate unknown types and warnings
    #[default]
    Lenient,
    /// Promote warnings to errors and fail any diagnosed parse
    Strict,
}

/// Decode a message payload by type id.
#[must_use]
pub fn decode_message(type_id: u32, payload: &[u8], mode: ParseMode) -> ParseResult<Message> {
    let (outcome, mut diagnostics) = DiagnosticContext::capture(|| {
        match Message::decode_known(type_id, payload) {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                DiagnosticContext::warning(
                    "UNKNOWN_MESSAGE_TYPE",
                    format!("unknown message type id {type_id:#010x}"),
                );
                Ok(Message::Unknown { type_id, payload: Bytes::copy_from_slice(payload) })
            },
            Err(err) => Err(err),
        }
    });

    let result = match outcome {
        Ok(message) => ParseResult::success(message, diagnostics),
        Err(err) => {
            let mut diag = Diagnostic::error("PARSE_ERROR", err.to_string());
            diag.byte_offset = err.offset();
            diagnostics.push(diag);
            ParseResult::failure(diagnostics)
        },
    };

    match mode {
        ParseMode::Lenient => result,
        ParseMode::Strict => result.promote_warnings(),
    }
}

/// Decode the message carried by a frame, merging the frame's diagnostics
/// ahead of the message-level ones.
#[must_use]
pub fn parse_frame(frame: &Frame, mode: ParseMode) -> ParseResult<Message> {
    decode_message(frame.message_type_id, &frame.payload, mode)
}
