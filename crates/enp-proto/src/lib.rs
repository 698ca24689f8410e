//! EnergyNet Protocol wire format.
//!
//! This crate owns everything that touches bytes:
//!
//! - [`cbor`]: the CBOR token layer (deterministic writer, capped
//!   defensive reader)
//! - [`values`]: the tagged domain values (`{typeId: raw}` single-entry
//!   maps)
//! - [`frame`]: the magic-prefixed frame envelope and its stream codec
//! - [`message`] + [`registry`]: the closed message set and type-id
//!   dispatch with lenient/strict parse modes
//! - [`diag`]: structured diagnostics; every parse returns a
//!   [`ParseResult`], nothing throws across the decoder boundary
//!
//! The async session/peer/transfer machinery lives in `enp-core`; this
//! crate is pure and synchronous so it can be tested byte-for-byte and
//! fuzzed without a runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cbor;
pub mod diag;
pub mod errors;
pub mod frame;
pub mod message;
pub mod registry;
pub mod values;

pub use diag::{Diagnostic, DiagnosticCollector, DiagnosticContext, ParseResult, Severity};
pub use errors::ProtocolError;
pub use frame::{Frame, FrameCodec, HeaderValue, DEFAULT_MAX_FRAME_BYTES, FRAME_MAGIC};
pub use message::{
    DemandParameters, Message, SessionParameters, SoftDisconnect, StorageParameters,
    SupplyParameters,
};
pub use registry::{decode_message, parse_frame, ParseMode};

/// Default TCP port EnergyNet nodes listen on.
pub const DEFAULT_PORT: u16 = 56540;
