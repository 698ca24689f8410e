//! Tagged wire values.
//!
//! Every domain value travels as a single-entry CBOR map whose key is the
//! value's numeric type id: `Voltage(744.0)` is `{0x10: 744}`. Each value
//! is its own Rust type carrying that id through the [`TaggedValue`]
//! trait, which keeps message fields strongly typed and makes the tagged
//! wrapping/unwrapping a single shared code path.
//!
//! Decoding is lenient about numeric width (any CBOR integer or float
//! widens to the declared domain type) and strict about everything else;
//! composite decoders additionally salvage what they can, reporting
//! skipped entries through the active
//! [`DiagnosticContext`](crate::diag::DiagnosticContext).

mod composite;
mod enums;
mod scalar;

pub use composite::{Bounds, EnergyMix, IsolationState, PriceForecast, PricePoint, SourceMix};
pub use enums::{EnergySource, IsolationStatus};
pub use scalar::{
    Amount, Binary, Currency, Current, DurationMs, Energy, Flag, Percentage, Power, Resistance,
    Text, Timestamp, Voltage,
};

use crate::cbor::{Reader, Token, Writer};
use crate::errors::{ProtocolError, Result};

/// A value with a stable numeric type id and a raw CBOR body.
pub trait TaggedValue: Sized {
    /// Wire type id, the single map key of the tagged encoding.
    const TYPE_ID: u8;

    /// Human-readable name for diagnostics.
    const NAME: &'static str;

    /// Write the raw (untagged) body.
    fn encode_raw(&self, w: &mut Writer);

    /// Read the raw (untagged) body.
    fn decode_raw(r: &mut Reader<'_>) -> Result<Self>;
}

/// Write `value` in its tagged `{typeId: raw}` form.
pub fn encode_tagged<T: TaggedValue>(value: &T, w: &mut Writer) {
    w.map(1);
    w.uint(u64::from(T::TYPE_ID));
    value.encode_raw(w);
}

/// Write a text value in tagged form without building a [`Text`] first.
pub fn encode_tagged_text(value: &str, w: &mut Writer) {
    w.map(1);
    w.uint(u64::from(Text::TYPE_ID));
    w.text(value);
}

/// Read a tagged `{typeId: raw}` value, requiring `T`'s type id.
pub fn decode_tagged<T: TaggedValue>(r: &mut Reader<'_>) -> Result<T> {
    let offset = r.position();
    match r.read_token()? {
        Token::Map(1) => {},
        Token::Map(_) => {
            return Err(ProtocolError::Malformed {
                offset,
                reason: "tagged value must be a single-entry map",
            });
        },
        _ => return Err(ProtocolError::UnexpectedType { offset, expected: "tagged value map" }),
    }
    let key_offset = r.position();
    let id = match r.read_token()? {
        Token::Uint(id) => id,
        _ => {
            return Err(ProtocolError::UnexpectedType {
                offset: key_offset,
                expected: "integer type id",
            });
        },
    };
    if id != u64::from(T::TYPE_ID) {
        return Err(ProtocolError::WrongTag { offset: key_offset, expected: T::TYPE_ID, found: id });
    }
    T::decode_raw(r)
}

/// Convenience: encode a tagged value to a fresh byte vector.
#[must_use]
pub fn to_tagged_bytes<T: TaggedValue>(value: &T) -> Vec<u8> {
    let mut w = Writer::new();
    encode_tagged(value, &mut w);
    w.into_bytes()
}

/// Convenience: decode a tagged value from a complete byte slice.
pub fn from_tagged_bytes<T: TaggedValue>(bytes: &[u8]) -> Result<T> {
    let mut r = Reader::new(bytes, bytes.len());
    decode_tagged(&mut r)
}
