//! Scalar wire values.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

use super::TaggedValue;
use crate::cbor::{as_f64, as_i64, Reader, Token, Writer};
use crate::errors::{ProtocolError, Result};

macro_rules! f64_value {
    ($(#[$doc:meta])* $name:ident, $id:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Default)]
        pub struct $name(pub f64);

        impl TaggedValue for $name {
            const TYPE_ID: u8 = $id;
            const NAME: &'static str = stringify!($name);

            fn encode_raw(&self, w: &mut Writer) {
                w.number(self.0);
            }

            fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
                let offset = r.position();
                let token = r.read_token()?;
                as_f64(token)
                    .map(Self)
                    .ok_or(ProtocolError::UnexpectedType { offset, expected: "number" })
            }
        }
    };
}

f64_value!(
    /// Electric potential in volts (type id 0x10).
    Voltage,
    0x10
);
f64_value!(
    /// Electric current in amperes (type id 0x11).
    Current,
    0x11
);
f64_value!(
    /// Power in watts (type id 0x12).
    Power,
    0x12
);
f64_value!(
    /// Energy in watt-hours (type id 0x13).
    Energy,
    0x13
);
f64_value!(
    /// A percentage, 0–100 by convention (type id 0x14).
    Percentage,
    0x14
);
f64_value!(
    /// Resistance in ohms (type id 0x15).
    Resistance,
    0x15
);
f64_value!(
    /// A unitless monetary amount (type id 0x02).
    Amount,
    0x02
);

/// A span of time in milliseconds (type id 0x06).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurationMs(pub i64);

impl TaggedValue for DurationMs {
    const TYPE_ID: u8 = 0x06;
    const NAME: &'static str = "Duration";

    fn encode_raw(&self, w: &mut Writer) {
        w.int(self.0);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        let token = r.read_token()?;
        as_i64(token)
            .map(Self)
            .ok_or(ProtocolError::UnexpectedType { offset, expected: "integer" })
    }
}

/// A text value (type id 0x00).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Text(pub String);

impl TaggedValue for Text {
    const TYPE_ID: u8 = 0x00;
    const NAME: &'static str = "Text";

    fn encode_raw(&self, w: &mut Writer) {
        w.text(&self.0);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self(r.read_text()?.to_owned()))
    }
}

/// A boolean flag (type id 0x01).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flag(pub bool);

impl TaggedValue for Flag {
    const TYPE_ID: u8 = 0x01;
    const NAME: &'static str = "Flag";

    fn encode_raw(&self, w: &mut Writer) {
        w.bool(self.0);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        match r.read_token()? {
            Token::Bool(b) => Ok(Self(b)),
            _ => Err(ProtocolError::UnexpectedType { offset, expected: "boolean" }),
        }
    }
}

/// An opaque byte string (type id 0x04).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Binary(pub Bytes);

impl TaggedValue for Binary {
    const TYPE_ID: u8 = 0x04;
    const NAME: &'static str = "Binary";

    fn encode_raw(&self, w: &mut Writer) {
        w.bytes(&self.0);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        match r.read_token()? {
            Token::Bytes(n) => Ok(Self(Bytes::copy_from_slice(r.take_len(n)?))),
            _ => Err(ProtocolError::UnexpectedType { offset, expected: "byte string" }),
        }
    }
}

/// An ISO 4217-style currency code (type id 0x05).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Currency(pub String);

impl Currency {
    /// Currency from a static code.
    #[must_use]
    pub fn of(code: &str) -> Self {
        Self(code.to_owned())
    }
}

impl TaggedValue for Currency {
    const TYPE_ID: u8 = 0x05;
    const NAME: &'static str = "Currency";

    fn encode_raw(&self, w: &mut Writer) {
        w.text(&self.0);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self(r.read_text()?.to_owned()))
    }
}

/// An instant in time, carried as RFC 3339 text on the wire
/// (type id 0x03).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl TaggedValue for Timestamp {
    const TYPE_ID: u8 = 0x03;
    const NAME: &'static str = "Timestamp";

    fn encode_raw(&self, w: &mut Writer) {
        // AutoSi keeps exactly the precision the instant carries, so
        // encode/decode round-trips to an equal instant.
        w.text(&self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        let text = r.read_text()?;
        DateTime::parse_from_rfc3339(text)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|_| ProtocolError::InvalidTimestamp { offset, text: text.to_owned() })
    }
}
