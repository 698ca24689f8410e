//! Composite wire values.
//!
//! Composites embed their inner values in full tagged form, so a
//! `Bounds<Voltage>` is `{0x20: [{0x10: min}, {0x10: max}]}`. Mix and
//! forecast decoders are salvage decoders: a damaged entry is skipped with
//! a warning and the rest of the value survives. Hard structural damage
//! (wrong outer shape, truncation, cap) still fails the whole value.

use std::collections::BTreeMap;

use super::{decode_tagged, encode_tagged, TaggedValue};
use crate::cbor::{Reader, Token, Writer};
use crate::diag::DiagnosticContext;
use crate::errors::{ProtocolError, Result};
use crate::values::{Amount, Currency, Energy, EnergySource, IsolationStatus, Percentage,
    Resistance, Timestamp};

/// An inclusive `[min, max]` range of an inner value (type id 0x20).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds<T> {
    /// Lower bound
    pub min: T,
    /// Upper bound
    pub max: T,
}

impl<T> Bounds<T> {
    /// Bounds from a `(min, max)` pair.
    #[must_use]
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: TaggedValue> TaggedValue for Bounds<T> {
    const TYPE_ID: u8 = 0x20;
    const NAME: &'static str = "Bounds";

    fn encode_raw(&self, w: &mut Writer) {
        w.array(2);
        encode_tagged(&self.min, w);
        encode_tagged(&self.max, w);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        match r.read_token()? {
            Token::Array(2) => {},
            Token::Array(_) => {
                return Err(ProtocolError::Malformed {
                    offset,
                    reason: "bounds must hold exactly two elements",
                });
            },
            _ => return Err(ProtocolError::UnexpectedType { offset, expected: "bounds array" }),
        }
        Ok(Self { min: decode_tagged(r)?, max: decode_tagged(r)? })
    }
}

/// Relative share of each energy source, as percentages (type id 0x40).
///
/// Wire shape: an *array* of single-entry `{sourceId: percentage}` maps,
/// in any order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceMix {
    /// Share per source
    pub shares: BTreeMap<EnergySource, Percentage>,
}

impl FromIterator<(EnergySource, Percentage)> for SourceMix {
    fn from_iter<I: IntoIterator<Item = (EnergySource, Percentage)>>(iter: I) -> Self {
        Self { shares: iter.into_iter().collect() }
    }
}

impl TaggedValue for SourceMix {
    const TYPE_ID: u8 = 0x40;
    const NAME: &'static str = "SourceMix";

    fn encode_raw(&self, w: &mut Writer) {
        encode_mix(&self.shares, w);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { shares: decode_mix(r, "MISSING_PERCENTAGE")? })
    }
}

/// Absolute energy per source, in watt-hours (type id 0x41).
///
/// Same wire shape as [`SourceMix`], with [`Energy`] inner values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnergyMix {
    /// Energy per source
    pub shares: BTreeMap<EnergySource, Energy>,
}

impl FromIterator<(EnergySource, Energy)> for EnergyMix {
    fn from_iter<I: IntoIterator<Item = (EnergySource, Energy)>>(iter: I) -> Self {
        Self { shares: iter.into_iter().collect() }
    }
}

impl TaggedValue for EnergyMix {
    const TYPE_ID: u8 = 0x41;
    const NAME: &'static str = "EnergyMix";

    fn encode_raw(&self, w: &mut Writer) {
        encode_mix(&self.shares, w);
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { shares: decode_mix(r, "MISSING_ENERGY")? })
    }
}

fn encode_mix<T: TaggedValue>(shares: &BTreeMap<EnergySource, T>, w: &mut Writer) {
    w.array(shares.len() as u64);
    for (source, value) in shares {
        w.map(1);
        w.uint(u64::from(source.to_u8()));
        encode_tagged(value, w);
    }
}

/// Shared salvage decoder for both mixes. `missing_code` names the
/// diagnostic used when an entry's value does not decode as the inner
/// type.
fn decode_mix<T: TaggedValue>(
    r: &mut Reader<'_>,
    missing_code: &'static str,
) -> Result<BTreeMap<EnergySource, T>> {
    let offset = r.position();
    let entries = match r.read_token()? {
        Token::Array(n) => n,
        _ => return Err(ProtocolError::UnexpectedType { offset, expected: "mix array" }),
    };

    let mut shares = BTreeMap::new();
    for index in 0..entries {
        let _path = DiagnosticContext::push_path(format!("[{index}]"));
        let entry_offset = r.position();
        let pairs = match r.read_token()? {
            Token::Map(0) => {
                DiagnosticContext::warning_at(
                    "EMPTY_SOURCE_ENTRY",
                    "mix entry is an empty map",
                    entry_offset,
                );
                continue;
            },
            Token::Map(n) => n,
            _ => {
                return Err(ProtocolError::UnexpectedType {
                    offset: entry_offset,
                    expected: "mix entry map",
                });
            },
        };

        for _ in 0..pairs {
            let key_offset = r.position();
            let mut key_probe = r.clone();
            let source = match key_probe.read_token()? {
                Token::Uint(id) => {
                    *r = key_probe;
                    u8::try_from(id).ok().and_then(EnergySource::from_u8)
                },
                // consume the whole key item, payload included
                _ => {
                    r.skip_value()?;
                    None
                },
            };
            let Some(source) = source else {
                DiagnosticContext::warning_at(
                    "UNKNOWN_SOURCE_ID",
                    "mix entry key is not a known energy source",
                    key_offset,
                );
                r.skip_value()?;
                continue;
            };

            // Probe the inner value so a damaged one can be skipped
            // without losing stream position.
            let mut probe = r.clone();
            match decode_tagged::<T>(&mut probe) {
                Ok(value) => {
                    *r = probe;
                    if shares.contains_key(&source) {
                        DiagnosticContext::warning_at(
                            "DUPLICATE_SOURCE",
                            format!("duplicate entry for {source:?}, keeping the first"),
                            key_offset,
                        );
                    } else {
                        shares.insert(source, value);
                    }
                },
                Err(err @ (ProtocolError::Incomplete | ProtocolError::CapExceeded { .. })) => {
                    return Err(err);
                },
                Err(_) => {
                    DiagnosticContext::warning_at(
                        missing_code,
                        format!("mix entry for {source:?} does not hold the expected value"),
                        key_offset,
                    );
                    r.skip_value()?;
                },
            }
        }
    }
    Ok(shares)
}

/// One priced time slot of a forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    /// Start of the slot
    pub at: Timestamp,
    /// Price for the slot
    pub amount: Amount,
    /// Currency the amount is quoted in
    pub currency: Currency,
}

/// An ordered list of upcoming energy prices (type id 0x30).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriceForecast {
    /// Forecast entries, soonest first by convention
    pub points: Vec<PricePoint>,
}

impl TaggedValue for PriceForecast {
    const TYPE_ID: u8 = 0x30;
    const NAME: &'static str = "PriceForecast";

    fn encode_raw(&self, w: &mut Writer) {
        w.array(self.points.len() as u64);
        for point in &self.points {
            w.array(3);
            encode_tagged(&point.at, w);
            encode_tagged(&point.amount, w);
            encode_tagged(&point.currency, w);
        }
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        let entries = match r.read_token()? {
            Token::Array(n) => n,
            _ => return Err(ProtocolError::UnexpectedType { offset, expected: "forecast array" }),
        };

        let mut points = Vec::new();
        for index in 0..entries {
            let _path = DiagnosticContext::push_path(format!("[{index}]"));
            let entry_offset = r.position();
            let mut probe = r.clone();
            match decode_price_point(&mut probe) {
                Ok(point) => {
                    *r = probe;
                    points.push(point);
                },
                Err(err @ (ProtocolError::Incomplete | ProtocolError::CapExceeded { .. })) => {
                    return Err(err);
                },
                Err(_) => {
                    DiagnosticContext::warning_at(
                        "INVALID_PRICE_ENTRY",
                        "forecast entry is not a [timestamp, amount, currency] triple",
                        entry_offset,
                    );
                    r.skip_value()?;
                },
            }
        }
        Ok(Self { points })
    }
}

fn decode_price_point(r: &mut Reader<'_>) -> Result<PricePoint> {
    let offset = r.position();
    match r.read_token()? {
        Token::Array(3) => {},
        _ => {
            return Err(ProtocolError::UnexpectedType { offset, expected: "price triple" });
        },
    }
    Ok(PricePoint { at: decode_tagged(r)?, amount: decode_tagged(r)?, currency: decode_tagged(r)? })
}

/// Insulation measurement state (type id 0x50).
///
/// Wire shape: `[statusId, negativeResistance-or-null,
/// positiveResistance-or-null]`. Missing tail elements decode as absent
/// resistances; extra elements are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IsolationState {
    /// Measurement status
    pub status: IsolationStatus,
    /// Resistance on the negative conductor, when measured
    pub negative: Option<Resistance>,
    /// Resistance on the positive conductor, when measured
    pub positive: Option<Resistance>,
}

impl IsolationState {
    /// State with a status and no resistances.
    #[must_use]
    pub fn of(status: IsolationStatus) -> Self {
        Self { status, negative: None, positive: None }
    }
}

impl TaggedValue for IsolationState {
    const TYPE_ID: u8 = 0x50;
    const NAME: &'static str = "IsolationState";

    fn encode_raw(&self, w: &mut Writer) {
        w.array(3);
        w.uint(u64::from(self.status.to_u8()));
        match &self.negative {
            Some(res) => encode_tagged(res, w),
            None => w.null(),
        }
        match &self.positive {
            Some(res) => encode_tagged(res, w),
            None => w.null(),
        }
    }

    fn decode_raw(r: &mut Reader<'_>) -> Result<Self> {
        let offset = r.position();
        let len = match r.read_token()? {
            Token::Array(n) if n >= 1 => n,
            Token::Array(_) => {
                return Err(ProtocolError::Malformed {
                    offset,
                    reason: "isolation state must hold at least a status",
                });
            },
            _ => {
                return Err(ProtocolError::UnexpectedType {
                    offset,
                    expected: "isolation state array",
                });
            },
        };

        let status_offset = r.position();
        let status = match r.read_token()? {
            Token::Uint(id) => u8::try_from(id).ok().and_then(IsolationStatus::from_u8).ok_or(
                ProtocolError::UnknownDiscriminant {
                    name: "IsolationStatus",
                    value: id,
                    offset: status_offset,
                },
            )?,
            _ => {
                return Err(ProtocolError::UnexpectedType {
                    offset: status_offset,
                    expected: "status discriminant",
                });
            },
        };

        let mut state = Self::of(status);
        if len >= 2 {
            state.negative = decode_optional_resistance(r)?;
        }
        if len >= 3 {
            state.positive = decode_optional_resistance(r)?;
        }
        for _ in 3..len {
            r.skip_value()?;
        }
        Ok(state)
    }
}

fn decode_optional_resistance(r: &mut Reader<'_>) -> Result<Option<Resistance>> {
    let mut probe = r.clone();
    if probe.read_token()? == Token::Null {
        *r = probe;
        return Ok(None);
    }
    decode_tagged(r).map(Some)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;
    use crate::diag::DiagnosticContext;
    use crate::values::{from_tagged_bytes, to_tagged_bytes, Voltage};

    fn decode_collecting<T: TaggedValue>(bytes: &[u8]) -> (Result<T>, Vec<crate::diag::Diagnostic>) {
        DiagnosticContext::capture(|| from_tagged_bytes::<T>(bytes))
    }

    #[test]
    fn bounds_round_trip() {
        let bounds = Bounds::new(Voltage(180.0), Voltage(250.0));
        let bytes = to_tagged_bytes(&bounds);
        assert_eq!(from_tagged_bytes::<Bounds<Voltage>>(&bytes).unwrap(), bounds);
    }

    #[test]
    fn bounds_wrong_arity_fails() {
        // {0x20: [one voltage]}
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x20);
        w.array(1);
        encode_tagged(&Voltage(1.0), &mut w);
        assert!(from_tagged_bytes::<Bounds<Voltage>>(&w.into_bytes()).is_err());
    }

    #[test]
    fn source_mix_round_trips_in_any_order() {
        let mix: SourceMix = [
            (EnergySource::Solar, Percentage(60.0)),
            (EnergySource::Wind, Percentage(40.0)),
        ]
        .into_iter()
        .collect();
        let bytes = to_tagged_bytes(&mix);
        assert_eq!(from_tagged_bytes::<SourceMix>(&bytes).unwrap(), mix);

        // Hand-build the reversed order; decode must not care.
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x40);
        w.array(2);
        w.map(1);
        w.uint(0x02);
        encode_tagged(&Percentage(60.0), &mut w);
        w.map(1);
        w.uint(0x01);
        encode_tagged(&Percentage(40.0), &mut w);
        assert_eq!(from_tagged_bytes::<SourceMix>(&w.into_bytes()).unwrap(), mix);
    }

    #[test]
    fn source_mix_keeps_first_duplicate_and_warns() {
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x40);
        w.array(2);
        w.map(1);
        w.uint(0x01);
        encode_tagged(&Percentage(30.0), &mut w);
        w.map(1);
        w.uint(0x01);
        encode_tagged(&Percentage(99.0), &mut w);

        let (result, diags) = decode_collecting::<SourceMix>(&w.into_bytes());
        let mix = result.unwrap();
        assert_eq!(mix.shares[&EnergySource::Wind], Percentage(30.0));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, "DUPLICATE_SOURCE");
        assert_eq!(diags[0].field_path.as_deref(), Some("[1]"));
    }

    #[test]
    fn source_mix_skips_damaged_entries() {
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x40);
        w.array(4);
        // empty entry
        w.map(0);
        // unknown source id
        w.map(1);
        w.uint(0x7F);
        encode_tagged(&Percentage(10.0), &mut w);
        // value is not a percentage
        w.map(1);
        w.uint(0x02);
        encode_tagged(&Voltage(230.0), &mut w);
        // healthy entry
        w.map(1);
        w.uint(0x01);
        encode_tagged(&Percentage(55.0), &mut w);

        let (result, diags) = decode_collecting::<SourceMix>(&w.into_bytes());
        let mix = result.unwrap();
        assert_eq!(mix.shares.len(), 1);
        assert_eq!(mix.shares[&EnergySource::Wind], Percentage(55.0));
        let codes: Vec<_> = diags.iter().map(|d| d.code).collect();
        assert_eq!(codes, ["EMPTY_SOURCE_ENTRY", "UNKNOWN_SOURCE_ID", "MISSING_PERCENTAGE"]);
    }

    #[test]
    fn energy_mix_uses_its_own_missing_code() {
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x41);
        w.array(1);
        w.map(1);
        w.uint(0x03);
        encode_tagged(&Percentage(12.0), &mut w);

        let (result, diags) = decode_collecting::<EnergyMix>(&w.into_bytes());
        assert!(result.unwrap().shares.is_empty());
        assert_eq!(diags[0].code, "MISSING_ENERGY");
    }

    #[test]
    fn price_forecast_round_trip() {
        let forecast = PriceForecast {
            points: vec![
                PricePoint {
                    at: Timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()),
                    amount: Amount(0.21),
                    currency: Currency::of("EUR"),
                },
                PricePoint {
                    at: Timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap()),
                    amount: Amount(0.19),
                    currency: Currency::of("EUR"),
                },
            ],
        };
        let bytes = to_tagged_bytes(&forecast);
        assert_eq!(from_tagged_bytes::<PriceForecast>(&bytes).unwrap(), forecast);
    }

    #[test]
    fn price_forecast_skips_short_triples() {
        let mut w = Writer::new();
        w.map(1);
        w.uint(0x30);
        w.array(2);
        // two-element entry
        w.array(2);
        encode_tagged(&Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()), &mut w);
        encode_tagged(&Amount(0.5), &mut w);
        // healthy entry
        w.array(3);
        encode_tagged(&Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()), &mut w);
        encode_tagged(&Amount(0.4), &mut w);
        encode_tagged(&Currency::of("SEK"), &mut w);

        let (result, diags) = decode_collecting::<PriceForecast>(&w.into_bytes());
        let forecast = result.unwrap();
        assert_eq!(forecast.points.len(), 1);
        assert_eq!(forecast.points[0].currency, Currency::of("SEK"));
        assert_eq!(diags[0].code, "INVALID_PRICE_ENTRY");
    }

    #[test]
    fn isolation_state_null_tail_round_trip() {
        let full = IsolationState {
            status: IsolationStatus::Ok,
            negative: Some(Resistance(120_000.0)),
            positive: None,
        };
        let bytes = to_tagged_bytes(&full);
        assert_eq!(from_tagged_bytes::<IsolationState>(&bytes).unwrap(), full);
    }

    #[test]
    fn isolation_state_short_array_decodes_missing_tail() {
        // {0x50: [2]}
        let bytes = [0xA1, 0x18, 0x50, 0x81, 0x02];
        let state = from_tagged_bytes::<IsolationState>(&bytes).unwrap();
        assert_eq!(state.status, IsolationStatus::Warning);
        assert_eq!(state.negative, None);
        assert_eq!(state.positive, None);
    }

    #[test]
    fn isolation_state_empty_array_fails() {
        let bytes = [0xA1, 0x18, 0x50, 0x80];
        assert!(from_tagged_bytes::<IsolationState>(&bytes).is_err());
    }

    #[test]
    fn isolation_state_unknown_status_fails() {
        let bytes = [0xA1, 0x18, 0x50, 0x81, 0x09];
        assert!(matches!(
            from_tagged_bytes::<IsolationState>(&bytes),
            Err(ProtocolError::UnknownDiscriminant { .. })
        ));
    }
}
