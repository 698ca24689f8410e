//! Typed protocol messages.
//!
//! Messages form a closed set identified by 32-bit type ids. Each payload
//! is a CBOR map from integer field ids to tagged values; optional fields
//! are omitted entirely when absent (never null-encoded), and unknown
//! field ids are skipped for forward compatibility.
//!
//! The enum keeps dispatch static: the session engine's handshake and
//! active matchers are exhaustive, and adding a variant breaks every
//! `match` that needs to learn about it.

use bytes::Bytes;

use crate::cbor::{Reader, Token, Writer};
use crate::errors::{ProtocolError, Result};
use crate::frame::Frame;
use crate::values::{
    decode_tagged, encode_tagged, encode_tagged_text, Bounds, Current, DurationMs, Energy,
    EnergyMix, Flag, IsolationState, Percentage, Power, PriceForecast, SourceMix, TaggedValue,
    Text, Timestamp, Voltage,
};

/// Message type ids. Part of the wire contract.
pub mod type_id {
    /// Keepalive, empty payload
    pub const PING: u32 = 0xFFFF_FFFF;
    /// Handshake / identity exchange
    pub const SESSION_PARAMETERS: u32 = 0xBABA_5E55;
    /// Graceful disconnect announcement
    pub const SOFT_DISCONNECT: u32 = 0xBABA_DEAD;
    /// Supply-side energy parameters
    pub const SUPPLY_PARAMETERS: u32 = 0xDCDC_F00D;
    /// Demand-side energy parameters
    pub const DEMAND_PARAMETERS: u32 = 0xDCDC_FEED;
    /// Storage energy parameters
    pub const STORAGE_PARAMETERS: u32 = 0xDCDC_BA77;
}

/// Identity and descriptive metadata exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// Endpoint identity; the only required field, matched against peer
    /// configurations
    pub identity: String,
    /// Endpoint kind, e.g. `charger`, `vehicle`, `router`
    pub device_type: Option<String>,
    /// Protocol or firmware version
    pub version: Option<String>,
    /// Human-readable endpoint name
    pub name: Option<String>,
    /// Owning tenant
    pub tenant: Option<String>,
    /// Operating provider
    pub provider: Option<String>,
    /// Caller-assigned session label
    pub session: Option<String>,
}

impl SessionParameters {
    /// Parameters with only the required identity.
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            device_type: None,
            version: None,
            name: None,
            tenant: None,
            provider: None,
            session: None,
        }
    }

    /// Builder-style device type.
    #[must_use]
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    fn encode_payload(&self, w: &mut Writer) {
        let optional = [
            &self.device_type,
            &self.version,
            &self.name,
            &self.tenant,
            &self.provider,
            &self.session,
        ];
        let count = 1 + optional.iter().filter(|f| f.is_some()).count();
        w.map(count as u64);
        w.uint(0);
        encode_tagged_text(&self.identity, w);
        for (index, field) in optional.into_iter().enumerate() {
            if let Some(text) = field {
                w.uint(index as u64 + 1);
                encode_tagged_text(text, w);
            }
        }
    }

    fn decode_payload(r: &mut Reader<'_>) -> Result<Self> {
        let mut identity = None;
        let mut out = Self::new(String::new());
        for_each_field(r, |field, r| {
            match field {
                0 => identity = Some(decode_tagged::<Text>(r)?.0),
                1 => out.device_type = Some(decode_tagged::<Text>(r)?.0),
                2 => out.version = Some(decode_tagged::<Text>(r)?.0),
                3 => out.name = Some(decode_tagged::<Text>(r)?.0),
                4 => out.tenant = Some(decode_tagged::<Text>(r)?.0),
                5 => out.provider = Some(decode_tagged::<Text>(r)?.0),
                6 => out.session = Some(decode_tagged::<Text>(r)?.0),
                _ => r.skip_value()?,
            }
            Ok(())
        })?;
        out.identity = identity.ok_or(ProtocolError::MissingField {
            message: "SessionParameters",
            field: "identity",
        })?;
        Ok(out)
    }
}

/// Graceful disconnect announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SoftDisconnect {
    /// Whether the sender intends to reconnect
    pub reconnect: Option<bool>,
    /// Human-readable reason
    pub reason: Option<String>,
}

impl SoftDisconnect {
    /// Disconnect with a reason and no reconnect intent.
    #[must_use]
    pub fn final_with_reason(reason: impl Into<String>) -> Self {
        Self { reconnect: Some(false), reason: Some(reason.into()) }
    }

    fn encode_payload(&self, w: &mut Writer) {
        let count = usize::from(self.reconnect.is_some()) + usize::from(self.reason.is_some());
        w.map(count as u64);
        if let Some(reconnect) = self.reconnect {
            w.uint(0);
            encode_tagged(&Flag(reconnect), w);
        }
        if let Some(reason) = &self.reason {
            w.uint(1);
            encode_tagged_text(reason, w);
        }
    }

    fn decode_payload(r: &mut Reader<'_>) -> Result<Self> {
        let mut out = Self::default();
        for_each_field(r, |field, r| {
            match field {
                0 => out.reconnect = Some(decode_tagged::<Flag>(r)?.0),
                1 => out.reason = Some(decode_tagged::<Text>(r)?.0),
                _ => r.skip_value()?,
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Parameters published by a supplying endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SupplyParameters {
    /// Permitted voltage range
    pub voltage_limits: Option<Bounds<Voltage>>,
    /// Permitted current range
    pub current_limits: Option<Bounds<Current>>,
    /// Maximum deliverable power
    pub power_limit: Option<Power>,
    /// Relative generation mix
    pub power_mix: Option<SourceMix>,
    /// Upcoming prices
    pub energy_prices: Option<PriceForecast>,
    /// Present output voltage
    pub voltage: Option<Voltage>,
    /// Present output current
    pub current: Option<Current>,
    /// Insulation measurement state
    pub isolation: Option<IsolationState>,
}

impl SupplyParameters {
    fn encode_payload(&self, w: &mut Writer) {
        let mut fields = FieldWriter::new();
        fields.put(0, self.voltage_limits.as_ref());
        fields.put(1, self.current_limits.as_ref());
        fields.put(2, self.power_limit.as_ref());
        fields.put(3, self.power_mix.as_ref());
        fields.put(4, self.energy_prices.as_ref());
        fields.put(5, self.voltage.as_ref());
        fields.put(6, self.current.as_ref());
        fields.put(7, self.isolation.as_ref());
        fields.finish(w);
    }

    fn decode_payload(r: &mut Reader<'_>) -> Result<Self> {
        let mut out = Self::default();
        for_each_field(r, |field, r| {
            match field {
                0 => out.voltage_limits = Some(decode_field(r, "voltageLimits")?),
                1 => out.current_limits = Some(decode_field(r, "currentLimits")?),
                2 => out.power_limit = Some(decode_field(r, "powerLimit")?),
                3 => out.power_mix = Some(decode_field(r, "powerMix")?),
                4 => out.energy_prices = Some(decode_field(r, "energyPrices")?),
                5 => out.voltage = Some(decode_field(r, "voltage")?),
                6 => out.current = Some(decode_field(r, "current")?),
                7 => out.isolation = Some(decode_field(r, "isolation")?),
                _ => r.skip_value()?,
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Parameters published by a demanding endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DemandParameters {
    /// Present input voltage
    pub voltage: Option<Voltage>,
    /// Present input current
    pub current: Option<Current>,
    /// Acceptable voltage range
    pub voltage_limits: Option<Bounds<Voltage>>,
    /// Acceptable current range
    pub current_limits: Option<Bounds<Current>>,
    /// Maximum acceptable power
    pub power_limit: Option<Power>,
    /// Expected remaining demand duration
    pub duration: Option<DurationMs>,
}

impl DemandParameters {
    fn encode_payload(&self, w: &mut Writer) {
        let mut fields = FieldWriter::new();
        fields.put(0, self.voltage.as_ref());
        fields.put(1, self.current.as_ref());
        fields.put(2, self.voltage_limits.as_ref());
        fields.put(3, self.current_limits.as_ref());
        fields.put(4, self.power_limit.as_ref());
        fields.put(5, self.duration.as_ref());
        fields.finish(w);
    }

    fn decode_payload(r: &mut Reader<'_>) -> Result<Self> {
        let mut out = Self::default();
        for_each_field(r, |field, r| {
            match field {
                0 => out.voltage = Some(decode_field(r, "voltage")?),
                1 => out.current = Some(decode_field(r, "current")?),
                2 => out.voltage_limits = Some(decode_field(r, "voltageLimits")?),
                3 => out.current_limits = Some(decode_field(r, "currentLimits")?),
                4 => out.power_limit = Some(decode_field(r, "powerLimit")?),
                5 => out.duration = Some(decode_field(r, "duration")?),
                _ => r.skip_value()?,
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Parameters published by a storage endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StorageParameters {
    /// State of charge
    pub soc: Option<Percentage>,
    /// Target state of charge
    pub soc_target: Option<Percentage>,
    /// When the target should be reached
    pub soc_target_time: Option<Timestamp>,
    /// Usable capacity
    pub capacity: Option<Energy>,
    /// Stored energy per source
    pub energy_mix: Option<EnergyMix>,
}

impl StorageParameters {
    fn encode_payload(&self, w: &mut Writer) {
        let mut fields = FieldWriter::new();
        fields.put(0, self.soc.as_ref());
        fields.put(1, self.soc_target.as_ref());
        fields.put(2, self.soc_target_time.as_ref());
        fields.put(3, self.capacity.as_ref());
        fields.put(4, self.energy_mix.as_ref());
        fields.finish(w);
    }

    fn decode_payload(r: &mut Reader<'_>) -> Result<Self> {
        let mut out = Self::default();
        for_each_field(r, |field, r| {
            match field {
                0 => out.soc = Some(decode_field(r, "soc")?),
                1 => out.soc_target = Some(decode_field(r, "socTarget")?),
                2 => out.soc_target_time = Some(decode_field(r, "socTargetTime")?),
                3 => out.capacity = Some(decode_field(r, "capacity")?),
                4 => out.energy_mix = Some(decode_field(r, "energyMix")?),
                _ => r.skip_value()?,
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Every message the protocol speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Keepalive; no payload, no reply
    Ping,
    /// Handshake identity exchange
    SessionParameters(SessionParameters),
    /// Graceful disconnect announcement
    SoftDisconnect(SoftDisconnect),
    /// Supply-side parameters
    SupplyParameters(SupplyParameters),
    /// Demand-side parameters
    DemandParameters(DemandParameters),
    /// Storage parameters
    StorageParameters(StorageParameters),
    /// A message with an unrecognized type id, carried opaquely
    Unknown {
        /// The unrecognized type id
        type_id: u32,
        /// The raw payload bytes
        payload: Bytes,
    },
}

impl Message {
    /// Wire type id of this message.
    #[must_use]
    pub const fn type_id(&self) -> u32 {
        match self {
            Self::Ping => type_id::PING,
            Self::SessionParameters(_) => type_id::SESSION_PARAMETERS,
            Self::SoftDisconnect(_) => type_id::SOFT_DISCONNECT,
            Self::SupplyParameters(_) => type_id::SUPPLY_PARAMETERS,
            Self::DemandParameters(_) => type_id::DEMAND_PARAMETERS,
            Self::StorageParameters(_) => type_id::STORAGE_PARAMETERS,
            Self::Unknown { type_id, .. } => *type_id,
        }
    }

    /// Variant name, used in handshake-failure reasons and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::SessionParameters(_) => "SessionParameters",
            Self::SoftDisconnect(_) => "SoftDisconnect",
            Self::SupplyParameters(_) => "SupplyParameters",
            Self::DemandParameters(_) => "DemandParameters",
            Self::StorageParameters(_) => "StorageParameters",
            Self::Unknown { .. } => "Unknown",
        }
    }

    /// Encode the payload (not the frame envelope).
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut w = Writer::new();
        match self {
            Self::Ping => {},
            Self::SessionParameters(inner) => inner.encode_payload(&mut w),
            Self::SoftDisconnect(inner) => inner.encode_payload(&mut w),
            Self::SupplyParameters(inner) => inner.encode_payload(&mut w),
            Self::DemandParameters(inner) => inner.encode_payload(&mut w),
            Self::StorageParameters(inner) => inner.encode_payload(&mut w),
            Self::Unknown { payload, .. } => return payload.clone(),
        }
        Bytes::from(w.into_bytes())
    }

    /// Wrap this message in a header-less frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.type_id(), self.encode_payload())
    }

    /// Decode a known message's payload. Callers that want lenient
    /// unknown-type handling should go through
    /// [`crate::registry::decode_message`] instead.
    pub fn decode_known(known_type_id: u32, payload: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(payload, payload.len());
        let message = match known_type_id {
            type_id::PING => Self::Ping,
            type_id::SESSION_PARAMETERS => {
                Self::SessionParameters(SessionParameters::decode_payload(&mut r)?)
            },
            type_id::SOFT_DISCONNECT => {
                Self::SoftDisconnect(SoftDisconnect::decode_payload(&mut r)?)
            },
            type_id::SUPPLY_PARAMETERS => {
                Self::SupplyParameters(SupplyParameters::decode_payload(&mut r)?)
            },
            type_id::DEMAND_PARAMETERS => {
                Self::DemandParameters(DemandParameters::decode_payload(&mut r)?)
            },
            type_id::STORAGE_PARAMETERS => {
                Self::StorageParameters(StorageParameters::decode_payload(&mut r)?)
            },
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Iterate a payload's `fieldId -> value` map.
fn for_each_field(
    r: &mut Reader<'_>,
    mut visit: impl FnMut(u64, &mut Reader<'_>) -> Result<()>,
) -> Result<()> {
    let offset = r.position();
    let entries = match r.read_token()? {
        Token::Map(n) => n,
        _ => return Err(ProtocolError::UnexpectedType { offset, expected: "field map" }),
    };
    for _ in 0..entries {
        let key_offset = r.position();
        let field = match r.read_token()? {
            Token::Uint(id) => id,
            _ => {
                return Err(ProtocolError::UnexpectedType {
                    offset: key_offset,
                    expected: "integer field id",
                });
            },
        };
        visit(field, r)?;
    }
    Ok(())
}

fn decode_field<T: TaggedValue>(r: &mut Reader<'_>, path: &'static str) -> Result<T> {
    let _path = crate::diag::DiagnosticContext::push_path(path);
    decode_tagged(r)
}

/// Emits `fieldId -> tagged value` pairs in two passes: count, then write.
struct FieldWriter {
    entries: Vec<(u64, Vec<u8>)>,
}

impl FieldWriter {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn put<T: TaggedValue>(&mut self, field: u64, value: Option<&T>) {
        if let Some(value) = value {
            let mut w = Writer::new();
            encode_tagged(value, &mut w);
            self.entries.push((field, w.into_bytes()));
        }
    }

    fn finish(self, w: &mut Writer) {
        w.map(self.entries.len() as u64);
        for (field, encoded) in self.entries {
            w.uint(field);
            w.raw(&encoded);
        }
    }
}
