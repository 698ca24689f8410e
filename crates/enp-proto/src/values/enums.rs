//! Closed wire enums.
//!
//! Discriminants are part of the wire contract. `from_u8` is total and
//! returns `None` for unknown values; how an unknown discriminant is
//! handled depends on the containing value (mixes skip the entry with a
//! warning, isolation state fails the decode).

/// Origin of produced or stored energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EnergySource {
    /// Grid-scale wind
    Wind = 0x01,
    /// Grid-scale solar
    Solar = 0x02,
    /// Hydroelectric
    Hydro = 0x03,
    /// Nuclear
    Nuclear = 0x04,
    /// Natural gas
    Gas = 0x05,
    /// Oil
    Oil = 0x06,
    /// Coal
    Coal = 0x07,
    /// Behind-the-meter wind
    LocalWind = 0x08,
    /// Behind-the-meter solar
    LocalSolar = 0x09,
}

impl EnergySource {
    /// Wire discriminant.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire discriminant; `None` for unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Wind),
            0x02 => Some(Self::Solar),
            0x03 => Some(Self::Hydro),
            0x04 => Some(Self::Nuclear),
            0x05 => Some(Self::Gas),
            0x06 => Some(Self::Oil),
            0x07 => Some(Self::Coal),
            0x08 => Some(Self::LocalWind),
            0x09 => Some(Self::LocalSolar),
            _ => None,
        }
    }
}

/// Result of an isolation (insulation resistance) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum IsolationStatus {
    /// No measurement available
    #[default]
    Unknown = 0x00,
    /// Isolation resistance is healthy
    Ok = 0x01,
    /// Resistance is degraded but within limits
    Warning = 0x02,
    /// Resistance is below the safe threshold
    Fault = 0x03,
}

impl IsolationStatus {
    /// Wire discriminant.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire discriminant; `None` for unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Unknown),
            0x01 => Some(Self::Ok),
            0x02 => Some(Self::Warning),
            0x03 => Some(Self::Fault),
            _ => None,
        }
    }
}
