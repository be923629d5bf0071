// ── Device addressing ──

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};

use crate::error::CoreError;

/// Bluetooth device address, kept as six bytes and shown in the
/// canonical upper-case colon form (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Segment BlueZ uses in device object paths (`dev_AA_BB_CC_DD_EE_FF`).
    pub fn path_segment(&self) -> String {
        format!("dev_{}", self.to_string().replace(':', "_"))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    /// Accepts colon, dash or underscore separators in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::Configuration {
            message: format!("invalid Bluetooth address '{s}'"),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-', '_']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

/// Address type passed to `Adapter1.ConnectDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}
