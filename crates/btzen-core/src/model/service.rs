// ── Services and trigger policies ──
//
// A closed set of service kinds. Each kind decides how a device is
// enabled, read and written; the connection manager and session match
// on it instead of looking behaviour up at runtime.

use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

/// Build a full UUID from a 16-bit Bluetooth SIG assigned number.
pub const fn sig_uuid(short: u16) -> Uuid {
    let [hi, lo] = short.to_be_bytes();
    Uuid::from_bytes([
        0x00, 0x00, hi, lo, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
    ])
}

/// Battery Service.
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180f);

/// Environmental Sensing Service.
pub const ENV_SENSING_SERVICE: Uuid = sig_uuid(0x181a);

/// Terminal I/O serial port service (Telit/Stollmann TIO).
pub const SERIAL_SERVICE: Uuid = sig_uuid(0xfefb);

/// Serial data written by the host.
pub const SERIAL_UART_RX: Uuid = Uuid::from_u128(0x0000_0001_0000_1000_8000_0080_2500_0000);
/// Serial data sent by the peer, as notifications.
pub const SERIAL_UART_TX: Uuid = Uuid::from_u128(0x0000_0002_0000_1000_8000_0080_2500_0000);
/// Credits granted by the host for packets the peer may send.
pub const SERIAL_CREDITS_RX: Uuid = Uuid::from_u128(0x0000_0003_0000_1000_8000_0080_2500_0000);
/// Credits granted by the peer for packets the host may write.
pub const SERIAL_CREDITS_TX: Uuid = Uuid::from_u128(0x0000_0004_0000_1000_8000_0080_2500_0000);

/// What a device reads from, and how it is switched on and off.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Service {
    /// Plain GATT characteristic.
    Characteristic {
        /// Service the characteristic belongs to.
        uuid: Uuid,
        /// Characteristic holding the data.
        data: Uuid,
        /// Expected length of a read, if fixed.
        size: Option<usize>,
    },

    /// Environmental Sensing characteristic with a configuration
    /// characteristic, switched on with `config_on` when the device is
    /// enabled and off with `config_off` when it is disabled.
    EnvSensing {
        uuid: Uuid,
        data: Uuid,
        size: Option<usize>,
        conf: Uuid,
        /// Trigger setting characteristic, written for interval triggers.
        trigger: Option<Uuid>,
        config_on: Bytes,
        config_off: Bytes,
    },

    /// Property of a BlueZ device interface, e.g. `Battery1.Percentage`.
    Interface {
        uuid: Uuid,
        interface: String,
        property: String,
    },

    /// Byte stream over a GATT serial port with credit based flow
    /// control. Reads and writes go through the port, whatever the
    /// trigger.
    Serial { uuid: Uuid },
}

impl Service {
    /// Battery level, as exposed by BlueZ on `org.bluez.Battery1`.
    pub fn battery_level() -> Self {
        Self::Interface {
            uuid: BATTERY_SERVICE,
            interface: "org.bluez.Battery1".into(),
            property: "Percentage".into(),
        }
    }

    pub fn serial() -> Self {
        Self::Serial { uuid: SERIAL_SERVICE }
    }

    /// Service UUID, advertised through the GATT profile.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Characteristic { uuid, .. }
            | Self::EnvSensing { uuid, .. }
            | Self::Interface { uuid, .. }
            | Self::Serial { uuid } => *uuid,
        }
    }

    /// Characteristic holding the device data; `None` for interface
    /// properties.
    pub fn data_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Characteristic { data, .. } | Self::EnvSensing { data, .. } => Some(*data),
            Self::Serial { .. } => Some(SERIAL_UART_TX),
            Self::Interface { .. } => None,
        }
    }

    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Characteristic { size, .. } | Self::EnvSensing { size, .. } => *size,
            Self::Interface { .. } | Self::Serial { .. } => None,
        }
    }

    /// Every characteristic path the device needs resolved.
    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        match self {
            Self::Characteristic { data, .. } => vec![*data],
            Self::EnvSensing {
                data,
                conf,
                trigger,
                ..
            } => [Some(*data), Some(*conf), *trigger]
                .into_iter()
                .flatten()
                .collect(),
            Self::Interface { .. } => Vec::new(),
            Self::Serial { .. } => vec![
                SERIAL_UART_RX,
                SERIAL_UART_TX,
                SERIAL_CREDITS_RX,
                SERIAL_CREDITS_TX,
            ],
        }
    }
}

/// When a new value is surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Trigger {
    /// The caller reads on demand.
    #[default]
    Manual,
    /// Values come from change notifications.
    OnChange,
    /// At most one value per period.
    Interval(Duration),
}

/// Environmental Sensing trigger condition: fixed time interval.
const CONDITION_FIXED_TIME: u8 = 0x01;

/// Environmental Sensing trigger condition: value changed.
const CONDITION_ON_CHANGE: u8 = 0x04;

impl Trigger {
    /// Whether the device is read through notifications.
    pub fn is_notifying(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Environmental Sensing trigger setting for this policy: the
    /// condition byte, followed by the period in seconds as a 24-bit
    /// little-endian integer for interval triggers.
    pub fn env_sensing_setting(&self) -> Option<Bytes> {
        match self {
            Self::Manual => None,
            Self::OnChange => Some(Bytes::from_static(&[CONDITION_ON_CHANGE])),
            Self::Interval(period) => {
                let secs = u32::try_from(period.as_secs().min(0x00ff_ffff)).unwrap_or(0x00ff_ffff);
                let [b0, b1, b2, _] = secs.to_le_bytes();
                Some(Bytes::copy_from_slice(&[CONDITION_FIXED_TIME, b0, b1, b2]))
            }
        }
    }
}
