// ── Devices ──

use std::fmt;

use strum::Display;

use super::address::{AddressType, MacAddress};
use super::service::{Service, Trigger};

/// One readable data point of a Bluetooth peer.
///
/// Several devices may share a MAC address (temperature and pressure of
/// the same sensor tag); the session connects each peer once and enables
/// all of its devices together. Devices are compared by value, so the
/// same description passed to [`Session::read`](crate::Session::read)
/// finds the registered device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    pub mac: MacAddress,
    /// Falls back to the session default when unset.
    pub address_type: Option<AddressType>,
    pub service: Service,
    pub trigger: Trigger,
}

impl Device {
    pub fn new(mac: MacAddress, service: Service) -> Self {
        Self {
            mac,
            address_type: None,
            service,
            trigger: Trigger::Manual,
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = Some(address_type);
        self
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Service::Characteristic { data, .. } | Service::EnvSensing { data, .. } => {
                write!(f, "{}/{data}", self.mac)
            }
            Service::Interface {
                interface, property, ..
            } => write!(f, "{}/{interface}.{property}", self.mac),
            Service::Serial { .. } => write!(f, "{}/serial", self.mac),
        }
    }
}

/// Connection state of a peer, shared by all of its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    ServicesResolving,
    Connected,
    Disconnecting,
    /// Reconnection attempts are used up; only a reconnect initiated by
    /// BlueZ brings the device back.
    Failed,
}

impl DeviceState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::service::sig_uuid;

    #[test]
    fn display_names_data_point() {
        let mac = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let dev = Device::new(
            mac,
            Service::Characteristic {
                uuid: sig_uuid(0x181a),
                data: sig_uuid(0x2a6e),
                size: Some(2),
            },
        );
        assert_eq!(
            dev.to_string(),
            "AA:BB:CC:DD:EE:FF/00002a6e-0000-1000-8000-00805f9b34fb"
        );

        let battery = Device::new(mac, Service::battery_level());
        assert_eq!(battery.to_string(), "AA:BB:CC:DD:EE:FF/org.bluez.Battery1.Percentage");
    }

    #[test]
    fn builder_sets_policy() {
        let mac = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let dev = Device::new(mac, Service::battery_level())
            .with_trigger(Trigger::OnChange)
            .with_address_type(AddressType::Random);
        assert_eq!(dev.trigger, Trigger::OnChange);
        assert_eq!(dev.address_type, Some(AddressType::Random));
        assert_eq!(DeviceState::ServicesResolving.to_string(), "ServicesResolving");
    }
}
