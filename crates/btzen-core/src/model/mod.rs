// ── Domain model ──
//
// Addresses, service kinds, trigger policies and devices. Plain data;
// the session owns everything that talks to the bus.

pub mod address;
pub mod device;
pub mod service;

pub use address::{AddressType, MacAddress};
pub use device::{Device, DeviceState};
pub use service::{
    BATTERY_SERVICE, ENV_SENSING_SERVICE, SERIAL_CREDITS_RX, SERIAL_CREDITS_TX, SERIAL_SERVICE,
    SERIAL_UART_RX, SERIAL_UART_TX, Service, Trigger, sig_uuid,
};
