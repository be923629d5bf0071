//! Bluetooth Low Energy device sessions over the BlueZ D-Bus API.
//!
//! This crate turns a list of [`Device`] descriptions into a running
//! [`Session`]:
//!
//! - **[`Session`]** — Registers a GATT profile with BlueZ so the daemon
//!   reconnects managed peers on its own, then spawns one manager task
//!   per peer. [`read()`](Session::read) / [`write()`](Session::write)
//!   operate on single values, [`read_all()`](Session::read_all) and
//!   [`notify()`](Session::notify) yield infinite streams that survive
//!   disconnections.
//!
//! - **Connection manager** — Per-peer state machine
//!   (`Disconnected → Connecting → ServicesResolving → Connected`)
//!   observable through [`Session::state`]. Link loss cancels in-flight
//!   reads with [`CoreError::Connection`]; reconnects follow
//!   [`ReconnectConfig`] backoff.
//!
//! - **Domain model** ([`model`]) — [`MacAddress`], the closed set of
//!   [`Service`] kinds (GATT characteristic, Environmental Sensing
//!   characteristic, BlueZ interface property, credit based serial port)
//!   and [`Trigger`] policies.

pub mod agent;
pub mod bluez;
pub mod config;
pub mod error;
mod manager;
pub mod model;
pub mod profile;
mod serial;
pub mod session;
mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ReconnectConfig, SessionConfig};
pub use error::CoreError;
pub use model::{
    AddressType, BATTERY_SERVICE, Device, DeviceState, ENV_SENSING_SERVICE, MacAddress,
    SERIAL_CREDITS_RX, SERIAL_CREDITS_TX, SERIAL_SERVICE, SERIAL_UART_RX, SERIAL_UART_TX, Service,
    Trigger, sig_uuid,
};
pub use session::Session;

// Bus types consumers need to open a session.
pub use btzen_bus::{BusConfig, Connection};
