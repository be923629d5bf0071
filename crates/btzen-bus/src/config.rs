use std::path::PathBuf;
use std::time::Duration;

use crate::message::MAX_MESSAGE_SIZE;

/// Well-known location of the system bus socket.
pub const DEFAULT_SYSTEM_BUS_SOCKET: &str = "/var/run/dbus/system_bus_socket";

/// Environment variable overriding the system bus address.
pub const SYSTEM_BUS_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// Connection settings for the system bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Unix socket of the bus daemon.
    pub socket_path: PathBuf,

    /// Timeout applied to calls that do not name their own. Default: 5s.
    pub call_timeout: Duration,

    /// Largest message accepted from the bus. Default: 128 MiB.
    pub max_message_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SYSTEM_BUS_SOCKET),
            call_timeout: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl BusConfig {
    /// Defaults, with the socket taken from `DBUS_SYSTEM_BUS_ADDRESS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var(SYSTEM_BUS_ADDRESS_ENV)
            .ok()
            .as_deref()
            .and_then(parse_unix_path)
        {
            config.socket_path = path;
        }
        config
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// First `unix:path=...` entry of a bus address list.
///
/// Other transports (`tcp:`, `unix:abstract=`) are not supported and are
/// skipped.
pub fn parse_unix_path(address: &str) -> Option<PathBuf> {
    address.split(';').find_map(|entry| {
        let params = entry.strip_prefix("unix:")?;
        params
            .split(',')
            .find_map(|kv| kv.strip_prefix("path="))
            .map(PathBuf::from)
    })
}
