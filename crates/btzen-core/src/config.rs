// ── Session configuration ──
//
// Timeouts, retry bounds and the reconnection policy used by the
// connection manager. Defaults match what BlueZ tolerates in practice.

use std::time::Duration;

use crate::model::AddressType;

/// Exponential backoff for reconnecting a lost device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (zero based).
    ///
    /// Doubles per attempt up to `max_delay`, spread by a deterministic
    /// jitter of up to 25% either way.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(31)).unwrap_or(31);
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
        Duration::from_secs_f64((capped * jitter_factor).max(0.0))
    }

    /// `true` once `attempt` retries have used up the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }
}

/// Settings of one [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bluetooth adapter, e.g. `hci0`.
    pub interface: String,
    /// Address type for devices that do not set their own.
    pub address_type: AddressType,
    /// Timeout of ordinary BlueZ calls.
    pub call_timeout: Duration,
    /// Timeout of `ConnectDevice`; longer than `call_timeout` since BlueZ
    /// creates the device object within the call.
    pub connect_timeout: Duration,
    /// How many times to check `ServicesResolved` after connecting.
    pub services_resolved_retries: u32,
    /// How many times to enumerate GATT objects looking for a
    /// characteristic.
    pub characteristic_path_retries: u32,
    /// Pause between services and characteristic checks.
    pub retry_delay: Duration,
    pub reconnect: ReconnectConfig,
    /// Register a `NoInputNoOutput` pairing agent for the session.
    pub register_agent: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interface: "hci0".into(),
            address_type: AddressType::Public,
            call_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            services_resolved_retries: 10,
            characteristic_path_retries: 5,
            retry_delay: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
            register_agent: false,
        }
    }
}

impl SessionConfig {
    /// Object path of the configured adapter.
    pub fn adapter_path(&self) -> String {
        format!("/org/bluez/{}", self.interface)
    }
}
