//! Configuration files for btzen sessions.
//!
//! A TOML file (`~/.config/btzen/config.toml` on Linux) holds session
//! defaults and the device list; `BTZEN_` environment variables override
//! single values, with `__` separating nested keys
//! (`BTZEN_DEFAULTS__INTERFACE=hci1`). The serde types here mirror the
//! file; [`Config::session_config`] and [`Config::devices`] validate them
//! into `btzen_core` types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use btzen_core::{
    AddressType, Device, MacAddress, ReconnectConfig, Service, SessionConfig, Trigger, sig_uuid,
};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl ToString) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.to_string(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Session defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Devices to read, in session order.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_interface")]
    pub interface: String,

    /// `public` or `random`.
    #[serde(default = "default_address_type")]
    pub address_type: String,

    /// Seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,

    /// Seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_services_resolved_retries")]
    pub services_resolved_retries: u32,

    #[serde(default = "default_characteristic_path_retries")]
    pub characteristic_path_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub register_agent: bool,

    #[serde(default)]
    pub reconnect: Reconnect,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            address_type: default_address_type(),
            call_timeout: default_call_timeout(),
            connect_timeout: default_connect_timeout(),
            services_resolved_retries: default_services_resolved_retries(),
            characteristic_path_retries: default_characteristic_path_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            register_agent: false,
            reconnect: Reconnect::default(),
        }
    }
}

fn default_interface() -> String {
    "hci0".into()
}
fn default_address_type() -> String {
    "public".into()
}
fn default_call_timeout() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_services_resolved_retries() -> u32 {
    10
}
fn default_characteristic_path_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1000
}

/// Reconnection backoff.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reconnect {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Unset means retry forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: None,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// Label used in error messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub mac: String,

    /// Overrides `defaults.address_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,

    #[serde(flatten)]
    pub service: ServiceEntry,

    #[serde(default)]
    pub trigger: TriggerEntry,

    /// Period of an `interval` trigger, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

/// Service kind, selected by the `kind` key. UUIDs are either full
/// UUIDs or 16-bit Bluetooth SIG numbers in hex (`"2a6e"`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceEntry {
    Characteristic {
        service: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
    },
    EnvSensing {
        service: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
        conf: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_characteristic: Option<String>,
        #[serde(default = "default_config_on")]
        config_on: Vec<u8>,
        #[serde(default = "default_config_off")]
        config_off: Vec<u8>,
    },
    Interface {
        service: String,
        interface: String,
        property: String,
    },
    /// `Battery1.Percentage`.
    Battery,
    /// Terminal I/O serial port; `service` overrides the usual `fefb`.
    Serial {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
}

fn default_config_on() -> Vec<u8> {
    vec![0x01]
}
fn default_config_off() -> Vec<u8> {
    vec![0x00]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEntry {
    #[default]
    Manual,
    OnChange,
    Interval,
}

// ── Translation to core types ───────────────────────────────────────

impl Defaults {
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        if self.interface.is_empty() {
            return Err(invalid("interface", "must not be empty"));
        }
        if self.call_timeout == 0 {
            return Err(invalid("call_timeout", "must be at least one second"));
        }
        let reconnect = &self.reconnect;
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(invalid(
                "reconnect.max_delay_ms",
                format!(
                    "{} is below initial_delay_ms {}",
                    reconnect.max_delay_ms, reconnect.initial_delay_ms
                ),
            ));
        }

        Ok(SessionConfig {
            interface: self.interface.clone(),
            address_type: parse_address_type("address_type", &self.address_type)?,
            call_timeout: Duration::from_secs(self.call_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            services_resolved_retries: self.services_resolved_retries,
            characteristic_path_retries: self.characteristic_path_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(reconnect.max_delay_ms),
                max_retries: reconnect.max_retries,
            },
            register_agent: self.register_agent,
        })
    }
}

impl DeviceEntry {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.mac)
    }

    pub fn to_device(&self) -> Result<Device, ConfigError> {
        let label = self.label();
        let field = |name: &str| format!("devices.{label}.{name}");

        let mac = MacAddress::from_str(&self.mac).map_err(|e| invalid(field("mac"), e))?;
        let service = match &self.service {
            ServiceEntry::Characteristic { service, data, size } => Service::Characteristic {
                uuid: parse_uuid(&field("service"), service)?,
                data: parse_uuid(&field("data"), data)?,
                size: *size,
            },
            ServiceEntry::EnvSensing {
                service,
                data,
                size,
                conf,
                trigger_characteristic,
                config_on,
                config_off,
            } => Service::EnvSensing {
                uuid: parse_uuid(&field("service"), service)?,
                data: parse_uuid(&field("data"), data)?,
                size: *size,
                conf: parse_uuid(&field("conf"), conf)?,
                trigger: trigger_characteristic
                    .as_deref()
                    .map(|t| parse_uuid(&field("trigger_characteristic"), t))
                    .transpose()?,
                config_on: config_on.clone().into(),
                config_off: config_off.clone().into(),
            },
            ServiceEntry::Interface {
                service,
                interface,
                property,
            } => Service::Interface {
                uuid: parse_uuid(&field("service"), service)?,
                interface: interface.clone(),
                property: property.clone(),
            },
            ServiceEntry::Battery => Service::battery_level(),
            ServiceEntry::Serial { service: None } => Service::serial(),
            ServiceEntry::Serial { service: Some(service) } => Service::Serial {
                uuid: parse_uuid(&field("service"), service)?,
            },
        };
        if matches!(service, Service::Serial { .. }) && self.trigger != TriggerEntry::Manual {
            return Err(invalid(field("trigger"), "serial ports are read on demand"));
        }

        let trigger = match (self.trigger, self.interval) {
            (TriggerEntry::Manual, _) => Trigger::Manual,
            (TriggerEntry::OnChange, _) => Trigger::OnChange,
            (TriggerEntry::Interval, Some(secs)) => {
                let period = Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|p| !p.is_zero())
                    .ok_or_else(|| invalid(field("interval"), format!("{secs} is not a positive period")))?;
                Trigger::Interval(period)
            }
            (TriggerEntry::Interval, None) => {
                return Err(invalid(field("interval"), "required by the interval trigger"));
            }
        };

        let mut device = Device::new(mac, service).with_trigger(trigger);
        if let Some(address_type) = &self.address_type {
            device = device.with_address_type(parse_address_type(&field("address_type"), address_type)?);
        }
        Ok(device)
    }
}

impl Config {
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.defaults.to_session_config()
    }

    pub fn devices(&self) -> Result<Vec<Device>, ConfigError> {
        self.devices.iter().map(DeviceEntry::to_device).collect()
    }
}

fn parse_address_type(field: &str, text: &str) -> Result<AddressType, ConfigError> {
    AddressType::from_str(text)
        .map_err(|_| invalid(field, format!("expected 'public' or 'random', got '{text}'")))
}

/// Full UUID, or a 16-bit SIG number given as four hex digits.
fn parse_uuid(field: &str, text: &str) -> Result<Uuid, ConfigError> {
    let short = text.strip_prefix("0x").unwrap_or(text);
    if short.len() == 4 && short.bytes().all(|b| b.is_ascii_hexdigit()) {
        return u16::from_str_radix(short, 16)
            .map(sig_uuid)
            .map_err(|e| invalid(field, e));
    }
    Uuid::parse_str(text).map_err(|e| invalid(field, format!("'{text}': {e}")))
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "btzen", "btzen").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("btzen");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path` (skipped when missing), then
/// `BTZEN_` environment variables.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("BTZEN_").split("__"))
}

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
