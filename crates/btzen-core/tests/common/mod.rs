// Fake BlueZ daemon on top of the mock bus, shared by the session tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btzen_bus::testing::{MockBus, MockReply};
use btzen_bus::{Connection, SigType, Value, PROPERTIES_INTERFACE};
use btzen_core::{
    CoreError, Device, DeviceState, ReconnectConfig, SERIAL_CREDITS_RX, SERIAL_CREDITS_TX,
    SERIAL_UART_RX, SERIAL_UART_TX, Service, Session, SessionConfig, Trigger, sig_uuid,
};
use bytes::Bytes;

pub const MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const DEVICE_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
pub const DATA_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d";
pub const CONF_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char0010";
pub const TRIGGER_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char0013";
pub const SERIAL_RX_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0020/char0021";
pub const SERIAL_TX_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0020/char0023";
pub const SERIAL_CREDITS_RX_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0020/char0026";
pub const SERIAL_CREDITS_TX_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0020/char0028";

/// TX credits the fake peer grants when credit notifications start.
pub const SERIAL_INITIAL_TX_CREDITS: u8 = 2;

const GATT_CHAR: &str = "org.bluez.GattCharacteristic1";
const DEVICE: &str = "org.bluez.Device1";

pub fn data_uuid() -> uuid::Uuid {
    sig_uuid(0x2a6e)
}

pub fn conf_uuid() -> uuid::Uuid {
    uuid::Uuid::parse_str("f000aa02-0451-4000-b000-000000000000").unwrap()
}

pub fn trigger_uuid() -> uuid::Uuid {
    sig_uuid(0x290d)
}

// ── Devices ─────────────────────────────────────────────────────────

/// Two-byte temperature characteristic.
pub fn temperature(trigger: Trigger) -> Device {
    Device::new(
        MAC.parse().unwrap(),
        Service::Characteristic {
            uuid: sig_uuid(0x181a),
            data: data_uuid(),
            size: Some(2),
        },
    )
    .with_trigger(trigger)
}

pub fn env_sensing(trigger: Trigger) -> Device {
    Device::new(
        MAC.parse().unwrap(),
        Service::EnvSensing {
            uuid: sig_uuid(0x181a),
            data: data_uuid(),
            size: Some(2),
            conf: conf_uuid(),
            trigger: Some(trigger_uuid()),
            config_on: Bytes::from_static(&[0x01]),
            config_off: Bytes::from_static(&[0x00]),
        },
    )
    .with_trigger(trigger)
}

pub fn battery() -> Device {
    Device::new(MAC.parse().unwrap(), Service::battery_level())
}

pub fn serial() -> Device {
    Device::new(MAC.parse().unwrap(), Service::serial())
}

/// Short delays so reconnect paths run within a test.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        call_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        services_resolved_retries: 3,
        characteristic_path_retries: 2,
        retry_delay: Duration::from_millis(20),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_retries: None,
        },
        ..SessionConfig::default()
    }
}

// ── Fake daemon ─────────────────────────────────────────────────────

pub struct FakeBluez {
    pub bus: MockBus,
    pub conn: Connection,
    value: Arc<Mutex<Bytes>>,
    reachable: Arc<AtomicBool>,
}

impl FakeBluez {
    /// Mock bus answering the BlueZ calls of a session with one
    /// reachable sensor at [`MAC`].
    pub async fn start() -> Self {
        let (bus, conn) = MockBus::start().await;
        let value = Arc::new(Mutex::new(Bytes::from_static(&[0x00, 0x00])));
        let reachable = Arc::new(AtomicBool::new(true));

        for (iface, member) in [
            ("org.bluez.GattManager1", "RegisterApplication"),
            ("org.bluez.GattManager1", "UnregisterApplication"),
            ("org.bluez.AgentManager1", "RegisterAgent"),
            ("org.bluez.AgentManager1", "RequestDefaultAgent"),
            ("org.bluez.AgentManager1", "UnregisterAgent"),
            ("org.bluez.Adapter1", "RemoveDevice"),
            (DEVICE, "Connect"),
            (DEVICE, "Disconnect"),
            (GATT_CHAR, "WriteValue"),
            (GATT_CHAR, "StartNotify"),
            (GATT_CHAR, "StopNotify"),
        ] {
            bus.on(iface, member).respond_with(MockReply::empty());
        }

        let online = Arc::clone(&reachable);
        bus.on("org.bluez.Adapter1", "ConnectDevice").respond(move |_, _| {
            if online.load(Ordering::SeqCst) {
                MockReply::empty()
            } else {
                MockReply::error("org.bluez.Error.Failed", "Page Timeout")
            }
        });

        let online = Arc::clone(&reachable);
        bus.on(PROPERTIES_INTERFACE, "Get").respond(move |_, msg| {
            let args = msg.args().unwrap();
            match args[1].as_str().unwrap() {
                "ServicesResolved" => {
                    MockReply::ok([Value::variant(online.load(Ordering::SeqCst))])
                }
                "Percentage" => MockReply::ok([Value::variant(Value::Byte(87))]),
                other => MockReply::error(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    &format!("No such property '{other}'"),
                ),
            }
        });

        bus.on("org.freedesktop.DBus.ObjectManager", "GetManagedObjects")
            .respond_with(MockReply::ok([managed_objects()]));

        let current = Arc::clone(&value);
        bus.on(GATT_CHAR, "ReadValue")
            .at_path(DATA_PATH)
            .respond(move |_, _| MockReply::ok([Value::Bytes(current.lock().unwrap().clone())]));

        // the peer answers with its first TX credits
        bus.on(GATT_CHAR, "StartNotify")
            .at_path(SERIAL_CREDITS_TX_PATH)
            .respond(|bus, _| {
                bus.emit_properties_changed(
                    SERIAL_CREDITS_TX_PATH,
                    GATT_CHAR,
                    vec![("Value", Value::from(vec![SERIAL_INITIAL_TX_CREDITS]))],
                );
                MockReply::empty()
            });

        Self {
            bus,
            conn,
            value,
            reachable,
        }
    }

    pub async fn session(&self, devices: impl IntoIterator<Item = Device>) -> Session {
        self.session_with(test_config(), devices).await
    }

    pub async fn session_with(
        &self,
        config: SessionConfig,
        devices: impl IntoIterator<Item = Device>,
    ) -> Session {
        Session::connect(self.conn.clone(), config, devices).await.unwrap()
    }

    /// Data returned by `ReadValue` from now on.
    pub fn set_value(&self, data: &[u8]) {
        *self.value.lock().unwrap() = Bytes::copy_from_slice(data);
    }

    /// While unreachable, `ConnectDevice` fails and services never
    /// resolve.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// `PropertiesChanged` of `Value` on the data characteristic.
    pub fn notify(&self, data: &[u8]) {
        self.bus
            .emit_properties_changed(DATA_PATH, GATT_CHAR, vec![("Value", Value::from(data))]);
    }

    /// Packet sent by the peer over the serial port.
    pub fn serial_send(&self, data: &[u8]) {
        self.bus
            .emit_properties_changed(SERIAL_TX_PATH, GATT_CHAR, vec![("Value", Value::from(data))]);
    }

    /// TX credits granted by the peer.
    pub fn serial_credits(&self, credits: u8) {
        self.bus.emit_properties_changed(
            SERIAL_CREDITS_TX_PATH,
            GATT_CHAR,
            vec![("Value", Value::from(vec![credits]))],
        );
    }

    /// Paths of `member` calls, in call order.
    pub fn paths(&self, member: &str) -> Vec<String> {
        self.bus
            .calls_to(member)
            .into_iter()
            .filter_map(|m| m.path)
            .collect()
    }

    /// Connection change announced by BlueZ.
    pub fn link(&self, up: bool) {
        self.bus.emit_properties_changed(
            DEVICE_PATH,
            DEVICE,
            vec![("Connected", Value::from(up)), ("ServicesResolved", Value::from(up))],
        );
    }

    /// Payloads of `WriteValue` calls to `path`, in call order.
    pub fn written(&self, path: &str) -> Vec<Vec<u8>> {
        self.bus
            .calls_to("WriteValue")
            .into_iter()
            .filter(|m| m.path.as_deref() == Some(path))
            .map(|m| m.first_arg().unwrap().as_bytes().unwrap().to_vec())
            .collect()
    }

    pub fn count(&self, member: &str) -> usize {
        self.bus.calls_to(member).len()
    }
}

fn interfaces(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict {
        key: SigType::Str,
        value: SigType::parse("a{sv}").unwrap(),
        entries: entries
            .into_iter()
            .map(|(iface, props)| (Value::from(iface), props))
            .collect(),
    }
}

fn characteristic(path: &str, uuid: uuid::Uuid) -> (Value, Value) {
    let props = Value::property_map([
        ("UUID", Value::from(uuid.to_string())),
        ("Flags", Value::str_array(["read", "write", "notify"])),
    ]);
    (Value::object_path(path), interfaces(vec![(GATT_CHAR, props)]))
}

fn managed_objects() -> Value {
    let device = Value::property_map([("Address", Value::from(MAC))]);
    let mut entries: HashMap<&str, (Value, Value)> = HashMap::new();
    entries.insert(DATA_PATH, characteristic(DATA_PATH, data_uuid()));
    entries.insert(CONF_PATH, characteristic(CONF_PATH, conf_uuid()));
    entries.insert(TRIGGER_PATH, characteristic(TRIGGER_PATH, trigger_uuid()));
    entries.insert(SERIAL_RX_PATH, characteristic(SERIAL_RX_PATH, SERIAL_UART_RX));
    entries.insert(SERIAL_TX_PATH, characteristic(SERIAL_TX_PATH, SERIAL_UART_TX));
    entries.insert(
        SERIAL_CREDITS_RX_PATH,
        characteristic(SERIAL_CREDITS_RX_PATH, SERIAL_CREDITS_RX),
    );
    entries.insert(
        SERIAL_CREDITS_TX_PATH,
        characteristic(SERIAL_CREDITS_TX_PATH, SERIAL_CREDITS_TX),
    );
    let mut entries: Vec<_> = entries.into_values().collect();
    entries.push((Value::object_path(DEVICE_PATH), interfaces(vec![(DEVICE, device)])));
    Value::Dict {
        key: SigType::ObjectPath,
        value: SigType::parse("a{sa{sv}}").unwrap(),
        entries,
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(3);

pub async fn connected(session: &Session, device: &Device) {
    tokio::time::timeout(WAIT, session.wait_connected(device))
        .await
        .expect("device never connected")
        .unwrap();
}

pub async fn wait_state(session: &Session, device: &Device, state: DeviceState) {
    tokio::time::timeout(WAIT, async {
        while session.device_state(device).unwrap() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("device never reached {state}"));
}

/// Read until the session reports the device unreachable.
pub async fn connection_error(session: &Session, device: &Device) -> CoreError {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.read(device, None).await {
                Err(e @ CoreError::Connection { .. }) => return e,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("reads never failed")
}

pub async fn wait_calls(fake: &FakeBluez, member: &str, count: usize) {
    tokio::time::timeout(WAIT, async {
        while fake.count(member) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{member} called fewer than {count} times"));
}
