// ── BlueZ proxy ──
//
// Typed wrappers over the BlueZ D-Bus surface the session uses. Every
// method is one bus call; retries and state live in the manager.

use std::collections::HashMap;
use std::time::Duration;

use btzen_bus::object::OBJECT_MANAGER_INTERFACE;
use btzen_bus::{Connection, Error, Result, Value};
use bytes::Bytes;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::model::{AddressType, MacAddress};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";

const ERROR_ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";

/// BlueZ calls scoped to one adapter.
#[derive(Debug, Clone)]
pub struct Bluez {
    conn: Connection,
    adapter: String,
    call_timeout: Duration,
    connect_timeout: Duration,
}

impl Bluez {
    pub fn new(conn: Connection, config: &SessionConfig) -> Self {
        Self {
            conn,
            adapter: config.adapter_path(),
            call_timeout: config.call_timeout,
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn adapter_path(&self) -> &str {
        &self.adapter
    }

    pub fn device_path(&self, mac: &MacAddress) -> String {
        format!("{}/{}", self.adapter, mac.path_segment())
    }

    async fn call(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: impl IntoIterator<Item = Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        self.conn
            .call_method(BLUEZ_SERVICE, path, interface, member, args, Some(timeout))
            .await
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Connect with `Adapter1.ConnectDevice`, or `Device1.Connect` when
    /// BlueZ already knows the device.
    pub async fn connect_device(&self, mac: &MacAddress, address_type: AddressType) -> Result<()> {
        let filter = Value::property_map([
            ("Address", Value::from(mac.to_string())),
            ("AddressType", Value::from(address_type.to_string())),
        ]);
        match self
            .call(&self.adapter, ADAPTER_INTERFACE, "ConnectDevice", [filter], self.connect_timeout)
            .await
        {
            Err(e) if e.error_name() == Some(ERROR_ALREADY_EXISTS) => {
                tracing::debug!(mac = %mac, "device known to BlueZ, using Device1.Connect");
                let path = self.device_path(mac);
                self.call(&path, DEVICE_INTERFACE, "Connect", [], self.connect_timeout)
                    .await
                    .map(drop)
            }
            other => other.map(drop),
        }
    }

    pub async fn disconnect_device(&self, mac: &MacAddress) -> Result<()> {
        let path = self.device_path(mac);
        self.call(&path, DEVICE_INTERFACE, "Disconnect", [], self.call_timeout)
            .await
            .map(drop)
    }

    pub async fn remove_device(&self, mac: &MacAddress) -> Result<()> {
        let device = Value::object_path(self.device_path(mac));
        self.call(&self.adapter, ADAPTER_INTERFACE, "RemoveDevice", [device], self.call_timeout)
            .await
            .map(drop)
    }

    pub async fn services_resolved(&self, mac: &MacAddress) -> Result<bool> {
        let path = self.device_path(mac);
        let value = self
            .conn
            .get_property(BLUEZ_SERVICE, &path, DEVICE_INTERFACE, "ServicesResolved")
            .await?;
        value
            .as_bool()
            .ok_or_else(|| Error::Protocol(format!("ServicesResolved is not a boolean: {value:?}")))
    }

    /// Property of a device interface other than `Device1`.
    pub async fn device_property(&self, mac: &MacAddress, interface: &str, name: &str) -> Result<Value> {
        let path = self.device_path(mac);
        self.conn.get_property(BLUEZ_SERVICE, &path, interface, name).await
    }

    // ── GATT characteristics ─────────────────────────────────────────

    pub async fn read_value(&self, path: &str) -> Result<Bytes> {
        let reply = self
            .call(
                path,
                GATT_CHARACTERISTIC_INTERFACE,
                "ReadValue",
                [Value::empty_options()],
                self.call_timeout,
            )
            .await?;
        reply
            .first()
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::Protocol(format!("ReadValue of {path} returned no bytes")))
    }

    pub async fn write_value(&self, path: &str, data: Bytes) -> Result<()> {
        self.call(
            path,
            GATT_CHARACTERISTIC_INTERFACE,
            "WriteValue",
            [Value::Bytes(data), Value::empty_options()],
            self.call_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn start_notify(&self, path: &str) -> Result<()> {
        self.call(path, GATT_CHARACTERISTIC_INTERFACE, "StartNotify", [], self.call_timeout)
            .await
            .map(drop)
    }

    pub async fn stop_notify(&self, path: &str) -> Result<()> {
        self.call(path, GATT_CHARACTERISTIC_INTERFACE, "StopNotify", [], self.call_timeout)
            .await
            .map(drop)
    }

    /// Map characteristic UUID to object path for every characteristic
    /// under the device `mac`.
    pub async fn characteristic_paths(&self, mac: &MacAddress) -> Result<HashMap<Uuid, String>> {
        let reply = self
            .call("/", OBJECT_MANAGER_INTERFACE, "GetManagedObjects", [], self.call_timeout)
            .await?;
        let objects = reply
            .first()
            .ok_or_else(|| Error::Protocol("GetManagedObjects returned nothing".into()))?;
        let prefix = format!("{}/", self.device_path(mac));
        Ok(characteristics_under(objects, &prefix))
    }

    // ── Application and agent registration ───────────────────────────

    pub async fn register_application(&self, root: &str) -> Result<()> {
        self.call(
            &self.adapter,
            GATT_MANAGER_INTERFACE,
            "RegisterApplication",
            [Value::object_path(root), Value::empty_options()],
            self.call_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn unregister_application(&self, root: &str) -> Result<()> {
        self.call(
            &self.adapter,
            GATT_MANAGER_INTERFACE,
            "UnregisterApplication",
            [Value::object_path(root)],
            self.call_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn register_agent(&self, path: &str, capability: &str) -> Result<()> {
        self.call(
            "/org/bluez",
            AGENT_MANAGER_INTERFACE,
            "RegisterAgent",
            [Value::object_path(path), Value::from(capability)],
            self.call_timeout,
        )
        .await?;
        self.call(
            "/org/bluez",
            AGENT_MANAGER_INTERFACE,
            "RequestDefaultAgent",
            [Value::object_path(path)],
            self.call_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn unregister_agent(&self, path: &str) -> Result<()> {
        self.call(
            "/org/bluez",
            AGENT_MANAGER_INTERFACE,
            "UnregisterAgent",
            [Value::object_path(path)],
            self.call_timeout,
        )
        .await
        .map(drop)
    }
}

/// Pick `GattCharacteristic1` objects below `prefix` out of a
/// `GetManagedObjects` reply. Objects without a parseable UUID are
/// skipped.
fn characteristics_under(objects: &Value, prefix: &str) -> HashMap<Uuid, String> {
    let Some(entries) = objects.as_dict() else {
        return HashMap::new();
    };
    entries
        .iter()
        .filter_map(|(path, interfaces)| {
            let path = path.as_str()?;
            if !path.starts_with(prefix) {
                return None;
            }
            let props = interfaces.dict_get(GATT_CHARACTERISTIC_INTERFACE)?;
            let uuid = props.dict_get("UUID")?.as_str()?;
            let uuid = Uuid::parse_str(uuid).ok()?;
            Some((uuid, path.to_owned()))
        })
        .collect()
}
