// ── Connection manager ──
//
// One background task per peer (MAC address). The task drives the peer
// through Disconnected → Connecting → ServicesResolving → Connected,
// enables every device of the peer once its services are resolved, and
// tears the devices down again when the link drops. Reconnection is
// either initiated by BlueZ (the registered GATT profile makes BlueZ
// auto-connect known devices) or by the task itself after a backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use btzen_bus::{NotificationHandle, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bluez::{Bluez, DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE};
use crate::config::SessionConfig;
use crate::error::{CoreError, write_error};
use crate::model::{
    AddressType, Device, DeviceState, MacAddress, SERIAL_CREDITS_RX, SERIAL_CREDITS_TX,
    SERIAL_UART_RX, SERIAL_UART_TX, Service,
};
use crate::serial::{SerialPaths, SerialPort};

/// Properties of `Device1` the manager follows.
const LINK_PROPERTIES: [&str; 2] = ["Connected", "ServicesResolved"];

/// Property carrying characteristic data.
pub(crate) const VALUE_PROPERTY: &str = "Value";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Per-device state ─────────────────────────────────────────────────

/// Resources of an enabled device, valid for one connection.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    /// Object path of the data characteristic; `None` for interface
    /// properties.
    pub(crate) data_path: Option<String>,
    /// Cancelled when the connection drops or the session closes.
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct DeviceSlot {
    pub(crate) device: Device,
    link: Mutex<Option<Link>>,
    notifications: tokio::sync::Mutex<Option<NotificationHandle>>,
    serial: Mutex<Option<Arc<SerialPort>>>,
}

impl DeviceSlot {
    pub(crate) fn new(device: Device) -> Self {
        Self {
            device,
            link: Mutex::new(None),
            notifications: tokio::sync::Mutex::new(None),
            serial: Mutex::new(None),
        }
    }

    /// Current link, `None` while the device is not enabled.
    pub(crate) fn link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    pub(crate) fn notifications(&self) -> &tokio::sync::Mutex<Option<NotificationHandle>> {
        &self.notifications
    }

    /// Open serial port, `None` while the device is not enabled.
    pub(crate) fn serial(&self) -> Option<Arc<SerialPort>> {
        lock(&self.serial).clone()
    }

    /// Property whose change notifications carry this device's data.
    pub(crate) fn notified_property(&self) -> &str {
        match &self.device.service {
            Service::Interface { property, .. } => property,
            Service::Characteristic { .. } | Service::EnvSensing { .. } | Service::Serial { .. } => {
                VALUE_PROPERTY
            }
        }
    }
}

// ── Per-peer state ───────────────────────────────────────────────────

/// A Bluetooth peer and the devices read from it.
pub(crate) struct Peer {
    pub(crate) mac: MacAddress,
    pub(crate) address_type: AddressType,
    pub(crate) devices: Vec<Arc<DeviceSlot>>,
    state: watch::Sender<DeviceState>,
    /// Characteristic UUID → object path, valid for one connection.
    paths: Mutex<HashMap<Uuid, String>>,
    /// Token shared by the links of the current connection.
    link_cancel: Mutex<Option<CancellationToken>>,
    last_error: Mutex<Option<String>>,
}

impl Peer {
    pub(crate) fn new(mac: MacAddress, address_type: AddressType) -> Self {
        let (state, _) = watch::channel(DeviceState::Disconnected);
        Self {
            mac,
            address_type,
            devices: Vec::new(),
            state,
            paths: Mutex::new(HashMap::new()),
            link_cancel: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: DeviceState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(mac = %self.mac, from = %previous, to = %state, "device state changed");
        }
    }

    /// Error reported to readers of a device that is not connected.
    pub(crate) fn disconnected_error(&self) -> CoreError {
        match (self.state(), lock(&self.last_error).as_deref()) {
            (DeviceState::Failed, Some(reason)) => CoreError::connection(self.mac, reason),
            _ => CoreError::connection(self.mac, "device disconnected"),
        }
    }

    fn characteristic_path(&self, uuid: &Uuid) -> Result<String, CoreError> {
        lock(&self.paths)
            .get(uuid)
            .cloned()
            .ok_or_else(|| CoreError::Configuration {
                message: format!("characteristic {uuid} not found for {}", self.mac),
            })
    }
}

// ── Peer task ────────────────────────────────────────────────────────

/// Drives one peer until the session is cancelled.
pub(crate) struct PeerTask {
    pub(crate) bluez: Bluez,
    pub(crate) config: SessionConfig,
    pub(crate) peer: Arc<Peer>,
    pub(crate) cancel: CancellationToken,
}

impl PeerTask {
    pub(crate) async fn run(self) {
        let mac = self.peer.mac;
        if let Some(mut events) = self.watch_link().await {
            self.manage(&mut events).await;
            self.release().await;
            if let Err(e) = events.unsubscribe().await {
                tracing::debug!(mac = %mac, error = %e, "cannot remove device match rule");
            }
        } else {
            self.release().await;
        }
        tracing::debug!(mac = %mac, "peer task exiting");
    }

    /// Subscribe to `Device1` link properties, retrying while the bus is
    /// up. `None` once the session is cancelled or the bus is gone.
    async fn watch_link(&self) -> Option<NotificationHandle> {
        let path = self.bluez.device_path(&self.peer.mac);
        let conn = self.bluez.connection();
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                r = conn.subscribe(&path, DEVICE_INTERFACE, &LINK_PROPERTIES) => r,
            };
            match result {
                Ok(handle) => return Some(handle),
                Err(e) if conn.is_closed() => {
                    self.fail(&e.to_string());
                    return None;
                }
                Err(e) => {
                    tracing::warn!(mac = %self.peer.mac, error = %e, attempt, "cannot watch device");
                    let delay = self.config.reconnect.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connection loop; returns when the session is cancelled or the bus
    /// connection is lost.
    async fn manage(&self, events: &mut NotificationHandle) {
        let mac = self.peer.mac;
        let reconnect = &self.config.reconnect;
        let mut attempt: u32 = 0;
        let mut dial = true;

        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                r = self.establish(events, dial) => r,
            };

            match result {
                Ok(()) => {
                    attempt = 0;
                    self.peer.set_state(DeviceState::Connected);
                    tracing::info!(mac = %mac, "device connected");

                    let reason = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        reason = link_lost(events) => reason,
                    };
                    self.peer.set_state(DeviceState::Disconnected);
                    tracing::info!(mac = %mac, reason = %reason, "device disconnected");
                    self.disable_all().await;
                }
                Err(e) => {
                    self.disable_all().await;
                    if self.bluez.connection().is_closed() {
                        tracing::error!(mac = %mac, error = %e, "bus connection lost");
                        self.fail(&failure_reason(&e));
                        return;
                    }
                    if reconnect.exhausted(attempt) {
                        tracing::error!(
                            mac = %mac,
                            error = %e,
                            attempts = attempt,
                            "reconnection limit reached, waiting for BlueZ"
                        );
                        self.fail(&failure_reason(&e));
                        tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => return,
                            () = link_up(events) => {}
                        }
                        attempt = 0;
                        dial = false;
                        continue;
                    }
                    tracing::warn!(mac = %mac, error = %e, attempt, "cannot connect device");
                    self.peer.set_state(DeviceState::Disconnected);
                }
            }

            // BlueZ may bring the device back before the backoff elapses
            let delay = reconnect.backoff(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!(
                mac = %mac,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "waiting before reconnect"
            );
            dial = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = link_up(events) => false,
                () = tokio::time::sleep(delay) => true,
            };
        }
    }

    /// Connect (when `dial` is set), wait for resolved services and
    /// enable every device of the peer.
    async fn establish(&self, events: &mut NotificationHandle, dial: bool) -> Result<(), CoreError> {
        let mac = self.peer.mac;
        self.peer.set_state(DeviceState::Connecting);
        for name in LINK_PROPERTIES {
            let _ = events.latest(name);
        }

        if dial {
            tracing::debug!(mac = %mac, address_type = %self.peer.address_type, "connecting");
            self.bluez
                .connect_device(&mac, self.peer.address_type)
                .await
                .map_err(|e| CoreError::connection(mac, e))?;
        }

        self.peer.set_state(DeviceState::ServicesResolving);
        self.wait_services_resolved(events).await?;
        self.resolve_paths().await?;
        self.enable_all().await
    }

    async fn wait_services_resolved(&self, events: &mut NotificationHandle) -> Result<(), CoreError> {
        let mac = self.peer.mac;
        for attempt in 0..self.config.services_resolved_retries {
            let resolved = self
                .bluez
                .services_resolved(&mac)
                .await
                .map_err(|e| CoreError::connection(mac, e))?;
            if resolved {
                tracing::debug!(mac = %mac, "services resolved");
                return Ok(());
            }
            tracing::debug!(mac = %mac, attempt, "services not resolved yet");
            let _ = tokio::time::timeout(self.config.retry_delay, services_signalled(events)).await;
        }
        Err(CoreError::connection(mac, "services not resolved"))
    }

    /// Enumerate GATT objects until every characteristic the devices
    /// need is found, and cache the paths for this connection.
    async fn resolve_paths(&self) -> Result<(), CoreError> {
        let mac = self.peer.mac;
        let wanted: Vec<Uuid> = self
            .peer
            .devices
            .iter()
            .flat_map(|slot| slot.device.service.characteristic_uuids())
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let mut missing = wanted.clone();
        for attempt in 0..self.config.characteristic_path_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let found = self.bluez.characteristic_paths(&mac).await?;
            missing = wanted
                .iter()
                .filter(|uuid| !found.contains_key(uuid))
                .copied()
                .collect();
            *lock(&self.peer.paths) = found;
            if missing.is_empty() {
                tracing::debug!(mac = %mac, count = wanted.len(), "characteristic paths resolved");
                return Ok(());
            }
            tracing::debug!(mac = %mac, attempt, ?missing, "characteristics not found yet");
        }

        let missing = missing
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(CoreError::Configuration {
            message: format!("characteristics {missing} not found for {mac}"),
        })
    }

    // ── Enable / disable ─────────────────────────────────────────────

    async fn enable_all(&self) -> Result<(), CoreError> {
        let cancel = self.cancel.child_token();
        *lock(&self.peer.link_cancel) = Some(cancel.clone());
        for slot in &self.peer.devices {
            let data_path = self.enable(slot).await?;
            *lock(&slot.link) = Some(Link {
                data_path,
                cancel: cancel.clone(),
            });
            tracing::debug!(device = %slot.device, "device enabled");
        }
        Ok(())
    }

    /// Configure one device and start its notifications. Returns the
    /// data characteristic path.
    async fn enable(&self, slot: &DeviceSlot) -> Result<Option<String>, CoreError> {
        let device = &slot.device;
        let conn = self.bluez.connection();

        match &device.service {
            Service::Characteristic { data, .. } => {
                let path = self.peer.characteristic_path(data)?;
                if device.trigger.is_notifying() {
                    let handle = self.start_notifications(&path).await?;
                    *slot.notifications.lock().await = Some(handle);
                }
                Ok(Some(path))
            }
            Service::EnvSensing {
                data,
                conf,
                trigger,
                config_on,
                ..
            } => {
                let conf_path = self.peer.characteristic_path(conf)?;
                self.bluez
                    .write_value(&conf_path, config_on.clone())
                    .await
                    .map_err(|e| write_error(device, e))?;

                let setting = device.trigger.env_sensing_setting();
                if let (Some(trigger), Some(setting)) = (trigger, setting) {
                    let trigger_path = self.peer.characteristic_path(trigger)?;
                    self.bluez
                        .write_value(&trigger_path, setting)
                        .await
                        .map_err(|e| write_error(device, e))?;
                }

                let path = self.peer.characteristic_path(data)?;
                if device.trigger.is_notifying() {
                    let handle = self.start_notifications(&path).await?;
                    *slot.notifications.lock().await = Some(handle);
                }
                Ok(Some(path))
            }
            Service::Interface {
                interface,
                property,
                ..
            } => {
                if device.trigger.is_notifying() {
                    let path = self.bluez.device_path(&self.peer.mac);
                    let handle = conn.subscribe(&path, interface, &[property.as_str()]).await?;
                    *slot.notifications.lock().await = Some(handle);
                }
                Ok(None)
            }
            Service::Serial { .. } => {
                let paths = SerialPaths {
                    uart_rx: self.peer.characteristic_path(&SERIAL_UART_RX)?,
                    uart_tx: self.peer.characteristic_path(&SERIAL_UART_TX)?,
                    credits_rx: self.peer.characteristic_path(&SERIAL_CREDITS_RX)?,
                    credits_tx: self.peer.characteristic_path(&SERIAL_CREDITS_TX)?,
                };
                let credits = self.start_notifications(&paths.credits_tx).await?;
                let data = self.start_notifications(&paths.uart_tx).await?;
                let port = SerialPort::open(
                    &self.bluez,
                    device,
                    paths,
                    data,
                    credits,
                    self.config.call_timeout,
                )
                .await?;
                *lock(&slot.serial) = Some(Arc::new(port));
                Ok(None)
            }
        }
    }

    /// Subscribe before `StartNotify` so the first value is not missed.
    async fn start_notifications(&self, path: &str) -> Result<NotificationHandle, CoreError> {
        let conn = self.bluez.connection();
        let handle = conn
            .subscribe(path, GATT_CHARACTERISTIC_INTERFACE, &[VALUE_PROPERTY])
            .await?;
        self.bluez.start_notify(path).await?;
        tracing::info!(path, "notifications enabled");
        Ok(handle)
    }

    /// Wake every reader, then release notifications and switch devices
    /// off. Failures are logged; the device may already be gone.
    async fn disable_all(&self) {
        if let Some(cancel) = lock(&self.peer.link_cancel).take() {
            cancel.cancel();
        }
        for slot in &self.peer.devices {
            let link = lock(&slot.link).take();
            let handle = slot.notifications.lock().await.take();
            self.disable(slot, link, handle).await;
        }
        lock(&self.peer.paths).clear();
    }

    async fn disable(&self, slot: &DeviceSlot, link: Option<Link>, handle: Option<NotificationHandle>) {
        let device = &slot.device;
        let port = lock(&slot.serial).take();
        if let Some(port) = port {
            port.close(&self.bluez, device).await;
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.unsubscribe().await {
                tracing::debug!(device = %device, error = %e, "cannot remove notification match rule");
            }
            let data_path = link.as_ref().and_then(|l| l.data_path.as_deref());
            if let Some(path) = data_path {
                match self.bluez.stop_notify(path).await {
                    Ok(()) => tracing::info!(device = %device, "notifications disabled"),
                    Err(e) => tracing::warn!(device = %device, error = %e, "cannot disable notifications"),
                }
            }
        }

        if let Service::EnvSensing { conf, config_off, .. } = &device.service {
            let Ok(conf_path) = self.peer.characteristic_path(conf) else {
                return;
            };
            match self.bluez.write_value(&conf_path, config_off.clone()).await {
                Ok(()) => tracing::info!(device = %device, "device switched off"),
                Err(e) => tracing::warn!(device = %device, error = %e, "cannot switch device off"),
            }
        }
    }

    /// Final teardown when the session closes.
    async fn release(&self) {
        let mac = self.peer.mac;
        let was_connected = self.peer.state().is_connected();
        self.peer.set_state(DeviceState::Disconnecting);
        self.disable_all().await;
        if was_connected && !self.bluez.connection().is_closed() {
            if let Err(e) = self.bluez.disconnect_device(&mac).await {
                tracing::debug!(mac = %mac, error = %e, "disconnect failed");
            }
        }
        self.peer.set_state(DeviceState::Disconnected);
        tracing::info!(mac = %mac, "device released");
    }

    fn fail(&self, reason: &str) {
        *lock(&self.peer.last_error) = Some(reason.to_owned());
        self.peer.set_state(DeviceState::Failed);
    }
}

/// Reason of a failed connection attempt, without the error prefix.
fn failure_reason(e: &CoreError) -> String {
    match e {
        CoreError::Connection { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

// ── Link property events ─────────────────────────────────────────────

fn is_true(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

/// Wait until `Connected` or `ServicesResolved` turns false. Returns a
/// description of what happened.
async fn link_lost(events: &mut NotificationHandle) -> String {
    loop {
        match events.next_any().await {
            Ok((name, value)) if value.as_bool() == Some(false) => return format!("{name} is false"),
            Ok(_) => {}
            Err(e) => return e.to_string(),
        }
    }
}

/// Wait until BlueZ reports the device connected again. Pending forever
/// once the subscription is gone.
async fn link_up(events: &mut NotificationHandle) {
    loop {
        match events.next_any().await {
            Ok((_, value)) if is_true(&value) => return,
            Ok(_) => {}
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

/// Wait for `ServicesResolved` to turn true.
async fn services_signalled(events: &mut NotificationHandle) {
    loop {
        match events.next("ServicesResolved").await {
            Ok(value) if is_true(&value) => return,
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Group devices by peer, keeping the order in which peers first appear.
pub(crate) fn group_by_peer(
    devices: impl IntoIterator<Item = Device>,
    default_address_type: AddressType,
) -> Result<Vec<Peer>, CoreError> {
    let mut peers: Vec<Peer> = Vec::new();
    for device in devices {
        let address_type = device.address_type.unwrap_or(default_address_type);
        let index = peers
            .iter()
            .position(|p| p.mac == device.mac)
            .unwrap_or_else(|| {
                peers.push(Peer::new(device.mac, address_type));
                peers.len() - 1
            });
        let peer = &mut peers[index];
        if peer.address_type != address_type {
            return Err(CoreError::Configuration {
                message: format!("conflicting address types for {}", device.mac),
            });
        }
        if peer.devices.iter().any(|slot| slot.device == device) {
            return Err(CoreError::Configuration {
                message: format!("device {device} registered twice"),
            });
        }
        peer.devices.push(Arc::new(DeviceSlot::new(device)));
    }
    Ok(peers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::sig_uuid;

    fn characteristic(mac: &str, data: u16) -> Device {
        Device::new(
            mac.parse().unwrap(),
            Service::Characteristic {
                uuid: sig_uuid(0x181a),
                data: sig_uuid(data),
                size: None,
            },
        )
    }

    #[test]
    fn devices_are_grouped_by_mac() {
        let peers = group_by_peer(
            [
                characteristic("AA:BB:CC:DD:EE:FF", 0x2a6e),
                characteristic("11:22:33:44:55:66", 0x2a6e),
                characteristic("AA:BB:CC:DD:EE:FF", 0x2a6d),
            ],
            AddressType::Public,
        )
        .unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].devices.len(), 2);
        assert_eq!(peers[1].mac.to_string(), "11:22:33:44:55:66");
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let dev = characteristic("AA:BB:CC:DD:EE:FF", 0x2a6e);
        let err = group_by_peer([dev.clone(), dev], AddressType::Public).err().unwrap();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }

    #[test]
    fn conflicting_address_types_are_rejected() {
        let a = characteristic("AA:BB:CC:DD:EE:FF", 0x2a6e);
        let b = characteristic("AA:BB:CC:DD:EE:FF", 0x2a6d).with_address_type(AddressType::Random);
        assert!(group_by_peer([a, b], AddressType::Public).is_err());
    }

    #[test]
    fn failed_peer_reports_last_error() {
        let peer = Peer::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), AddressType::Public);
        assert_eq!(
            peer.disconnected_error().to_string(),
            "Cannot connect to AA:BB:CC:DD:EE:FF: device disconnected"
        );
        *lock(&peer.last_error) = Some("Page Timeout".into());
        peer.set_state(DeviceState::Failed);
        assert_eq!(
            peer.disconnected_error().to_string(),
            "Cannot connect to AA:BB:CC:DD:EE:FF: Page Timeout"
        );
    }
}
