// ── Session ──
//
// Entry point for consumers. A session owns the exported GATT profile,
// one manager task per peer and the cancellation token that gates every
// read loop. Cheaply cloneable via `Arc<SessionInner>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btzen_bus::{CancelReason, Connection, Exported, Value};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::agent::{AGENT_CAPABILITY, AGENT_PATH, Agent};
use crate::bluez::Bluez;
use crate::config::SessionConfig;
use crate::error::{CoreError, read_error, write_error};
use crate::manager::{DeviceSlot, Peer, PeerTask, group_by_peer};
use crate::model::{Device, DeviceState, Service};
use crate::profile::{APPLICATION_ROOT, GattProfile, PROFILE_PATH};

/// A set of devices kept connected and readable.
///
/// Created with [`Session::connect`]; connection happens in the
/// background, so the first reads may fail with
/// [`CoreError::Connection`] until [`wait_connected`](Self::wait_connected)
/// returns.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) bluez: Bluez,
    pub(crate) cancel: CancellationToken,
    devices: HashMap<Device, (Arc<Peer>, Arc<DeviceSlot>)>,
    order: Vec<Device>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    exports: Mutex<Vec<Exported>>,
    agent: bool,
    closed: AtomicBool,
}

impl Drop for SessionInner {
    /// Without [`Session::close`] the registrations with BlueZ are released
    /// in the background, if a runtime is still around to do it.
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.closed.load(Ordering::Acquire) || self.bluez.connection().is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("session dropped outside a runtime, BlueZ registrations remain");
            return;
        };
        tracing::debug!("session dropped without close, unregistering in the background");
        let bluez = self.bluez.clone();
        let agent = self.agent;
        runtime.spawn(async move { unregister(&bluez, agent).await });
    }
}

async fn unregister(bluez: &Bluez, agent: bool) {
    if let Err(e) = bluez.unregister_application(APPLICATION_ROOT).await {
        tracing::warn!(error = %e, "cannot unregister GATT application");
    }
    if agent {
        if let Err(e) = bluez.unregister_agent(AGENT_PATH).await {
            tracing::warn!(error = %e, "cannot unregister pairing agent");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.inner.order.len())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Session {
    // ── Lifecycle ────────────────────────────────────────────────────

    /// Register the GATT profile (and the agent when configured), then
    /// start managing `devices` in the background.
    pub async fn connect(
        conn: Connection,
        config: SessionConfig,
        devices: impl IntoIterator<Item = Device>,
    ) -> Result<Self, CoreError> {
        let peers: Vec<Arc<Peer>> = group_by_peer(devices, config.address_type)?
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut index = HashMap::new();
        let mut order = Vec::new();
        for peer in &peers {
            for slot in &peer.devices {
                order.push(slot.device.clone());
                index.insert(slot.device.clone(), (Arc::clone(peer), Arc::clone(slot)));
            }
        }

        let bluez = Bluez::new(conn.clone(), &config);
        let mut exports = Vec::new();

        let profile = GattProfile::new(order.iter().map(|d| d.service.uuid()));
        tracing::debug!(uuids = ?profile.uuids().collect::<Vec<_>>(), "exporting GATT profile");
        exports.push(conn.export(PROFILE_PATH, Arc::new(profile))?);
        bluez.register_application(APPLICATION_ROOT).await?;

        let mut agent = false;
        if config.register_agent {
            let exported = conn.export(AGENT_PATH, Arc::new(Agent))?;
            match bluez.register_agent(AGENT_PATH, AGENT_CAPABILITY).await {
                Ok(()) => {
                    exports.push(exported);
                    agent = true;
                }
                Err(e) => tracing::warn!(error = %e, "cannot register pairing agent"),
            }
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(peers.len());
        for peer in &peers {
            let task = PeerTask {
                bluez: bluez.clone(),
                config: config.clone(),
                peer: Arc::clone(peer),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(task.run()));
        }

        tracing::info!(
            interface = %config.interface,
            peers = peers.len(),
            devices = order.len(),
            "session started"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                bluez,
                cancel,
                devices: index,
                order,
                tasks: tokio::sync::Mutex::new(tasks),
                exports: Mutex::new(exports),
                agent,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Disconnect every device and unregister the profile. Closing an
    /// already closed session does nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("session already closed");
            return;
        }
        self.inner.cancel.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "peer task failed");
            }
        }

        let bluez = &self.inner.bluez;
        if !bluez.connection().is_closed() {
            unregister(bluez, self.inner.agent).await;
        }
        let exports = std::mem::take(
            &mut *self
                .inner
                .exports
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        drop(exports);
        tracing::info!("session closed");
    }

    /// `false` once the session is closed. Read loops stop on it.
    pub fn is_active(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the session closes. Cancelling the returned
    /// token stops only the caller's own loops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Devices of the session, in registration order grouped by peer.
    pub fn devices(&self) -> &[Device] {
        &self.inner.order
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn device_state(&self, device: &Device) -> Result<DeviceState, CoreError> {
        let (peer, _) = self.lookup(device)?;
        Ok(peer.state())
    }

    /// Stream of connection states of the device's peer, starting with
    /// the current one.
    pub fn state(&self, device: &Device) -> Result<WatchStream<DeviceState>, CoreError> {
        let (peer, _) = self.lookup(device)?;
        Ok(WatchStream::new(peer.subscribe_state()))
    }

    /// Wait until the device's peer is connected and its devices enabled.
    /// Fails with a cancellation once the session closes.
    pub async fn wait_connected(&self, device: &Device) -> Result<(), CoreError> {
        let (peer, _) = self.lookup(device)?;
        let mut state = peer.subscribe_state();
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
            r = state.wait_for(|s| s.is_connected()) => match r {
                Ok(_) => Ok(()),
                Err(_) => Err(CoreError::closed()),
            },
        }
    }

    // ── Read / write ─────────────────────────────────────────────────

    /// Read a value from `device`.
    ///
    /// Devices with a manual trigger are read on demand; notifying
    /// devices return the next notified value. With `length` (or the
    /// service's fixed size) the data is cut to that length, and shorter
    /// data is an error. Serial ports instead wait until `length` bytes
    /// have arrived, or return the next packet when no length is given.
    ///
    /// Fails with [`CoreError::Connection`] while the device is
    /// disconnected and with [`CoreError::Cancelled`] once the session is
    /// closed.
    pub async fn read(&self, device: &Device, length: Option<usize>) -> Result<Bytes, CoreError> {
        let (peer, slot) = self.lookup(device)?;
        if !self.is_active() {
            return Err(CoreError::closed());
        }

        if let Service::Serial { .. } = device.service {
            return self.read_serial(peer, slot, length).await;
        }
        let data = if device.trigger.is_notifying() {
            self.read_notified(peer, slot).await?
        } else {
            self.read_direct(peer, slot).await?
        };
        fit_length(device, data, length.or(device.service.size()))
    }

    /// [`read`](Self::read) bounded by `timeout`. Running out of time is a
    /// cancellation, like any other "try again later".
    pub async fn read_with_timeout(
        &self,
        device: &Device,
        length: Option<usize>,
        timeout: Duration,
    ) -> Result<Bytes, CoreError> {
        tokio::time::timeout(timeout, self.read(device, length))
            .await
            .unwrap_or(Err(CoreError::Cancelled {
                reason: CancelReason::Timeout,
            }))
    }

    async fn read_direct(&self, peer: &Peer, slot: &DeviceSlot) -> Result<Bytes, CoreError> {
        let device = &slot.device;
        let link = slot.link().ok_or_else(|| peer.disconnected_error())?;
        let bluez = &self.inner.bluez;

        let read = async {
            match (&link.data_path, &device.service) {
                (Some(path), _) => bluez.read_value(path).await.map_err(|e| read_error(device, e)),
                (None, Service::Interface { interface, property, .. }) => {
                    let value = bluez
                        .device_property(&peer.mac, interface, property)
                        .await
                        .map_err(|e| read_error(device, e))?;
                    value_bytes(device, &value)
                }
                (None, _) => Err(CoreError::DataRead {
                    device: device.to_string(),
                    reason: "no data characteristic".into(),
                }),
            }
        };

        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
            () = link.cancel.cancelled() => Err(peer.disconnected_error()),
            r = read => r,
        }
    }

    async fn read_notified(&self, peer: &Peer, slot: &DeviceSlot) -> Result<Bytes, CoreError> {
        let device = &slot.device;
        let link = slot.link().ok_or_else(|| peer.disconnected_error())?;

        let next = async {
            let mut guard = slot.notifications().lock().await;
            let handle = guard.as_mut().ok_or_else(|| peer.disconnected_error())?;
            let value = handle.next(slot.notified_property()).await?;
            value_bytes(device, &value)
        };

        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
            () = link.cancel.cancelled() => Err(peer.disconnected_error()),
            r = next => r,
        }
    }

    async fn read_serial(
        &self,
        peer: &Peer,
        slot: &DeviceSlot,
        length: Option<usize>,
    ) -> Result<Bytes, CoreError> {
        let link = slot.link().ok_or_else(|| peer.disconnected_error())?;
        let port = slot.serial().ok_or_else(|| peer.disconnected_error())?;
        let read = port.read(&self.inner.bluez, &slot.device, length);

        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
            () = link.cancel.cancelled() => Err(peer.disconnected_error()),
            r = read => r,
        }
    }

    /// Newest notified value queued for `device`, discarding older ones.
    /// `None` when nothing arrived since the last read.
    pub async fn latest(&self, device: &Device) -> Result<Option<Bytes>, CoreError> {
        let (peer, slot) = self.lookup(device)?;
        if !self.is_active() {
            return Err(CoreError::closed());
        }
        if slot.link().is_none() {
            return Err(peer.disconnected_error());
        }
        let mut guard = slot.notifications().lock().await;
        let Some(handle) = guard.as_mut() else {
            return Ok(None);
        };
        handle
            .latest(slot.notified_property())
            .map(|value| value_bytes(device, &value))
            .transpose()
    }

    /// Write `data` to the device's data characteristic. Serial ports
    /// split it into packets and wait for the peer's flow control credits.
    pub async fn write(&self, device: &Device, data: impl Into<Bytes>) -> Result<(), CoreError> {
        let (peer, slot) = self.lookup(device)?;
        if !self.is_active() {
            return Err(CoreError::closed());
        }
        let link = slot.link().ok_or_else(|| peer.disconnected_error())?;

        if let Service::Serial { .. } = device.service {
            let port = slot.serial().ok_or_else(|| peer.disconnected_error())?;
            let write = port.write(&self.inner.bluez, device, data.into());
            return tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
                () = link.cancel.cancelled() => Err(peer.disconnected_error()),
                r = write => r,
            };
        }
        let Some(path) = link.data_path.as_deref() else {
            return Err(CoreError::DataWrite {
                device: device.to_string(),
                reason: "interface properties are read-only".into(),
            });
        };

        let write = self.inner.bluez.write_value(path, data.into());
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::closed()),
            () = link.cancel.cancelled() => Err(peer.disconnected_error()),
            r = write => r.map_err(|e| write_error(device, e)),
        }
    }

    fn lookup(&self, device: &Device) -> Result<(&Peer, &DeviceSlot), CoreError> {
        self.inner
            .devices
            .get(device)
            .map(|(peer, slot)| (peer.as_ref(), slot.as_ref()))
            .ok_or_else(|| CoreError::Configuration {
                message: format!("device {device} is not part of the session"),
            })
    }
}

/// Cut `data` to `length`; shorter data is a read error.
fn fit_length(device: &Device, data: Bytes, length: Option<usize>) -> Result<Bytes, CoreError> {
    match length {
        Some(n) if data.len() < n => Err(CoreError::DataRead {
            device: device.to_string(),
            reason: format!("expected {n} bytes, got {}", data.len()),
        }),
        Some(n) => Ok(data.slice(..n)),
        None => Ok(data),
    }
}

/// Raw bytes of a property value. Integers are little-endian, as on
/// the GATT wire.
fn value_bytes(device: &Device, value: &Value) -> Result<Bytes, CoreError> {
    let bytes = match value.peel() {
        Value::Bytes(_) | Value::Array { .. } => value.as_bytes(),
        Value::Byte(b) => Some(Bytes::copy_from_slice(&[*b])),
        Value::Bool(b) => Some(Bytes::copy_from_slice(&[u8::from(*b)])),
        Value::Int16(n) => Some(Bytes::copy_from_slice(&n.to_le_bytes())),
        Value::Uint16(n) => Some(Bytes::copy_from_slice(&n.to_le_bytes())),
        Value::Int32(n) => Some(Bytes::copy_from_slice(&n.to_le_bytes())),
        Value::Uint32(n) => Some(Bytes::copy_from_slice(&n.to_le_bytes())),
        Value::Str(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    };
    bytes.ok_or_else(|| CoreError::DataRead {
        device: device.to_string(),
        reason: format!("unsupported value type '{}'", value.peel().sig_type()),
    })
}
