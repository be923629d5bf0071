// ── Serial port ──
//
// Byte stream over a GATT serial port (Telit/Stollmann Terminal I/O).
// Flow control is credit based in both directions: every packet the
// peer sends uses one RX credit granted by the host, every packet the
// host writes uses one TX credit granted by the peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use btzen_bus::NotificationHandle;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;

use crate::bluez::Bluez;
use crate::error::{CoreError, write_error};
use crate::manager::VALUE_PROPERTY;
use crate::model::Device;

/// Largest payload of one UART packet.
pub(crate) const PACKET_SIZE: usize = 20;

/// RX credits granted when the port opens, and whenever a write finds
/// none left.
const INITIAL_RX_CREDITS: u8 = 0x20;

/// Object paths of the four serial port characteristics.
#[derive(Debug, Clone)]
pub(crate) struct SerialPaths {
    pub(crate) uart_rx: String,
    pub(crate) uart_tx: String,
    pub(crate) credits_rx: String,
    pub(crate) credits_tx: String,
}

/// An open serial port, valid for one connection. Reads and writes lock
/// separate halves, so a pending read never holds up a write.
pub(crate) struct SerialPort {
    paths: SerialPaths,
    rx_credits: AtomicU32,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
}

struct Reader {
    data: NotificationHandle,
    buffer: BytesMut,
}

struct Writer {
    credits: NotificationHandle,
    tx_credits: u32,
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("uart_rx", &self.paths.uart_rx)
            .field("rx_credits", &self.rx_credits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SerialPort {
    /// Grant the initial RX credits and wait up to `timeout` for the
    /// peer's first TX credits. `data` and `credits` are notifications of
    /// the UART TX and TX credits characteristics, already started.
    pub(crate) async fn open(
        bluez: &Bluez,
        device: &Device,
        paths: SerialPaths,
        data: NotificationHandle,
        credits: NotificationHandle,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        let port = Self {
            paths,
            rx_credits: AtomicU32::new(0),
            reader: Mutex::new(Reader {
                data,
                buffer: BytesMut::new(),
            }),
            writer: Mutex::new(Writer {
                credits,
                tx_credits: 0,
            }),
        };
        port.grant(bluez, device, INITIAL_RX_CREDITS).await?;

        tracing::debug!(device = %device, "waiting for serial TX credits");
        {
            let mut writer = port.writer.lock().await;
            let granted = tokio::time::timeout(timeout, writer.credits.next(VALUE_PROPERTY))
                .await
                .map_err(|_| CoreError::connection(device.mac, "serial port granted no TX credits"))??;
            writer.tx_credits = writer.tx_credits.saturating_add(credit_count(&granted));
            tracing::debug!(device = %device, tx_credits = writer.tx_credits, "serial port open");
        }
        Ok(port)
    }

    /// Read exactly `length` bytes, or whatever arrives next when no
    /// length is given.
    pub(crate) async fn read(&self, bluez: &Bluez, device: &Device, length: Option<usize>) -> Result<Bytes, CoreError> {
        let mut reader = self.reader.lock().await;
        let wanted = length.unwrap_or(1);
        while reader.buffer.len() < wanted {
            if self.rx_credits.load(Ordering::Acquire) == 0 {
                let credits = credits_for(wanted - reader.buffer.len());
                self.grant(bluez, device, credits).await?;
            }
            let value = reader.data.next(VALUE_PROPERTY).await?;
            let _ = self
                .rx_credits
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            let packet = value.as_bytes().ok_or_else(|| CoreError::DataRead {
                device: device.to_string(),
                reason: format!("serial packet of type '{}'", value.sig_type()),
            })?;
            reader.buffer.extend_from_slice(&packet);
        }
        let n = length.unwrap_or(reader.buffer.len());
        Ok(reader.buffer.split_to(n).freeze())
    }

    /// Write `data` in packets of at most [`PACKET_SIZE`] bytes, waiting
    /// for TX credits when the peer has granted none.
    pub(crate) async fn write(&self, bluez: &Bluez, device: &Device, data: Bytes) -> Result<(), CoreError> {
        // the peer cannot answer without RX credits
        if self.rx_credits.load(Ordering::Acquire) == 0 {
            self.grant(bluez, device, INITIAL_RX_CREDITS).await?;
        }

        let mut writer = self.writer.lock().await;
        let mut offset = 0;
        while offset < data.len() {
            while writer.tx_credits == 0 {
                tracing::debug!(device = %device, "waiting for serial TX credits");
                let granted = writer.credits.next(VALUE_PROPERTY).await?;
                writer.tx_credits = writer.tx_credits.saturating_add(credit_count(&granted));
            }
            let end = (offset + PACKET_SIZE).min(data.len());
            bluez
                .write_value(&self.paths.uart_rx, data.slice(offset..end))
                .await
                .map_err(|e| write_error(device, e))?;
            writer.tx_credits -= 1;
            offset = end;
        }
        Ok(())
    }

    async fn grant(&self, bluez: &Bluez, device: &Device, credits: u8) -> Result<(), CoreError> {
        bluez
            .write_value(&self.paths.credits_rx, Bytes::copy_from_slice(&[credits]))
            .await
            .map_err(|e| write_error(device, e))?;
        let total = self
            .rx_credits
            .fetch_add(u32::from(credits), Ordering::AcqRel)
            .saturating_add(u32::from(credits));
        tracing::debug!(device = %device, rx_credits = total, "granted serial RX credits");
        Ok(())
    }

    /// Stop both notifications. Failures are logged; the peer may be
    /// gone. The match rules are removed when the last reader or writer
    /// lets go of the port.
    pub(crate) async fn close(&self, bluez: &Bluez, device: &Device) {
        for path in [&self.paths.uart_tx, &self.paths.credits_tx] {
            if let Err(e) = bluez.stop_notify(path).await {
                tracing::warn!(device = %device, error = %e, "cannot stop serial notifications");
            }
        }
        tracing::info!(device = %device, "serial port closed");
    }
}

/// RX credits to grant for `remaining` bytes: one per packet, at most 255.
fn credits_for(remaining: usize) -> u8 {
    u8::try_from(remaining.div_ceil(PACKET_SIZE).max(1)).unwrap_or(u8::MAX)
}

/// Credits carried by a TX credits notification.
fn credit_count(value: &btzen_bus::Value) -> u32 {
    value
        .as_bytes()
        .map_or(0, |raw| raw.iter().map(|&b| u32::from(b)).sum())
}
