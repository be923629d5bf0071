//! Bus connection: socket ownership, framing and dispatch.
//!
//! Two background tasks serve each connection. The writer drains an
//! unbounded queue of encoded frames onto the socket. The reader appends
//! socket data to a buffer and hands it to [`Inner::pump`], which splits
//! off every complete frame and routes it to a pending call, the signal
//! router or an exported object. Pumping never awaits, so a slow consumer
//! can never stall dispatch for everybody else.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::config::BusConfig;
use crate::error::{CancelReason, Error, Result};
use crate::message::{Message, MessageKind, frame_len, salvage_reply_serial};
use crate::object::ObjectRegistry;
use crate::signal::SignalRouter;

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

const READ_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) type ReplySender = oneshot::Sender<Result<Message>>;

// ── Connection ───────────────────────────────────────────────────────

/// Handle to one authenticated bus connection.
///
/// Cheap to clone; all clones share the socket. The background tasks stop
/// when [`close`](Self::close) is called, when the peer hangs up, or when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the system bus named by the environment (or the default
    /// socket).
    pub async fn system() -> Result<Self> {
        Self::connect(BusConfig::from_env()).await
    }

    pub async fn connect(config: BusConfig) -> Result<Self> {
        tracing::info!(socket = %config.socket_path.display(), "connecting to system bus");
        let stream = UnixStream::connect(&config.socket_path).await?;
        let uid = auth::current_uid();
        Self::from_stream(stream, config, uid).await
    }

    /// Authenticate over an already open stream, start the I/O tasks and
    /// register with the bus.
    pub async fn from_stream<S>(mut stream: S, config: BusConfig, uid: u32) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        auth::authenticate(&mut stream, uid).await?;

        let (reader, writer) = tokio::io::split(stream);
        let (outgoing, frames) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner::new(config, outgoing));

        tokio::spawn(write_loop(writer, frames, inner.cancel.clone()));
        tokio::spawn(read_loop(
            reader,
            Arc::downgrade(&inner),
            inner.cancel.clone(),
        ));

        let conn = Self { inner };
        let name = conn.hello().await?;
        tracing::info!(unique_name = %name, "registered on bus");
        Ok(conn)
    }

    async fn hello(&self) -> Result<String> {
        let reply = self
            .call(Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "Hello"))
            .await?;
        let name = reply
            .first_str()
            .ok_or_else(|| Error::protocol("Hello reply carries no unique name"))?;
        let _ = self.inner.unique_name.set(name.clone());
        Ok(name)
    }

    /// Unique bus name assigned by `Hello`.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Tear the connection down. In-flight calls complete with
    /// [`CancelReason::Closed`]; subscriptions stop delivering.
    pub fn close(&self) {
        self.inner.shutdown(CancelReason::Closed);
    }

    /// Resolves once the connection is closed, locally or by the peer.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Send a message as-is; returns its serial.
    pub fn send(&self, msg: &Message) -> Result<u32> {
        let serial = self.inner.next_serial();
        self.inner.send_with_serial(msg, serial)?;
        Ok(serial)
    }
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct Inner {
    pub(crate) config: BusConfig,
    outgoing: mpsc::UnboundedSender<Bytes>,
    serial: AtomicU32,
    pub(crate) pending: DashMap<u32, ReplySender>,
    pub(crate) router: SignalRouter,
    pub(crate) objects: ObjectRegistry,
    unique_name: OnceLock<String>,
    closed: OnceLock<CancelReason>,
    pub(crate) cancel: CancellationToken,
}

impl Inner {
    pub(crate) fn new(config: BusConfig, outgoing: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            config,
            outgoing,
            serial: AtomicU32::new(1),
            pending: DashMap::new(),
            router: SignalRouter::default(),
            objects: ObjectRegistry::default(),
            unique_name: OnceLock::new(),
            closed: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Serials are non-zero and wrap around.
    pub(crate) fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    pub(crate) fn closed_reason(&self) -> Option<CancelReason> {
        self.closed.get().copied()
    }

    pub(crate) fn send_with_serial(&self, msg: &Message, serial: u32) -> Result<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(Error::Cancelled(reason));
        }
        let frame = msg.to_bytes(serial)?;
        tracing::trace!(serial, msg = %msg, len = frame.len(), "sending");
        self.outgoing
            .send(frame.freeze())
            .map_err(|_| Error::Cancelled(CancelReason::Disconnected))
    }

    /// Dispatch every complete frame in `buf`, leaving any partial frame in
    /// place. Returns the number of messages processed.
    ///
    /// Only an unframeable stream is an error. A frame that fails to parse
    /// fails the call it answers, if its reply serial can be read, and is
    /// otherwise logged and skipped.
    pub(crate) fn pump(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut processed = 0;
        while let Some(len) = frame_len(buf, self.config.max_message_size)? {
            let frame = buf.split_to(len).freeze();
            processed += 1;
            match Message::from_frame(frame.clone()) {
                Ok(msg) => self.dispatch(msg),
                Err(e) => self.reject(&frame, e),
            }
        }
        Ok(processed)
    }

    fn reject(&self, frame: &Bytes, error: Error) {
        let slot = salvage_reply_serial(frame).and_then(|serial| self.pending.remove(&serial));
        let Some((serial, slot)) = slot else {
            tracing::warn!(error = %error, "discarding malformed message");
            return;
        };
        tracing::warn!(serial, error = %error, "malformed reply fails its call");
        let error = match error {
            Error::Protocol(_) => error,
            other => Error::protocol(format!("malformed reply: {other}")),
        };
        if slot.send(Err(error)).is_err() {
            tracing::debug!(serial, "caller gone before reply was delivered");
        }
    }

    fn dispatch(&self, msg: Message) {
        tracing::trace!(msg = %msg, "received");
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => {
                let Some(serial) = msg.reply_serial else {
                    return;
                };
                match self.pending.remove(&serial) {
                    Some((_, slot)) => {
                        if slot.send(Ok(msg)).is_err() {
                            tracing::debug!(serial, "caller gone before reply was delivered");
                        }
                    }
                    None => {
                        tracing::debug!(serial, "dropping reply to unknown or cancelled call");
                    }
                }
            }
            MessageKind::Signal => {
                self.router.dispatch(&msg);
            }
            MessageKind::MethodCall => {
                if let Some(reply) = self.objects.handle(&msg) {
                    let serial = self.next_serial();
                    if let Err(e) = self.send_with_serial(&reply, serial) {
                        tracing::debug!(error = %e, "cannot answer incoming call");
                    }
                }
            }
        }
    }

    /// Idempotent; the first reason wins.
    pub(crate) fn shutdown(&self, reason: CancelReason) {
        let first = self.closed.set(reason).is_ok();
        self.cancel.cancel();

        let reason = self.closed_reason().unwrap_or(reason);
        let serials: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for serial in serials {
            if let Some((_, slot)) = self.pending.remove(&serial) {
                let _ = slot.send(Err(Error::Cancelled(reason)));
            }
        }
        self.router.clear();

        if first {
            tracing::info!(%reason, "bus connection shut down");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── I/O tasks ────────────────────────────────────────────────────────

async fn read_loop<R>(mut reader: R, inner: Weak<Inner>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match read {
            Ok(0) => {
                tracing::info!("bus closed the connection");
                break;
            }
            Ok(_) => {
                if let Err(e) = inner.pump(&mut buf) {
                    tracing::error!(error = %e, "unrecoverable framing error");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "bus read failed");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.shutdown(CancelReason::Disconnected);
    }
    tracing::debug!("bus reader exiting");
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!(error = %e, "bus write failed");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("bus writer exiting");
}

// ── Tests ────────────────────────────────────────────────────────────
