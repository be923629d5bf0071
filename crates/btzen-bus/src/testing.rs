//! In-process bus daemon for tests.
//!
//! [`MockBus::start`] returns a mock daemon and a [`Connection`] already
//! authenticated and registered against it over an in-memory pipe. The
//! mock answers the daemon's own methods (`Hello`, `AddMatch`,
//! `RemoveMatch`); every other call is matched against responders
//! registered with [`MockBus::on`], and unmatched or deferred calls are
//! queued for the test to answer by hand.
//!
//! ```rust,ignore
//! let (bus, conn) = MockBus::start().await;
//! bus.on("org.bluez.GattCharacteristic1", "ReadValue")
//!     .respond_with(MockReply::ok([Value::from(vec![0xbb, 0x4d])]));
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::read_line;
use crate::codec::Value;
use crate::config::BusConfig;
use crate::message::{MAX_MESSAGE_SIZE, Message, MessageKind, frame_len};
use crate::signal::{PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
use crate::transport::{Connection, DBUS_SERVICE};

/// Unique name the mock hands to the client in `Hello`.
pub const CLIENT_NAME: &str = ":1.42";

/// Unique name used as sender of every reply and signal from the mock.
pub const PEER_NAME: &str = ":1.7";

const PIPE_SIZE: usize = 64 * 1024;

/// How a responder answers a call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Return(Vec<Value>),
    Error { name: String, message: String },
    /// Answer with a frame the client cannot parse; see
    /// [`MockBus::reply_malformed`].
    Malformed,
    /// Queue the call for [`MockBus::next_call`]; the test replies later.
    Defer,
}

impl MockReply {
    pub fn ok(args: impl IntoIterator<Item = Value>) -> Self {
        Self::Return(args.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self::Return(Vec::new())
    }

    pub fn error(name: &str, message: &str) -> Self {
        Self::Error {
            name: name.to_owned(),
            message: message.to_owned(),
        }
    }
}

type ResponderFn = dyn Fn(&MockBus, &Message) -> MockReply + Send + Sync;

struct Responder {
    path: Option<String>,
    interface: String,
    member: String,
    respond: Arc<ResponderFn>,
}

struct MockState {
    outgoing: mpsc::UnboundedSender<Bytes>,
    serial: AtomicU32,
    responders: Mutex<Vec<Responder>>,
    calls: Mutex<Vec<Message>>,
    rules: Mutex<Vec<String>>,
    deferred_tx: mpsc::UnboundedSender<Message>,
    deferred_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    client_pending: DashMap<u32, oneshot::Sender<Message>>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handle to a running mock daemon. Clones share the daemon.
#[derive(Clone)]
pub struct MockBus {
    state: Arc<MockState>,
}

/// Registers a responder; see [`MockBus::on`].
pub struct ResponderBuilder<'a> {
    bus: &'a MockBus,
    path: Option<String>,
    interface: String,
    member: String,
}

impl ResponderBuilder<'_> {
    /// Only answer calls on `path`.
    pub fn at_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    /// Answer every matching call with a copy of `reply`.
    pub fn respond_with(self, reply: MockReply) {
        self.respond(move |_, _| reply.clone());
    }

    /// Answer matching calls by running `f`.
    pub fn respond<F>(self, f: F)
    where
        F: Fn(&MockBus, &Message) -> MockReply + Send + Sync + 'static,
    {
        lock(&self.bus.state.responders).push(Responder {
            path: self.path,
            interface: self.interface,
            member: self.member,
            respond: Arc::new(f),
        });
    }
}

impl MockBus {
    /// Start a daemon and connect a client to it with default settings.
    pub async fn start() -> (Self, Connection) {
        Self::start_with(BusConfig::default()).await
    }

    pub async fn start_with(config: BusConfig) -> (Self, Connection) {
        let (client_end, server_end) = tokio::io::duplex(PIPE_SIZE);
        let (outgoing, frames) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();

        let bus = Self {
            state: Arc::new(MockState {
                outgoing,
                serial: AtomicU32::new(1),
                responders: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                rules: Mutex::new(Vec::new()),
                deferred_tx,
                deferred_rx: tokio::sync::Mutex::new(deferred_rx),
                client_pending: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(serve(server_end, bus.clone(), frames));

        let conn = match Connection::from_stream(client_end, config, 1000).await {
            Ok(conn) => conn,
            Err(e) => panic!("mock bus handshake failed: {e}"),
        };
        (bus, conn)
    }

    /// Respond to calls of `interface.member`. Later registrations take
    /// precedence over earlier ones.
    pub fn on(&self, interface: &str, member: &str) -> ResponderBuilder<'_> {
        ResponderBuilder {
            bus: self,
            path: None,
            interface: interface.to_owned(),
            member: member.to_owned(),
        }
    }

    /// Next call that no responder answered (or that was deferred).
    pub async fn next_call(&self) -> Message {
        let mut rx = self.state.deferred_rx.lock().await;
        match rx.recv().await {
            Some(msg) => msg,
            None => panic!("mock bus stopped"),
        }
    }

    /// Every call received so far, bus daemon methods excluded.
    pub fn calls(&self) -> Vec<Message> {
        lock(&self.state.calls).clone()
    }

    /// Received calls of `member`, in arrival order.
    pub fn calls_to(&self, member: &str) -> Vec<Message> {
        self.calls()
            .into_iter()
            .filter(|m| m.member.as_deref() == Some(member))
            .collect()
    }

    /// Currently installed match rules.
    pub fn match_rules(&self) -> Vec<String> {
        lock(&self.state.rules).clone()
    }

    pub fn reply(&self, call: &Message, args: impl IntoIterator<Item = Value>) {
        match Message::method_return(call).with_args(args) {
            Ok(reply) => self.send(reply),
            Err(e) => panic!("cannot encode mock reply: {e}"),
        }
    }

    pub fn reply_error(&self, call: &Message, name: &str, message: &str) {
        self.send(Message::error(call, name, message));
    }

    /// Reply to `call` with a method return relabelled as an error, which
    /// is invalid without an error name.
    pub fn reply_malformed(&self, call: &Message) {
        let serial = self.state.serial.fetch_add(1, Ordering::Relaxed);
        let reply = Message::method_return(call).with_sender(PEER_NAME);
        match reply.to_bytes(serial) {
            Ok(mut frame) => {
                frame[1] = 3;
                let _ = self.state.outgoing.send(frame.freeze());
            }
            Err(e) => panic!("cannot encode mock reply: {e}"),
        }
    }

    /// Emit `PropertiesChanged(interface, props, [])` from `path`.
    pub fn emit_properties_changed(&self, path: &str, interface: &str, props: Vec<(&str, Value)>) {
        let msg = Message::signal(path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED).with_args([
            Value::from(interface),
            Value::property_map(props),
            Value::str_array(Vec::<String>::new()),
        ]);
        match msg {
            Ok(msg) => self.send(msg),
            Err(e) => panic!("cannot encode mock signal: {e}"),
        }
    }

    /// Send any message to the client.
    pub fn send(&self, msg: Message) {
        let serial = self.state.serial.fetch_add(1, Ordering::Relaxed);
        let msg = msg.with_sender(PEER_NAME);
        match msg.to_bytes(serial) {
            Ok(frame) => {
                let _ = self.state.outgoing.send(frame.freeze());
            }
            Err(e) => panic!("cannot encode mock message: {e}"),
        }
    }

    /// Call a method exported by the client and wait for its reply.
    pub async fn call_client(&self, msg: Message) -> Message {
        let serial = self.state.serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.state.client_pending.insert(serial, tx);
        let msg = msg.with_sender(PEER_NAME);
        match msg.to_bytes(serial) {
            Ok(frame) => {
                let _ = self.state.outgoing.send(frame.freeze());
            }
            Err(e) => panic!("cannot encode mock call: {e}"),
        }
        match rx.await {
            Ok(reply) => reply,
            Err(_) => panic!("client never answered"),
        }
    }

    /// Drop the socket, as a crashing daemon would.
    pub fn hang_up(&self) {
        self.state.cancel.cancel();
    }

    fn handle(&self, msg: Message) {
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => {
                if let Some((_, tx)) = msg
                    .reply_serial
                    .and_then(|s| self.state.client_pending.remove(&s))
                {
                    let _ = tx.send(msg);
                }
            }
            MessageKind::Signal => {}
            MessageKind::MethodCall if msg.destination.as_deref() == Some(DBUS_SERVICE) => {
                self.handle_daemon_call(&msg);
            }
            MessageKind::MethodCall => self.handle_call(msg),
        }
    }

    fn handle_daemon_call(&self, msg: &Message) {
        let rule = msg.first_str().unwrap_or_default();
        match msg.member.as_deref() {
            Some("Hello") => self.reply(msg, [Value::from(CLIENT_NAME)]),
            Some("AddMatch") => {
                lock(&self.state.rules).push(rule);
                self.reply(msg, []);
            }
            Some("RemoveMatch") => {
                let removed = {
                    let mut rules = lock(&self.state.rules);
                    rules
                        .iter()
                        .position(|r| *r == rule)
                        .map(|i| rules.remove(i))
                };
                if msg.no_reply_expected() {
                    return;
                }
                match removed {
                    Some(_) => self.reply(msg, []),
                    None => self.reply_error(
                        msg,
                        "org.freedesktop.DBus.Error.MatchRuleNotFound",
                        "match rule not found",
                    ),
                }
            }
            _ => self.reply_error(
                msg,
                "org.freedesktop.DBus.Error.UnknownMethod",
                "not implemented by mock bus",
            ),
        }
    }

    fn handle_call(&self, msg: Message) {
        lock(&self.state.calls).push(msg.clone());

        let respond = {
            let responders = lock(&self.state.responders);
            responders
                .iter()
                .rev()
                .find(|r| {
                    msg.interface.as_deref() == Some(r.interface.as_str())
                        && msg.member.as_deref() == Some(r.member.as_str())
                        && r.path.as_ref().is_none_or(|p| msg.path.as_ref() == Some(p))
                })
                .map(|r| Arc::clone(&r.respond))
        };

        let reply = respond.map_or(MockReply::Defer, |f| (*f)(self, &msg));
        if msg.no_reply_expected() {
            return;
        }
        match reply {
            MockReply::Return(args) => self.reply(&msg, args),
            MockReply::Error { name, message } => self.reply_error(&msg, &name, &message),
            MockReply::Malformed => self.reply_malformed(&msg),
            MockReply::Defer => {
                let _ = self.state.deferred_tx.send(msg);
            }
        }
    }
}

// ── Daemon side of the pipe ──────────────────────────────────────────

async fn serve(stream: DuplexStream, bus: MockBus, frames: mpsc::UnboundedReceiver<Bytes>) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    if let Err(e) = handshake(&mut reader, &mut writer).await {
        tracing::warn!(error = %e, "mock bus handshake failed");
        return;
    }

    let cancel = bus.state.cancel.clone();
    tokio::spawn(write_frames(writer, frames, cancel.clone()));

    let mut buf = BytesMut::with_capacity(PIPE_SIZE);
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };
        if !matches!(read, Ok(n) if n > 0) {
            break;
        }
        loop {
            let len = match frame_len(&buf, MAX_MESSAGE_SIZE) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => panic!("client sent an unframeable stream: {e}"),
            };
            let frame = buf.split_to(len).freeze();
            match Message::from_frame(frame) {
                Ok(msg) => bus.handle(msg),
                Err(e) => panic!("client sent a malformed message: {e}"),
            }
        }
    }
    cancel.cancel();
}

async fn handshake(
    reader: &mut ReadHalf<DuplexStream>,
    writer: &mut WriteHalf<DuplexStream>,
) -> crate::Result<()> {
    let nul = reader.read_u8().await?;
    let auth = read_line(reader).await?;
    if nul != 0 || !auth.starts_with("AUTH EXTERNAL ") {
        writer.write_all(b"REJECTED EXTERNAL\r\n").await?;
        return Err(crate::Error::Auth(format!("unexpected '{auth}'")));
    }
    writer.write_all(b"OK 0123456789abcdef0123456789abcdef\r\n").await?;
    let begin = read_line(reader).await?;
    if begin != "BEGIN" {
        return Err(crate::Error::Auth(format!("expected BEGIN, got '{begin}'")));
    }
    Ok(())
}

async fn write_frames(
    mut writer: WriteHalf<DuplexStream>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
}
