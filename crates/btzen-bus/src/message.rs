//! Message framing: fixed header, header fields and a lazily decoded body.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::codec::wire::Encoder;
use crate::codec::{Decoder, Endian, SigType, Signature, Value};
use crate::error::{Error, Result};

/// Hard protocol limit on a single message.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

const FIXED_HEADER_LEN: usize = 16;
const PROTOCOL_VERSION: u8 = 1;

/// Header flag: the sender does not want a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    fn code(self) -> u8 {
        match self {
            Self::MethodCall => 1,
            Self::MethodReturn => 2,
            Self::Error => 3,
            Self::Signal => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(Error::protocol(format!("unknown message type {other}"))),
        }
    }
}

/// A bus message.
///
/// Outgoing bodies are marshalled when arguments are attached; incoming
/// bodies stay raw until a consumer decodes them, so signal routing can
/// skip values nobody asked for.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    signature: Signature,
    body: Bytes,
    endian: Endian,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Bytes::new(),
            endian: Endian::Little,
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: Some(destination.to_owned()),
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::new(MessageKind::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::new(MessageKind::Signal)
        }
    }

    /// Successful reply to `call`.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::new(MessageKind::MethodReturn)
        }
    }

    /// Error reply to `call`, carrying `message` as its single string argument.
    pub fn error(call: &Message, name: &str, message: &str) -> Self {
        let reply = Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.to_owned()),
            ..Self::new(MessageKind::Error)
        };
        let text = Value::from(message);
        let body = crate::codec::encode(&text, &SigType::Str);
        match body {
            Ok(body) => Self {
                signature: Signature::from(SigType::Str),
                body,
                ..reply
            },
            // interior NUL in the text; send the name alone
            Err(_) => reply,
        }
    }

    /// Attach arguments; the body signature is derived from the values.
    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Result<Self> {
        let args: Vec<Value> = args.into_iter().collect();
        let signature: Signature = args.iter().map(Value::sig_type).collect();
        self.body = crate::codec::encode_body(&args, &signature)?;
        self.signature = signature;
        Ok(self)
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAG_NO_REPLY_EXPECTED != 0
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// A cursor over the raw body, for partial or skipping decodes.
    pub fn body_reader(&self) -> Decoder {
        Decoder::new(self.body.clone(), self.endian)
    }

    /// Decode every body argument.
    pub fn args(&self) -> Result<Vec<Value>> {
        let values = self.body_reader().decode_all(&self.signature)?;
        Ok(values)
    }

    /// Decode the first body argument.
    pub fn first_arg(&self) -> Result<Value> {
        let ty = self
            .signature
            .types()
            .first()
            .ok_or_else(|| Error::protocol("message body is empty"))?;
        self.body_reader().decode(ty)
    }

    /// The textual first argument, if the body starts with a string.
    pub fn first_str(&self) -> Option<String> {
        match self.signature.types().first() {
            Some(SigType::Str | SigType::ObjectPath) => self.body_reader().read_str().ok(),
            _ => None,
        }
    }

    /// Turn an error reply into [`Error::MethodError`].
    pub fn into_result(self) -> Result<Self> {
        if self.kind != MessageKind::Error {
            return Ok(self);
        }
        let name = self
            .error_name
            .clone()
            .unwrap_or_else(|| "org.freedesktop.DBus.Error.Failed".to_owned());
        let message = self.first_str().unwrap_or_default();
        Err(Error::MethodError { name, message })
    }

    /// Serialize with the given serial number.
    pub fn to_bytes(&self, serial: u32) -> Result<BytesMut> {
        let body_len = u32::try_from(self.body.len())
            .map_err(|_| Error::protocol("message body too large"))?;

        let mut enc = Encoder::new();
        enc.put_u8(b'l');
        enc.put_u8(self.kind.code());
        enc.put_u8(self.flags);
        enc.put_u8(PROTOCOL_VERSION);
        enc.put_u32(body_len);
        enc.put_u32(serial);
        enc.encode(&self.header_fields(), &header_fields_type())?;
        enc.align(8);

        let mut buf = enc.finish();
        buf.extend_from_slice(&self.body);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "message of {} bytes exceeds maximum size",
                buf.len()
            )));
        }
        Ok(buf)
    }

    fn header_fields(&self) -> Value {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![Value::Byte(code), Value::variant(value)]));
        };

        if let Some(path) = &self.path {
            push(field::PATH, Value::object_path(path.as_str()));
        }
        if let Some(interface) = &self.interface {
            push(field::INTERFACE, Value::from(interface.as_str()));
        }
        if let Some(member) = &self.member {
            push(field::MEMBER, Value::from(member.as_str()));
        }
        if let Some(name) = &self.error_name {
            push(field::ERROR_NAME, Value::from(name.as_str()));
        }
        if let Some(serial) = self.reply_serial {
            push(field::REPLY_SERIAL, Value::Uint32(serial));
        }
        if let Some(dest) = &self.destination {
            push(field::DESTINATION, Value::from(dest.as_str()));
        }
        if let Some(sender) = &self.sender {
            push(field::SENDER, Value::from(sender.as_str()));
        }
        if !self.signature.is_empty() {
            push(field::SIGNATURE, Value::Signature(self.signature.clone()));
        }

        Value::Array {
            element: header_field_type(),
            items: fields,
        }
    }

    /// Parse one complete frame as returned by [`frame_len`].
    pub fn from_frame(frame: Bytes) -> Result<Self> {
        let endian = Endian::from_marker(frame.first().copied().unwrap_or(0))?;
        let mut dec = Decoder::new(frame.clone(), endian);
        dec.read_u8()?;
        let kind = MessageKind::from_code(dec.read_u8()?)?;
        let flags = dec.read_u8()?;
        let version = dec.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!("unsupported protocol version {version}")));
        }
        let body_len = dec.read_u32()? as usize;
        let serial = dec.read_u32()?;
        if serial == 0 {
            return Err(Error::protocol("message serial must not be zero"));
        }

        let mut msg = Self::new(kind);
        msg.flags = flags;
        msg.serial = serial;
        msg.endian = endian;

        let end = dec.enter_array(8)?;
        while dec.position() < end {
            dec.align(8)?;
            let code = dec.read_u8()?;
            let value = dec.decode(&SigType::Variant)?;
            msg.apply_field(code, value.peel())?;
        }
        dec.leave_array(end)?;
        dec.align(8)?;

        if dec.remaining() != body_len {
            return Err(Error::protocol(format!(
                "declared body length {body_len} does not match {} remaining bytes",
                dec.remaining()
            )));
        }
        msg.body = frame.slice(dec.position()..);
        msg.validate()?;
        Ok(msg)
    }

    fn apply_field(&mut self, code: u8, value: &Value) -> Result<()> {
        let text = || {
            value
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::protocol(format!("header field {code} has the wrong type")))
        };
        match code {
            field::PATH => self.path = Some(text()?),
            field::INTERFACE => self.interface = Some(text()?),
            field::MEMBER => self.member = Some(text()?),
            field::ERROR_NAME => self.error_name = Some(text()?),
            field::REPLY_SERIAL => {
                self.reply_serial = Some(value.as_u32().ok_or_else(|| {
                    Error::protocol("reply serial header field has the wrong type")
                })?);
            }
            field::DESTINATION => self.destination = Some(text()?),
            field::SENDER => self.sender = Some(text()?),
            field::SIGNATURE => match value {
                Value::Signature(sig) => self.signature = sig.clone(),
                _ => return Err(Error::protocol("signature header field has the wrong type")),
            },
            // unknown fields must be ignored
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let missing = |what: &str| Err(Error::protocol(format!("{:?} without {what}", self.kind)));
        match self.kind {
            MessageKind::MethodCall if self.path.is_none() || self.member.is_none() => {
                missing("path or member")
            }
            MessageKind::Signal
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() =>
            {
                missing("path, interface or member")
            }
            MessageKind::MethodReturn if self.reply_serial.is_none() => missing("reply serial"),
            MessageKind::Error if self.reply_serial.is_none() || self.error_name.is_none() => {
                missing("reply serial or error name")
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MessageKind::MethodCall => "call",
            MessageKind::MethodReturn => "return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        };
        write!(f, "{kind} serial={}", self.serial)?;
        if let Some(serial) = self.reply_serial {
            write!(f, " reply_serial={serial}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        if let (Some(iface), Some(member)) = (&self.interface, &self.member) {
            write!(f, " member={iface}.{member}")?;
        }
        if let Some(name) = &self.error_name {
            write!(f, " error={name}")?;
        }
        Ok(())
    }
}

/// Reply serial of a reply or error frame that [`Message::from_frame`]
/// rejected, read as far as the header fields still decode.
pub(crate) fn salvage_reply_serial(frame: &Bytes) -> Option<u32> {
    let endian = Endian::from_marker(*frame.first()?).ok()?;
    let mut dec = Decoder::new(frame.clone(), endian);
    dec.read_u8().ok()?;
    match MessageKind::from_code(dec.read_u8().ok()?).ok()? {
        MessageKind::MethodReturn | MessageKind::Error => {}
        MessageKind::MethodCall | MessageKind::Signal => return None,
    }
    // flags, version, body length, serial
    dec.read_u8().ok()?;
    dec.read_u8().ok()?;
    dec.read_u32().ok()?;
    dec.read_u32().ok()?;

    let end = dec.enter_array(8).ok()?;
    while dec.position() < end {
        dec.align(8).ok()?;
        let code = dec.read_u8().ok()?;
        let value = dec.decode(&SigType::Variant).ok()?;
        if code == field::REPLY_SERIAL {
            return value.peel().as_u32();
        }
    }
    None
}

fn header_field_type() -> SigType {
    SigType::Struct(vec![SigType::Byte, SigType::Variant])
}

fn header_fields_type() -> SigType {
    SigType::array(header_field_type())
}

/// Length of the first complete frame in `buf`, or `None` if more bytes are
/// needed to tell.
pub fn frame_len(buf: &[u8], max_size: usize) -> Result<Option<usize>> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let endian = Endian::from_marker(buf[0])?;
    let read_u32 = |at: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[at..at + 4]);
        match endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    };
    let body_len = read_u32(4) as usize;
    let fields_len = read_u32(12) as usize;
    let header_len = (FIXED_HEADER_LEN + fields_len).div_ceil(8) * 8;
    let total = header_len.saturating_add(body_len);
    if total > max_size.min(MAX_MESSAGE_SIZE) {
        return Err(Error::protocol(format!(
            "incoming message of {total} bytes exceeds maximum size"
        )));
    }
    Ok((buf.len() >= total).then_some(total))
}
