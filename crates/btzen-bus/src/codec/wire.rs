// ── Binary marshalling ──
//
// Offsets are relative to the start of the buffer. Message bodies start
// on an 8-byte boundary, so body-relative alignment equals
// message-relative alignment.

use bytes::{BufMut, Bytes, BytesMut};

use super::signature::{MAX_DEPTH, SigType, Signature};
use super::value::Value;
use crate::error::{Error, Result};

/// Largest array payload the protocol allows (64 MiB).
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Byte order of a received message. Outgoing messages are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            b'l' => Ok(Self::Little),
            b'B' => Ok(Self::Big),
            other => Err(Error::protocol(format!(
                "invalid endianness marker 0x{other:02x}"
            ))),
        }
    }
}

fn padding(pos: usize, align: usize) -> usize {
    (align - pos % align) % align
}

fn mismatch(expected: &SigType, found: &Value) -> Error {
    Error::TypeMismatch {
        expected: expected.to_string(),
        found: found.sig_type().to_string(),
    }
}

pub(crate) fn validate_object_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..].split('/').all(|elem| {
                !elem.is_empty() && elem.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            }));
    if valid {
        Ok(())
    } else {
        Err(Error::protocol(format!("invalid object path '{path}'")))
    }
}

// ── Encoder ──────────────────────────────────────────────────────────

/// Little-endian marshaller writing into a growable buffer.
///
/// A frame goes to the socket as one contiguous write, so `ay` payloads
/// are copied into it with a single `memcpy` and no per-element work.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    depth: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }

    pub fn align(&mut self, align: usize) {
        let pad = padding(self.buf.len(), align);
        self.buf.put_bytes(0, pad);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.align(4);
        self.buf.put_u32_le(v);
    }

    fn put_len(&mut self, len: usize, limit: usize, what: &str) -> Result<u32> {
        if len > limit {
            return Err(Error::protocol(format!("{what} of {len} bytes exceeds limit")));
        }
        u32::try_from(len).map_err(|_| Error::protocol(format!("{what} length overflow")))
    }

    fn put_str(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(Error::protocol("string contains an interior NUL byte"));
        }
        let len = self.put_len(s.len(), u32::MAX as usize, "string")?;
        self.put_u32(len);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    fn put_signature(&mut self, sig: &str) -> Result<()> {
        let len = u8::try_from(sig.len())
            .map_err(|_| Error::protocol("signature longer than 255 bytes"))?;
        self.buf.put_u8(len);
        self.buf.put_slice(sig.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    /// Reserve a 4-byte array length slot; returns its offset.
    fn open_array(&mut self, element_align: usize) -> (usize, usize) {
        self.align(4);
        let slot = self.buf.len();
        self.buf.put_u32_le(0);
        self.align(element_align);
        (slot, self.buf.len())
    }

    fn close_array(&mut self, slot: usize, start: usize) -> Result<()> {
        let len = self.put_len(self.buf.len() - start, MAX_ARRAY_LEN, "array")?;
        self.buf[slot..slot + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Encode `value` as type `ty`. A value whose tag does not match the
    /// type fails with [`Error::TypeMismatch`]; nothing is coerced.
    pub fn encode(&mut self, value: &Value, ty: &SigType) -> Result<()> {
        if self.depth > MAX_DEPTH {
            return Err(Error::protocol("value nesting too deep"));
        }

        match (ty, value) {
            (SigType::Byte, Value::Byte(v)) => self.buf.put_u8(*v),
            (SigType::Bool, Value::Bool(v)) => self.put_u32(u32::from(*v)),
            (SigType::Int16, Value::Int16(v)) => {
                self.align(2);
                self.buf.put_i16_le(*v);
            }
            (SigType::Uint16, Value::Uint16(v)) => {
                self.align(2);
                self.buf.put_u16_le(*v);
            }
            (SigType::Int32, Value::Int32(v)) => {
                self.align(4);
                self.buf.put_i32_le(*v);
            }
            (SigType::Uint32, Value::Uint32(v)) => self.put_u32(*v),
            (SigType::Int64, Value::Int64(v)) => {
                self.align(8);
                self.buf.put_i64_le(*v);
            }
            (SigType::Uint64, Value::Uint64(v)) => {
                self.align(8);
                self.buf.put_u64_le(*v);
            }
            (SigType::Double, Value::Double(v)) => {
                self.align(8);
                self.buf.put_f64_le(*v);
            }
            (SigType::Str, Value::Str(s)) => self.put_str(s)?,
            (SigType::ObjectPath, Value::ObjectPath(p)) => {
                validate_object_path(p)?;
                self.put_str(p)?;
            }
            (SigType::Signature, Value::Signature(sig)) => self.put_signature(&sig.to_string())?,
            (SigType::Array(element), Value::Bytes(raw)) if **element == SigType::Byte => {
                let len = self.put_len(raw.len(), MAX_ARRAY_LEN, "array")?;
                self.put_u32(len);
                self.buf.extend_from_slice(raw);
            }
            (SigType::Array(expected), Value::Array { element, items }) => {
                if **expected != *element {
                    return Err(mismatch(ty, value));
                }
                let (slot, start) = self.open_array(element.alignment());
                self.depth += 1;
                for item in items {
                    self.encode(item, element)?;
                }
                self.depth -= 1;
                self.close_array(slot, start)?;
            }
            (
                SigType::Dict(key_ty, value_ty),
                Value::Dict {
                    key,
                    value: val,
                    entries,
                },
            ) => {
                if **key_ty != *key || **value_ty != *val {
                    return Err(mismatch(ty, value));
                }
                let (slot, start) = self.open_array(8);
                self.depth += 1;
                for (k, v) in entries {
                    self.align(8);
                    self.encode(k, key_ty)?;
                    self.encode(v, value_ty)?;
                }
                self.depth -= 1;
                self.close_array(slot, start)?;
            }
            (SigType::Struct(field_types), Value::Struct(fields)) => {
                if field_types.len() != fields.len() {
                    return Err(mismatch(ty, value));
                }
                self.align(8);
                self.depth += 1;
                for (field, field_ty) in fields.iter().zip(field_types) {
                    self.encode(field, field_ty)?;
                }
                self.depth -= 1;
            }
            (SigType::Variant, Value::Variant(inner)) => {
                let inner_ty = inner.sig_type();
                self.put_signature(&inner_ty.to_string())?;
                self.depth += 1;
                self.encode(inner, &inner_ty)?;
                self.depth -= 1;
            }
            _ => return Err(mismatch(ty, value)),
        }
        Ok(())
    }

    /// Encode a sequence of values against a multi-type signature.
    pub fn encode_all(&mut self, values: &[Value], signature: &Signature) -> Result<()> {
        if values.len() != signature.types().len() {
            return Err(Error::TypeMismatch {
                expected: signature.to_string(),
                found: values.iter().map(|v| v.sig_type().to_string()).collect(),
            });
        }
        for (value, ty) in values.iter().zip(signature.types()) {
            self.encode(value, ty)?;
        }
        Ok(())
    }
}

// ── Decoder ──────────────────────────────────────────────────────────

/// Cursor over a received buffer. Byte arrays are returned as slices of
/// the shared buffer, never copied.
#[derive(Debug, Clone)]
pub struct Decoder {
    buf: Bytes,
    pos: usize,
    endian: Endian,
    depth: usize,
}

impl Decoder {
    pub fn new(buf: Bytes, endian: Endian) -> Self {
        Self {
            buf,
            pos: 0,
            endian,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Skip alignment padding, which must be zero.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let next = self.pos + padding(self.pos, align);
        if next > self.buf.len() {
            return Err(Error::protocol("alignment padding runs past end of buffer"));
        }
        if self.buf[self.pos..next].iter().any(|&b| b != 0) {
            return Err(Error::protocol(format!("non-zero padding at offset {}", self.pos)));
        }
        self.pos = next;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        if n > self.remaining() {
            return Err(Error::protocol(format!(
                "declared length {n} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.align(N)?;
        let raw = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&raw);
        if self.endian == Endian::Big {
            out.reverse();
        }
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.fixed::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.fixed::<4>().map(u32::from_le_bytes)
    }

    fn read_nul(&mut self, what: &str) -> Result<()> {
        match self.take(1)?.first() {
            Some(0) => Ok(()),
            _ => Err(Error::protocol(format!("{what} is missing its NUL terminator"))),
        }
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        self.read_nul("string")?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    pub fn read_signature(&mut self) -> Result<Signature> {
        let len = usize::from(self.read_u8()?);
        let raw = self.take(len)?;
        self.read_nul("signature")?;
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::protocol("signature is not valid ASCII"))?;
        Signature::parse(text)
    }

    fn read_variant_type(&mut self) -> Result<SigType> {
        let sig = self.read_signature()?;
        sig.single()
            .cloned()
            .ok_or_else(|| Error::protocol(format!("variant signature '{sig}' is not a single type")))
    }

    /// Read an array length and position the cursor on the first element.
    /// Returns the end offset of the array contents.
    pub fn enter_array(&mut self, element_align: usize) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(Error::protocol(format!("array of {len} bytes exceeds limit")));
        }
        self.align(element_align)?;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::protocol(format!(
                "declared array length {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(end)
    }

    pub fn leave_array(&self, end: usize) -> Result<()> {
        if self.pos == end {
            Ok(())
        } else {
            Err(Error::protocol("array contents overrun declared length"))
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::protocol("value nesting too deep"));
        }
        Ok(())
    }

    pub fn decode(&mut self, ty: &SigType) -> Result<Value> {
        let value = match ty {
            SigType::Byte => Value::Byte(self.read_u8()?),
            SigType::Bool => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(Error::protocol(format!("invalid boolean value {other}")));
                }
            },
            SigType::Int16 => Value::Int16(self.fixed::<2>().map(i16::from_le_bytes)?),
            SigType::Uint16 => Value::Uint16(self.fixed::<2>().map(u16::from_le_bytes)?),
            SigType::Int32 => Value::Int32(self.fixed::<4>().map(i32::from_le_bytes)?),
            SigType::Uint32 => Value::Uint32(self.read_u32()?),
            SigType::Int64 => Value::Int64(self.fixed::<8>().map(i64::from_le_bytes)?),
            SigType::Uint64 => Value::Uint64(self.fixed::<8>().map(u64::from_le_bytes)?),
            SigType::Double => Value::Double(self.fixed::<8>().map(f64::from_le_bytes)?),
            SigType::Str => Value::Str(self.read_str()?),
            SigType::ObjectPath => {
                let path = self.read_str()?;
                validate_object_path(&path)?;
                Value::ObjectPath(path)
            }
            SigType::Signature => Value::Signature(self.read_signature()?),
            SigType::Array(element) if **element == SigType::Byte => {
                let end = self.enter_array(1)?;
                let len = end - self.pos;
                Value::Bytes(self.take(len)?)
            }
            SigType::Array(element) => {
                let end = self.enter_array(element.alignment())?;
                self.descend()?;
                let mut items = Vec::new();
                while self.pos < end {
                    items.push(self.decode(element)?);
                }
                self.depth -= 1;
                self.leave_array(end)?;
                Value::Array {
                    element: (**element).clone(),
                    items,
                }
            }
            SigType::Dict(key, value) => {
                let end = self.enter_array(8)?;
                self.descend()?;
                let mut entries = Vec::new();
                while self.pos < end {
                    self.align(8)?;
                    let k = self.decode(key)?;
                    let v = self.decode(value)?;
                    entries.push((k, v));
                }
                self.depth -= 1;
                self.leave_array(end)?;
                Value::Dict {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries,
                }
            }
            SigType::Struct(field_types) => {
                self.align(8)?;
                self.descend()?;
                let fields = field_types
                    .iter()
                    .map(|field_ty| self.decode(field_ty))
                    .collect::<Result<Vec<_>>>()?;
                self.depth -= 1;
                Value::Struct(fields)
            }
            SigType::Variant => {
                let inner_ty = self.read_variant_type()?;
                self.descend()?;
                let inner = self.decode(&inner_ty)?;
                self.depth -= 1;
                Value::Variant(Box::new(inner))
            }
        };
        Ok(value)
    }

    /// Advance past a value of type `ty` without materializing it.
    pub fn skip(&mut self, ty: &SigType) -> Result<()> {
        match ty {
            SigType::Byte => {
                self.take(1)?;
            }
            SigType::Int16 | SigType::Uint16 => {
                self.align(2)?;
                self.take(2)?;
            }
            SigType::Bool | SigType::Int32 | SigType::Uint32 => {
                self.align(4)?;
                self.take(4)?;
            }
            SigType::Int64 | SigType::Uint64 | SigType::Double => {
                self.align(8)?;
                self.take(8)?;
            }
            SigType::Str | SigType::ObjectPath => {
                let len = self.read_u32()? as usize;
                self.take(len)?;
                self.read_nul("string")?;
            }
            SigType::Signature => {
                let len = usize::from(self.read_u8()?);
                self.take(len)?;
                self.read_nul("signature")?;
            }
            SigType::Array(element) => {
                let end = self.enter_array(element.alignment())?;
                self.pos = end;
            }
            SigType::Dict(..) => {
                let end = self.enter_array(8)?;
                self.pos = end;
            }
            SigType::Struct(field_types) => {
                self.align(8)?;
                for field_ty in field_types {
                    self.skip(field_ty)?;
                }
            }
            SigType::Variant => {
                let inner_ty = self.read_variant_type()?;
                self.descend()?;
                self.skip(&inner_ty)?;
                self.depth -= 1;
            }
        }
        Ok(())
    }

    pub fn decode_all(&mut self, signature: &Signature) -> Result<Vec<Value>> {
        signature.types().iter().map(|ty| self.decode(ty)).collect()
    }
}
