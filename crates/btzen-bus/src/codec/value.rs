// ── Dynamically typed bus values ──

use bytes::Bytes;

use super::signature::{SigType, Signature};

/// A value carried on the bus.
///
/// Containers record their element types so that empty arrays and dicts
/// still know their signature (needed when they travel inside a variant).
/// Byte arrays decode to [`Value::Bytes`], sharing the receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(Signature),
    /// `ay`
    Bytes(Bytes),
    Array {
        element: SigType,
        items: Vec<Value>,
    },
    /// `a{KV}` in wire order.
    Dict {
        key: SigType,
        value: SigType,
        entries: Vec<(Value, Value)>,
    },
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The type this value encodes as.
    pub fn sig_type(&self) -> SigType {
        match self {
            Self::Bool(_) => SigType::Bool,
            Self::Byte(_) => SigType::Byte,
            Self::Int16(_) => SigType::Int16,
            Self::Uint16(_) => SigType::Uint16,
            Self::Int32(_) => SigType::Int32,
            Self::Uint32(_) => SigType::Uint32,
            Self::Int64(_) => SigType::Int64,
            Self::Uint64(_) => SigType::Uint64,
            Self::Double(_) => SigType::Double,
            Self::Str(_) => SigType::Str,
            Self::ObjectPath(_) => SigType::ObjectPath,
            Self::Signature(_) => SigType::Signature,
            Self::Bytes(_) => SigType::array(SigType::Byte),
            Self::Array { element, .. } => SigType::array(element.clone()),
            Self::Dict { key, value, .. } => SigType::dict(key.clone(), value.clone()),
            Self::Struct(fields) => SigType::Struct(fields.iter().map(Self::sig_type).collect()),
            Self::Variant(_) => SigType::Variant,
        }
    }

    pub fn variant(inner: impl Into<Value>) -> Self {
        Self::Variant(Box::new(inner.into()))
    }

    pub fn object_path(path: impl Into<String>) -> Self {
        Self::ObjectPath(path.into())
    }

    /// `as`
    pub fn str_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            element: SigType::Str,
            items: items.into_iter().map(|s| Self::Str(s.into())).collect(),
        }
    }

    /// `a{sv}` property map; values are wrapped in variants.
    pub fn property_map<I, K>(props: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Dict {
            key: SigType::Str,
            value: SigType::Variant,
            entries: props
                .into_iter()
                .map(|(k, v)| (Self::Str(k.into()), Self::variant(v)))
                .collect(),
        }
    }

    /// An empty `a{sv}`, the usual "options" argument.
    pub fn empty_options() -> Self {
        Self::property_map(std::iter::empty::<(String, Value)>())
    }

    /// Strip any number of variant wrappers.
    pub fn peel(&self) -> &Value {
        let mut value = self;
        while let Self::Variant(inner) = value {
            value = inner;
        }
        value
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.peel() {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.peel() {
            Self::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self.peel() {
            Self::Int16(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.peel() {
            Self::Uint32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.peel() {
            Self::Str(s) | Self::ObjectPath(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Byte content of an `ay` value, whichever form it takes.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self.peel() {
            Self::Bytes(b) => Some(b.clone()),
            Self::Array {
                element: SigType::Byte,
                items,
            } => items.iter().map(Self::as_u8).collect::<Option<Vec<u8>>>().map(Bytes::from),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.peel() {
            Self::Array { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self.peel() {
            Self::Dict { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Look up a string-keyed dict entry (variant wrappers on the value kept).
    pub fn dict_get(&self, name: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => Str,
    Bytes => Bytes,
    Signature => Signature,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(v))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn property_map_wraps_values_in_variants() {
        let map = Value::property_map([("Address", Value::from("AA:BB:CC:DD:EE:FF"))]);
        assert_eq!(map.sig_type().to_string(), "a{sv}");
        let address = map.dict_get("Address").unwrap();
        assert!(matches!(address, Value::Variant(_)));
        assert_eq!(address.as_str(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn empty_containers_keep_their_signature() {
        let empty = Value::str_array(Vec::<String>::new());
        assert_eq!(empty.sig_type().to_string(), "as");
        assert_eq!(Value::empty_options().sig_type().to_string(), "a{sv}");
    }

    #[test]
    fn bytes_view_of_byte_array() {
        let arr = Value::Array {
            element: SigType::Byte,
            items: vec![Value::Byte(0xbb), Value::Byte(0x4d)],
        };
        assert_eq!(&arr.as_bytes().unwrap()[..], &[0xbb, 0x4d]);
        assert_eq!(Value::variant(arr).sig_type(), SigType::Variant);
    }
}
