// ── Type signatures ──
//
// A signature is parsed once into a tree of `SigType`s; encoders and
// decoders walk the tree instead of re-scanning the signature string.

use std::fmt;

use crate::error::{Error, Result};

/// Container nesting bound shared by signatures and decoded values.
pub const MAX_DEPTH: usize = 64;

const MAX_SIGNATURE_LEN: usize = 255;

/// One complete type from a signature string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SigType {
    Byte,
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    Str,
    ObjectPath,
    Signature,
    Variant,
    /// `a<T>`
    Array(Box<SigType>),
    /// `a{KV}`, key is always a basic type.
    Dict(Box<SigType>, Box<SigType>),
    /// `(...)`, never empty.
    Struct(Vec<SigType>),
}

impl SigType {
    /// Parse a signature that must contain exactly one complete type.
    pub fn parse(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        let mut pos = 0;
        let ty = parse_one(bytes, &mut pos, 0)?;
        if pos != bytes.len() {
            return Err(Error::protocol(format!(
                "signature '{text}' holds more than one complete type"
            )));
        }
        Ok(ty)
    }

    pub fn array(element: SigType) -> Self {
        Self::Array(Box::new(element))
    }

    pub fn dict(key: SigType, value: SigType) -> Self {
        Self::Dict(Box::new(key), Box::new(value))
    }

    /// Wire alignment in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Bool
            | Self::Int32
            | Self::Uint32
            | Self::Str
            | Self::ObjectPath
            | Self::Array(_)
            | Self::Dict(..) => 4,
            Self::Int64 | Self::Uint64 | Self::Double | Self::Struct(_) => 8,
        }
    }

    /// Basic types are the only ones allowed as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Dict(..) | Self::Struct(_)
        )
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte => f.write_str("y"),
            Self::Bool => f.write_str("b"),
            Self::Int16 => f.write_str("n"),
            Self::Uint16 => f.write_str("q"),
            Self::Int32 => f.write_str("i"),
            Self::Uint32 => f.write_str("u"),
            Self::Int64 => f.write_str("x"),
            Self::Uint64 => f.write_str("t"),
            Self::Double => f.write_str("d"),
            Self::Str => f.write_str("s"),
            Self::ObjectPath => f.write_str("o"),
            Self::Signature => f.write_str("g"),
            Self::Variant => f.write_str("v"),
            Self::Array(element) => write!(f, "a{element}"),
            Self::Dict(key, value) => write!(f, "a{{{key}{value}}}"),
            Self::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{field}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A sequence of complete types, e.g. a message body signature `sa{sv}as`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    types: Vec<SigType>,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::protocol(format!(
                "signature longer than {MAX_SIGNATURE_LEN} bytes"
            )));
        }
        let bytes = text.as_bytes();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < bytes.len() {
            types.push(parse_one(bytes, &mut pos, 0)?);
        }
        Ok(Self { types })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn types(&self) -> &[SigType] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Signature of a single complete type.
    pub fn single(&self) -> Option<&SigType> {
        match self.types.as_slice() {
            [ty] => Some(ty),
            _ => None,
        }
    }
}

impl From<SigType> for Signature {
    fn from(ty: SigType) -> Self {
        Self { types: vec![ty] }
    }
}

impl FromIterator<SigType> for Signature {
    fn from_iter<I: IntoIterator<Item = SigType>>(iter: I) -> Self {
        Self {
            types: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.types {
            write!(f, "{ty}")?;
        }
        Ok(())
    }
}

fn parse_one(bytes: &[u8], pos: &mut usize, depth: usize) -> Result<SigType> {
    if depth > MAX_DEPTH {
        return Err(Error::protocol("signature nesting too deep"));
    }
    let Some(&code) = bytes.get(*pos) else {
        return Err(Error::protocol("unexpected end of signature"));
    };
    *pos += 1;

    let ty = match code {
        b'y' => SigType::Byte,
        b'b' => SigType::Bool,
        b'n' => SigType::Int16,
        b'q' => SigType::Uint16,
        b'i' => SigType::Int32,
        b'u' => SigType::Uint32,
        b'x' => SigType::Int64,
        b't' => SigType::Uint64,
        b'd' => SigType::Double,
        b's' => SigType::Str,
        b'o' => SigType::ObjectPath,
        b'g' => SigType::Signature,
        b'v' => SigType::Variant,
        b'h' => {
            return Err(Error::protocol(
                "unix file descriptor type 'h' is not supported",
            ));
        }
        b'a' if bytes.get(*pos) == Some(&b'{') => {
            *pos += 1;
            let key = parse_one(bytes, pos, depth + 1)?;
            if !key.is_basic() {
                return Err(Error::protocol(format!(
                    "dict key must be a basic type, got '{key}'"
                )));
            }
            let value = parse_one(bytes, pos, depth + 1)?;
            if bytes.get(*pos) != Some(&b'}') {
                return Err(Error::protocol("dict entry is missing its '}' terminator"));
            }
            *pos += 1;
            SigType::dict(key, value)
        }
        b'a' => SigType::array(parse_one(bytes, pos, depth + 1)?),
        b'(' => {
            let mut fields = Vec::new();
            loop {
                match bytes.get(*pos) {
                    None => return Err(Error::protocol("struct is missing its ')' terminator")),
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => fields.push(parse_one(bytes, pos, depth + 1)?),
                }
            }
            if fields.is_empty() {
                return Err(Error::protocol("empty struct in signature"));
            }
            SigType::Struct(fields)
        }
        other => {
            return Err(Error::protocol(format!(
                "unrecognized signature code '{}'",
                char::from(other)
            )));
        }
    };
    Ok(ty)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_managed_objects_signature() {
        let ty = SigType::parse("a{oa{sa{sv}}}").unwrap();
        let props = SigType::dict(SigType::Str, SigType::Variant);
        let ifaces = SigType::dict(SigType::Str, props);
        assert_eq!(ty, SigType::dict(SigType::ObjectPath, ifaces));
        assert_eq!(ty.to_string(), "a{oa{sa{sv}}}");
    }

    #[test]
    fn parses_body_signature_with_several_types() {
        let sig = Signature::parse("sa{sv}as").unwrap();
        assert_eq!(sig.types().len(), 3);
        assert_eq!(sig.to_string(), "sa{sv}as");
        assert!(sig.single().is_none());
    }

    #[test]
    fn parses_header_field_struct() {
        let ty = SigType::parse("a(yv)").unwrap();
        assert_eq!(
            ty,
            SigType::array(SigType::Struct(vec![SigType::Byte, SigType::Variant]))
        );
        assert_eq!(ty.alignment(), 4);
    }

    #[test]
    fn rejects_unknown_code() {
        let err = SigType::parse("a{sz}").unwrap_err();
        assert!(err.to_string().contains("unrecognized signature code 'z'"), "{err}");
    }

    #[test]
    fn rejects_missing_terminators() {
        assert!(SigType::parse("a{sv").is_err());
        assert!(SigType::parse("(ii").is_err());
        assert!(SigType::parse("()").is_err());
    }

    #[test]
    fn rejects_container_dict_key() {
        assert!(SigType::parse("a{vs}").is_err());
    }

    #[test]
    fn rejects_unix_fd() {
        let err = SigType::parse("h").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn single_type_parse_rejects_trailing_types() {
        assert!(SigType::parse("ss").is_err());
        assert!(SigType::parse("").is_err());
    }
}
