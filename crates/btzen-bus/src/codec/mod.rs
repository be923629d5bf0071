//! Wire codec: typed values marshalled against type signatures.
//!
//! The codec is synchronous and allocation-light. Byte arrays are appended
//! to the output buffer in one copy and decoded as slices of the receive
//! buffer.

mod signature;
mod value;
pub(crate) mod wire;

use bytes::Bytes;

pub use signature::{MAX_DEPTH, SigType, Signature};
pub use value::Value;
pub use wire::{Decoder, Encoder, Endian};

use crate::error::Result;

/// Encode a single value as a standalone fragment starting at offset 0.
pub fn encode(value: &Value, ty: &SigType) -> Result<Bytes> {
    let mut enc = Encoder::new();
    enc.encode(value, ty)?;
    Ok(enc.finish().freeze())
}

/// Decode one value from the start of `buf`, returning it with the number
/// of bytes consumed.
pub fn decode(buf: &Bytes, ty: &SigType) -> Result<(Value, usize)> {
    let mut dec = Decoder::new(buf.clone(), Endian::Little);
    let value = dec.decode(ty)?;
    Ok((value, dec.position()))
}

/// Encode a message body (offset 0 is 8-aligned, as in a real message).
pub fn encode_body(values: &[Value], signature: &Signature) -> Result<Bytes> {
    let mut enc = Encoder::new();
    enc.encode_all(values, signature)?;
    Ok(enc.finish().freeze())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::Error;

    fn round_trip(value: Value, sig: &str) {
        let ty = SigType::parse(sig).unwrap();
        let bytes = encode(&value, &ty).unwrap();
        let (decoded, used) = decode(&bytes, &ty).unwrap();
        assert_eq!(decoded, value, "signature {sig}");
        assert_eq!(used, bytes.len(), "signature {sig}");
    }

    #[test]
    fn scalars_survive_encoding() {
        round_trip(Value::Bool(true), "b");
        round_trip(Value::Int16(-1234), "n");
        round_trip(Value::Byte(0xbb), "y");
        round_trip(Value::from("Value"), "s");
        round_trip(Value::object_path("/org/bluez/hci0/dev_AA_BB"), "o");
    }

    #[test]
    fn containers_survive_encoding() {
        round_trip(Value::from(vec![0xbb, 0x4d]), "ay");
        round_trip(Value::variant(Value::Int16(7)), "v");
        round_trip(
            Value::property_map([
                ("Connected", Value::Bool(true)),
                ("RSSI", Value::Int16(-60)),
            ]),
            "a{sv}",
        );

        let props = Value::property_map([("UUID", Value::from("0000180f"))]);
        let ifaces = Value::Dict {
            key: SigType::Str,
            value: SigType::dict(SigType::Str, SigType::Variant),
            entries: vec![(Value::from("org.bluez.GattService1"), props)],
        };
        let managed = Value::Dict {
            key: SigType::ObjectPath,
            value: ifaces.sig_type(),
            entries: vec![(Value::object_path("/org/bluez/hci0/dev_AA/service0010"), ifaces)],
        };
        round_trip(managed, "a{oa{sa{sv}}}");
    }

    #[test]
    fn byte_array_layout_is_length_then_raw_bytes() {
        let ty = SigType::parse("ay").unwrap();
        let bytes = encode(&Value::from(vec![0xbb, 0x4d]), &ty).unwrap();
        assert_eq!(&bytes[..], &[2, 0, 0, 0, 0xbb, 0x4d]);
    }

    #[test]
    fn dict_entries_are_eight_aligned() {
        let ty = SigType::parse("a{sv}").unwrap();
        let map = Value::property_map([("A", Value::Byte(1))]);
        let bytes = encode(&map, &ty).unwrap();
        // length, pad to 8, "A"(len+char+nul), sig "y", byte
        assert_eq!(
            &bytes[..],
            &[10, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'A', 0, 1, b'y', 0, 1]
        );
    }

    #[test]
    fn mismatched_value_fails_fast() {
        let ty = SigType::parse("n").unwrap();
        let err = encode(&Value::Byte(1), &ty).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }), "{err}");

        let ty = SigType::parse("as").unwrap();
        let err = encode(&Value::from(vec![1u8]), &ty).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }), "{err}");
    }

    #[test]
    fn declared_length_past_buffer_is_protocol_error() {
        let ty = SigType::parse("ay").unwrap();
        let buf = Bytes::from_static(&[16, 0, 0, 0, 1, 2]);
        let err = decode(&buf, &ty).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[test]
    fn invalid_boolean_is_protocol_error() {
        let ty = SigType::Bool;
        let buf = Bytes::from_static(&[2, 0, 0, 0]);
        assert!(matches!(decode(&buf, &ty), Err(Error::Protocol(_))));
    }

    #[test]
    fn string_without_nul_is_protocol_error() {
        let buf = Bytes::from_static(&[1, 0, 0, 0, b'a', b'b']);
        assert!(matches!(decode(&buf, &SigType::Str), Err(Error::Protocol(_))));
    }

    #[test]
    fn variant_with_unknown_code_is_protocol_error() {
        let buf = Bytes::from_static(&[1, b'z', 0, 0]);
        let err = decode(&buf, &SigType::Variant).unwrap_err();
        assert!(err.to_string().contains("unrecognized"), "{err}");
    }

    #[test]
    fn skip_moves_past_value_without_decoding() {
        let sig = Signature::parse("a{sv}s").unwrap();
        let body = encode_body(
            &[
                Value::property_map([("RSSI", Value::Int16(-40))]),
                Value::from("tail"),
            ],
            &sig,
        )
        .unwrap();

        let mut dec = Decoder::new(body, Endian::Little);
        dec.skip(&sig.types()[0]).unwrap();
        assert_eq!(dec.decode(&SigType::Str).unwrap(), Value::from("tail"));
        assert!(dec.is_at_end());
    }

    #[test]
    fn non_zero_padding_is_protocol_error() {
        let ty = SigType::Struct(vec![SigType::Byte, SigType::Uint32]);
        let clean = Bytes::from_static(&[1, 0, 0, 0, 5, 0, 0, 0]);
        assert!(decode(&clean, &ty).is_ok());

        let dirty = Bytes::from_static(&[1, 9, 0, 0, 5, 0, 0, 0]);
        let err = decode(&dirty, &ty).unwrap_err();
        assert!(err.to_string().contains("padding"), "{err}");
    }

    #[test]
    fn big_endian_integers_decode() {
        let mut dec = Decoder::new(Bytes::from_static(&[0, 0, 1, 2]), Endian::Big);
        assert_eq!(dec.decode(&SigType::Uint32).unwrap(), Value::Uint32(0x0102));
    }

    #[test]
    fn invalid_object_path_is_rejected() {
        let err = encode(&Value::object_path("/org/bluez/"), &SigType::ObjectPath).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
