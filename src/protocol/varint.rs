//! QUIC variable-length integers (RFC 9000 §16) and the primitives built on them

use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

/// Largest value representable by a varint (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Upper bound for length-prefixed strings on the control stream
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Number of bytes `value` occupies once encoded
pub fn varint_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

pub fn encode_varint<B: BufMut>(buf: &mut B, value: u64) -> Result<(), ProtocolError> {
    if value < (1 << 6) {
        buf.put_u8(value as u8);
    } else if value < (1 << 14) {
        buf.put_u16(0x4000 | value as u16);
    } else if value < (1 << 30) {
        buf.put_u32(0x8000_0000 | value as u32);
    } else if value <= MAX_VARINT {
        buf.put_u64(0xc000_0000_0000_0000 | value);
    } else {
        return Err(ProtocolError::VarIntRange(value));
    }
    Ok(())
}

pub fn decode_varint<B: Buf>(buf: &mut B) -> Result<u64, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::UnexpectedEnd);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(ProtocolError::UnexpectedEnd);
    }

    buf.advance(1);
    let mut value = u64::from(first & 0x3f);
    for _ in 1..len {
        value = (value << 8) | u64::from(buf.get_u8());
    }
    Ok(value)
}

/// Zig-zag encode a signed value so small negatives stay small
pub fn encode_signed<B: BufMut>(buf: &mut B, value: i64) -> Result<(), ProtocolError> {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint(buf, zigzag)
}

pub fn decode_signed<B: Buf>(buf: &mut B) -> Result<i64, ProtocolError> {
    let zigzag = decode_varint(buf)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

pub fn encode_bytes<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<(), ProtocolError> {
    encode_varint(buf, data.len() as u64)?;
    buf.put_slice(data);
    Ok(())
}

/// Decode a length-prefixed byte string
pub fn decode_bytes<B: Buf>(buf: &mut B) -> Result<Bytes, ProtocolError> {
    let len = decode_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::UnexpectedEnd);
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn encode_string<B: BufMut>(buf: &mut B, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_STRING_LEN {
        return Err(ProtocolError::InvalidValue {
            field: "string length",
            value: value.len() as u64,
        });
    }
    encode_bytes(buf, value.as_bytes())
}

pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String, ProtocolError> {
    let len = decode_varint(buf)?;
    if len as usize > MAX_STRING_LEN {
        return Err(ProtocolError::InvalidValue {
            field: "string length",
            value: len,
        });
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::UnexpectedEnd);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_boundaries() {
        for (value, len) in [(0u64, 1), (63, 1), (64, 2), (16_383, 2), (16_384, 4), (MAX_VARINT, 8)] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value).unwrap();
            assert_eq!(buf.len(), len, "value {}", value);
            assert_eq!(varint_len(value), len);
            assert_eq!(decode_varint(&mut buf.freeze()).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_rfc_example() {
        // RFC 9000 appendix A.1: 0x7bbd decodes to 15293
        let mut buf = Bytes::from_static(&[0x7b, 0xbd]);
        assert_eq!(decode_varint(&mut buf).unwrap(), 15_293);
    }

    #[test]
    fn test_varint_out_of_range() {
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_varint(&mut buf, MAX_VARINT + 1),
            Err(ProtocolError::VarIntRange(MAX_VARINT + 1))
        );
    }

    #[test]
    fn test_truncated_varint() {
        let mut buf = Bytes::from_static(&[0x80, 0x01]);
        assert_eq!(decode_varint(&mut buf), Err(ProtocolError::UnexpectedEnd));
    }

    #[test]
    fn test_signed_values() {
        let mut buf = BytesMut::new();
        encode_signed(&mut buf, -1).unwrap();
        encode_signed(&mut buf, -1_000_000).unwrap();
        encode_signed(&mut buf, 1_700_000_000_000).unwrap();
        let mut buf = buf.freeze();
        assert_eq!(decode_signed(&mut buf).unwrap(), -1);
        assert_eq!(decode_signed(&mut buf).unwrap(), -1_000_000);
        assert_eq!(decode_signed(&mut buf).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_string_length_checked() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"abc");
        assert_eq!(decode_string(&mut buf.freeze()), Err(ProtocolError::UnexpectedEnd));
    }
}
