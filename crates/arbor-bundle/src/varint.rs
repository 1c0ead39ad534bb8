//! Variable-length integers and a bounds-checked byte cursor.
//!
//! Varints are LEB128: seven bits per byte, least significant group first,
//! high bit set on every byte except the last.

use arbor_types::ContentHash;
use uuid::Uuid;

use crate::error::{BundleError, BundleResult};

/// Encode a u64 as a variable-length integer.
pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes `encode_varint` would produce for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a variable-length integer. Returns (value, bytes_consumed).
pub fn decode_varint(data: &[u8]) -> BundleResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(BundleError::Corrupt("varint overflow".into()));
        }
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(BundleError::Truncated {
        offset: data.len(),
        context: "varint",
    })
}

/// Append a length-prefixed byte string.
pub fn encode_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    encode_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Append a length-prefixed UTF-8 string.
pub fn encode_string(buf: &mut Vec<u8>, value: &str) {
    encode_bytes(buf, value.as_bytes());
}

/// Forward-only reader over a byte slice. Every read is bounds checked and
/// reports the offset it failed at.
#[derive(Clone, Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self, context: &'static str) -> BundleResult<u8> {
        Ok(self.read_exact(1, context)?[0])
    }

    pub fn read_exact(&mut self, len: usize, context: &'static str) -> BundleResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(BundleError::Truncated {
                offset: self.pos,
                context,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_varint(&mut self, context: &'static str) -> BundleResult<u64> {
        match decode_varint(&self.data[self.pos..]) {
            Ok((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            Err(BundleError::Truncated { .. }) => Err(BundleError::Truncated {
                offset: self.pos,
                context,
            }),
            Err(e) => Err(e),
        }
    }

    /// A varint that must fit a `usize`.
    pub fn read_usize(&mut self, context: &'static str) -> BundleResult<usize> {
        let value = self.read_varint(context)?;
        usize::try_from(value)
            .map_err(|_| BundleError::Corrupt(format!("{context}: value {value} out of range")))
    }

    pub fn read_bytes(&mut self, context: &'static str) -> BundleResult<&'a [u8]> {
        let len = self.read_usize(context)?;
        self.read_exact(len, context)
    }

    pub fn read_string(&mut self, context: &'static str) -> BundleResult<String> {
        let bytes = self.read_bytes(context)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BundleError::Corrupt(format!("{context}: invalid utf-8: {e}")))
    }

    pub fn read_hash(&mut self, context: &'static str) -> BundleResult<ContentHash> {
        let bytes = self.read_exact(ContentHash::LEN, context)?;
        Ok(ContentHash::from_slice(bytes)?)
    }

    pub fn read_guid(&mut self, context: &'static str) -> BundleResult<Uuid> {
        let bytes = self.read_exact(16, context)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn varint_small_values_take_one_byte() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 42);
        assert_eq!(buf, vec![42]);
        assert_eq!(decode_varint(&buf).unwrap(), (42, 1));
    }

    #[test]
    fn varint_zero() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 0);
        assert_eq!(decode_varint(&buf).unwrap(), (0, 1));
    }

    #[test]
    fn decode_varint_truncated() {
        let err = decode_varint(&[0x80]).unwrap_err();
        assert!(matches!(err, BundleError::Truncated { .. }));
    }

    #[test]
    fn decode_varint_overflow() {
        let err = decode_varint(&[0xFF; 11]).unwrap_err();
        assert!(matches!(err, BundleError::Corrupt(_)));
    }

    #[test]
    fn cursor_reports_offset_on_truncation() {
        let mut buf = Vec::new();
        encode_string(&mut buf, "hello");
        let mut cursor = ByteCursor::new(&buf[..4]);
        match cursor.read_string("alias") {
            Err(BundleError::Truncated { offset, context }) => {
                assert_eq!(offset, 1);
                assert_eq!(context, "alias");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cursor_reads_mixed_fields() {
        let hash = ContentHash::of(b"node");
        let guid = Uuid::from_u128(7);
        let mut buf = Vec::new();
        encode_varint(&mut buf, 300);
        buf.extend_from_slice(hash.as_bytes());
        buf.extend_from_slice(guid.as_bytes());
        encode_string(&mut buf, "alias");

        let mut cursor = ByteCursor::new(&buf);
        assert_eq!(cursor.read_varint("n").unwrap(), 300);
        assert_eq!(cursor.read_hash("hash").unwrap(), hash);
        assert_eq!(cursor.read_guid("guid").unwrap(), guid);
        assert_eq!(cursor.read_string("alias").unwrap(), "alias");
        assert!(cursor.is_empty());
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            prop_assert_eq!(buf.len(), varint_len(value));
            prop_assert_eq!(decode_varint(&buf).unwrap(), (value, buf.len()));
        }
    }
}
