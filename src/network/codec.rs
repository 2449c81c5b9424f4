//! Wire framing.
//!
//! Every message travels as one frame:
//!
//! ```text
//! ┌───────┬──────────┬─────────┬─────────┬──────────┬──────────┬──────────┬──────────┐
//! │ magic │ type tag │ version │ version │  origin  │ body len │   body   │  crc32   │
//! │  u8   │   u16    │ major u8│ minor u8│   u64    │   u32    │  fields  │   u32    │
//! └───────┴──────────┴─────────┴─────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! All integers are big-endian. The checksum covers everything before it.
//!
//! The body is a sequence of numbered fields, each `number: u16, length: u32, bytes`.
//! Readers skip fields they do not know and fall back to defaults for fields that are
//! missing, so a field can be added to a message without breaking older peers.

use crate::error::NetworkError;
use crate::types::{NodeId, NodeVersion};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Leading byte of every frame.
pub const FRAME_MAGIC: u8 = 0x5A;

/// Bytes before the body.
pub const FRAME_HEADER_LEN: usize = 1 + 2 + 2 + 8 + 4;

/// Bytes after the body.
pub const FRAME_TRAILER_LEN: usize = 4;

/// Largest body accepted.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type CodecResult<T> = std::result::Result<T, NetworkError>;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_tag: u16,
    pub version: NodeVersion,
    pub origin: NodeId,
    pub body: Bytes,
}

impl Frame {
    pub fn new(type_tag: u16, version: NodeVersion, origin: NodeId, body: Bytes) -> Self {
        Self {
            type_tag,
            version,
            origin,
            body,
        }
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len() + FRAME_TRAILER_LEN
    }

    pub fn encode(&self) -> CodecResult<Bytes> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(NetworkError::Serialization(format!(
                "body of {} bytes exceeds limit",
                self.body.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(FRAME_MAGIC);
        buf.put_u16(self.type_tag);
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        buf.put_u64(self.origin);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        let checksum = CRC32.checksum(&buf);
        buf.put_u32(checksum);
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> CodecResult<Frame> {
        if data.len() < FRAME_HEADER_LEN + FRAME_TRAILER_LEN {
            return Err(NetworkError::Deserialization(format!(
                "frame of {} bytes is too short",
                data.len()
            )));
        }

        let checked_len = data.len() - FRAME_TRAILER_LEN;
        let expected = u32::from_be_bytes([
            data[checked_len],
            data[checked_len + 1],
            data[checked_len + 2],
            data[checked_len + 3],
        ]);
        let actual = CRC32.checksum(&data[..checked_len]);
        if expected != actual {
            return Err(NetworkError::Checksum { expected, actual });
        }

        let magic = data.get_u8();
        if magic != FRAME_MAGIC {
            return Err(NetworkError::Deserialization(format!(
                "bad frame magic {:#x}",
                magic
            )));
        }
        let type_tag = data.get_u16();
        let version = NodeVersion::new(data.get_u8(), data.get_u8());
        let origin = data.get_u64();
        let body_len = data.get_u32() as usize;
        if body_len != data.len() - FRAME_TRAILER_LEN {
            return Err(NetworkError::Deserialization(format!(
                "body length {} does not match frame",
                body_len
            )));
        }
        let body = data.split_to(body_len);

        Ok(Frame {
            type_tag,
            version,
            origin,
            body,
        })
    }
}

/// Builds a field-encoded body.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, field: u16, value: &[u8]) -> &mut Self {
        self.buf.put_u16(field);
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn put_u64(&mut self, field: u16, value: u64) -> &mut Self {
        self.put_bytes(field, &value.to_be_bytes())
    }

    pub fn put_i64(&mut self, field: u16, value: i64) -> &mut Self {
        self.put_bytes(field, &value.to_be_bytes())
    }

    pub fn put_bool(&mut self, field: u16, value: bool) -> &mut Self {
        self.put_bytes(field, &[u8::from(value)])
    }

    pub fn put_str(&mut self, field: u16, value: &str) -> &mut Self {
        self.put_bytes(field, value.as_bytes())
    }

    /// Write the field only when present.
    pub fn put_opt_u64(&mut self, field: u16, value: Option<u64>) -> &mut Self {
        if let Some(value) = value {
            self.put_u64(field, value);
        }
        self
    }

    /// Write the field only when present.
    pub fn put_opt_bytes(&mut self, field: u16, value: Option<&[u8]>) -> &mut Self {
        if let Some(value) = value {
            self.put_bytes(field, value);
        }
        self
    }

    /// A list of byte strings, each length-prefixed.
    pub fn put_list(&mut self, field: u16, items: &[Bytes]) -> &mut Self {
        let mut inner = BytesMut::with_capacity(4 + items.iter().map(|i| 4 + i.len()).sum::<usize>());
        inner.put_u32(items.len() as u32);
        for item in items {
            inner.put_u32(item.len() as u32);
            inner.put_slice(item);
        }
        self.put_bytes(field, &inner)
    }

    /// A bincode-encoded value.
    pub fn put_serde<T: Serialize>(&mut self, field: u16, value: &T) -> CodecResult<&mut Self> {
        let encoded =
            bincode::serialize(value).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        Ok(self.put_bytes(field, &encoded))
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads a field-encoded body.
#[derive(Debug, Clone, Default)]
pub struct FieldReader {
    fields: BTreeMap<u16, Bytes>,
}

impl FieldReader {
    /// Split a body into fields. A repeated field keeps its last value.
    pub fn parse(mut body: Bytes) -> CodecResult<Self> {
        let mut fields = BTreeMap::new();
        while body.has_remaining() {
            if body.remaining() < 6 {
                return Err(NetworkError::Deserialization(
                    "truncated field header".to_string(),
                ));
            }
            let field = body.get_u16();
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(NetworkError::Deserialization(format!(
                    "field {} truncated: {} of {} bytes",
                    field,
                    body.remaining(),
                    len
                )));
            }
            fields.insert(field, body.split_to(len));
        }
        Ok(Self { fields })
    }

    pub fn contains(&self, field: u16) -> bool {
        self.fields.contains_key(&field)
    }

    fn required(&self, field: u16) -> CodecResult<&Bytes> {
        self.fields
            .get(&field)
            .ok_or_else(|| NetworkError::Deserialization(format!("missing field {}", field)))
    }

    fn fixed<const N: usize>(field: u16, raw: &Bytes) -> CodecResult<[u8; N]> {
        raw.as_ref().try_into().map_err(|_| {
            NetworkError::Deserialization(format!(
                "field {} has {} bytes, expected {}",
                field,
                raw.len(),
                N
            ))
        })
    }

    pub fn bytes(&self, field: u16) -> CodecResult<Bytes> {
        self.required(field).cloned()
    }

    pub fn opt_bytes(&self, field: u16) -> Option<Bytes> {
        self.fields.get(&field).cloned()
    }

    pub fn u64(&self, field: u16) -> CodecResult<u64> {
        let raw = self.required(field)?;
        Ok(u64::from_be_bytes(Self::fixed(field, raw)?))
    }

    pub fn opt_u64(&self, field: u16) -> CodecResult<Option<u64>> {
        match self.fields.get(&field) {
            Some(raw) => Ok(Some(u64::from_be_bytes(Self::fixed(field, raw)?))),
            None => Ok(None),
        }
    }

    pub fn u64_or(&self, field: u16, default: u64) -> CodecResult<u64> {
        Ok(self.opt_u64(field)?.unwrap_or(default))
    }

    pub fn i64_or(&self, field: u16, default: i64) -> CodecResult<i64> {
        match self.fields.get(&field) {
            Some(raw) => Ok(i64::from_be_bytes(Self::fixed(field, raw)?)),
            None => Ok(default),
        }
    }

    pub fn bool_or(&self, field: u16, default: bool) -> CodecResult<bool> {
        match self.fields.get(&field) {
            Some(raw) => Ok(Self::fixed::<1>(field, raw)?[0] != 0),
            None => Ok(default),
        }
    }

    pub fn string(&self, field: u16) -> CodecResult<String> {
        let raw = self.required(field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| NetworkError::Deserialization(format!("field {}: {}", field, e)))
    }

    pub fn string_or(&self, field: u16, default: &str) -> CodecResult<String> {
        if self.contains(field) {
            self.string(field)
        } else {
            Ok(default.to_string())
        }
    }

    /// A list written by [`FieldWriter::put_list`]. Missing reads as empty.
    pub fn list(&self, field: u16) -> CodecResult<Vec<Bytes>> {
        let Some(raw) = self.fields.get(&field) else {
            return Ok(Vec::new());
        };
        let truncated =
            || NetworkError::Deserialization(format!("list field {} truncated", field));

        let mut raw = raw.clone();
        if raw.remaining() < 4 {
            return Err(truncated());
        }
        let count = raw.get_u32() as usize;
        let mut items = Vec::with_capacity(count.min(raw.remaining() / 4));
        for _ in 0..count {
            if raw.remaining() < 4 {
                return Err(truncated());
            }
            let len = raw.get_u32() as usize;
            if raw.remaining() < len {
                return Err(truncated());
            }
            items.push(raw.split_to(len));
        }
        Ok(items)
    }

    pub fn serde<T: DeserializeOwned>(&self, field: u16) -> CodecResult<T> {
        let raw = self.required(field)?;
        bincode::deserialize(raw)
            .map_err(|e| NetworkError::Deserialization(format!("field {}: {}", field, e)))
    }

    pub fn serde_or_default<T: DeserializeOwned + Default>(&self, field: u16) -> CodecResult<T> {
        if self.contains(field) {
            self.serde(field)
        } else {
            Ok(T::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        let mut body = FieldWriter::new();
        body.put_str(1, "default").put_u64(3, 42);
        Frame::new(1001, NodeVersion::FIFTEEN, 7, body.finish())
    }

    #[test]
    fn test_frame_roundtrip() {
        let original = frame();
        let encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), original.encoded_len());
        assert_eq!(encoded[0], FRAME_MAGIC);

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let encoded = frame().encode().unwrap();
        let mut corrupted = encoded.to_vec();
        corrupted[FRAME_HEADER_LEN + 2] ^= 0xFF;

        assert!(matches!(
            Frame::decode(Bytes::from(corrupted)),
            Err(NetworkError::Checksum { .. })
        ));
        assert!(Frame::decode(Bytes::from_static(&[FRAME_MAGIC, 0, 1])).is_err());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut writer = FieldWriter::new();
        writer
            .put_u64(1, 5)
            .put_bytes(99, b"from a newer peer")
            .put_bool(2, true);
        let reader = FieldReader::parse(writer.finish()).unwrap();

        assert_eq!(reader.u64(1).unwrap(), 5);
        assert!(reader.bool_or(2, false).unwrap());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let reader = FieldReader::parse(Bytes::new()).unwrap();
        assert_eq!(reader.u64_or(4, 11).unwrap(), 11);
        assert_eq!(reader.i64_or(5, -1).unwrap(), -1);
        assert!(!reader.bool_or(6, false).unwrap());
        assert!(reader.list(7).unwrap().is_empty());
        assert_eq!(reader.opt_u64(8).unwrap(), None);
        assert!(reader.u64(1).is_err());
    }

    #[test]
    fn test_list_and_serde_fields() {
        let items = vec![Bytes::from_static(b"a"), Bytes::new(), Bytes::from_static(b"ccc")];
        let mut writer = FieldWriter::new();
        writer.put_list(1, &items);
        writer.put_serde(2, &(3u32, "x".to_string())).unwrap();
        let reader = FieldReader::parse(writer.finish()).unwrap();

        assert_eq!(reader.list(1).unwrap(), items);
        let decoded: (u32, String) = reader.serde(2).unwrap();
        assert_eq!(decoded, (3, "x".to_string()));
    }

    #[test]
    fn test_truncated_body() {
        let mut writer = FieldWriter::new();
        writer.put_bytes(1, b"abcdef");
        let body = writer.finish();
        assert!(FieldReader::parse(body.slice(..body.len() - 2)).is_err());
    }
}
