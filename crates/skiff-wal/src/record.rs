//! On-disk record framing with varint length and CRC32C checksumming.
//!
//! Record format:
//! - len: varint (payload length)
//! - payload: bytes[len]
//! - crc32c: u32 (little-endian, over len + payload)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("incomplete record")]
    Incomplete,
}

/// A framed record carrying an opaque payload.
///
/// The payload is produced by the caller (the consensus core stores
/// bincode-encoded log entries); this layer only guarantees that a
/// decoded record is byte-identical to what was appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Bytes,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the record into bytes with a trailing CRC32C checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 16);

        encode_varint(&mut buf, self.payload.len() as u64);
        buf.put_slice(&self.payload);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        buf.freeze()
    }

    /// Decodes a record from the front of `data`, validating the checksum.
    ///
    /// Returns the record and the number of bytes consumed. A truncated
    /// buffer yields `Incomplete`; a corrupted one yields `CrcMismatch`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        let mut cursor = data;

        let len = decode_varint(&mut cursor)? as usize;
        if cursor.len() < len {
            return Err(RecordError::Incomplete);
        }

        let payload = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);

        if cursor.len() < 4 {
            return Err(RecordError::Incomplete);
        }
        let stored_crc = cursor.get_u32_le();

        let bytes_consumed = data.len() - cursor.len();
        let calculated_crc = crc32c::crc32c(&data[..bytes_consumed - 4]);
        if stored_crc != calculated_crc {
            return Err(RecordError::CrcMismatch {
                expected: stored_crc,
                actual: calculated_crc,
            });
        }

        Ok((Record { payload }, bytes_consumed))
    }
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint overflow").into());
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let test_cases = vec![0u64, 127, 128, 255, 16383, 16384, u64::MAX];

        for value in test_cases {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            let decoded = decode_varint(&mut slice).unwrap();
            assert_eq!(value, decoded, "varint roundtrip failed for {}", value);
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = Record::new(b"hello world".as_slice());
        let encoded = record.encode();
        let (decoded, size) = Record::decode(&encoded).unwrap();

        assert_eq!(record, decoded);
        assert_eq!(size, encoded.len());
    }

    #[test]
    fn test_empty_payload() {
        let record = Record::new(Bytes::new());
        let encoded = record.encode();
        let (decoded, size) = Record::decode(&encoded).unwrap();

        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(size, encoded.len());
    }

    #[test]
    fn test_crc_mismatch() {
        let record = Record::new(b"consensus".as_slice());
        let encoded = record.encode();

        let mut corrupted = encoded.to_vec();
        corrupted[3] ^= 0xFF;

        let result = Record::decode(&corrupted);
        assert!(matches!(result, Err(RecordError::CrcMismatch { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let record = Record::new(b"truncated tail".as_slice());
        let encoded = record.encode();

        let result = Record::decode(&encoded[..encoded.len() - 5]);
        assert!(matches!(result, Err(RecordError::Incomplete)));
    }

    #[test]
    fn test_back_to_back_records() {
        let a = Record::new(b"first".as_slice());
        let b = Record::new(b"second".as_slice());

        let mut buf = BytesMut::new();
        buf.put_slice(&a.encode());
        buf.put_slice(&b.encode());
        let data = buf.freeze();

        let (da, consumed) = Record::decode(&data).unwrap();
        let (db, _) = Record::decode(&data[consumed..]).unwrap();

        assert_eq!(da, a);
        assert_eq!(db, b);
    }
}
