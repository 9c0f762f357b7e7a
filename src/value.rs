use std::convert::TryInto;

use crate::{error::DbError, types::{DbResult, PageAddress}};

/// Encoded size of a long-record descriptor stored in place of an
/// oversized value.
pub const LONG_RECORD_SIZE: usize = 26;

/// Number of leading payload bytes mirrored into the descriptor.
pub const LONG_RECORD_PREFIX_SIZE: usize = 14;

/// Hard bound on the number of pages in one long-record chain. A chain
/// that runs past this bound is corrupt.
pub const MAX_LONG_RECORD_CHAIN: usize = 5_000;

/// A value buffer owned by a cursor. Fetch operations replace its
/// contents; store operations read from it.
#[derive(Clone, Default)]
pub struct Value {
    bytes: Vec<u8>,
}

impl Value {
    pub fn new() -> Value {
        Value { bytes: Vec::new() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Value {
        Value {
            bytes: bytes.to_vec(),
        }
    }

    pub fn put(&mut self, bytes: &[u8]) -> &mut Value {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn clear(&mut self) -> &mut Value {
        self.bytes.clear();
        self
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fixed 26-byte record pointing at a long-record chain:
/// total size, head page of the chain, and the first
/// `LONG_RECORD_PREFIX_SIZE` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongRecordDescriptor {
    pub total_size: u32,
    pub head_page: PageAddress,
    pub prefix: [u8; LONG_RECORD_PREFIX_SIZE],
}

impl LongRecordDescriptor {
    pub fn new(total_size: u32, head_page: PageAddress, payload: &[u8]) -> LongRecordDescriptor {
        let mut prefix = [0u8; LONG_RECORD_PREFIX_SIZE];
        let n = payload.len().min(LONG_RECORD_PREFIX_SIZE);
        prefix[..n].copy_from_slice(&payload[..n]);
        LongRecordDescriptor {
            total_size,
            head_page,
            prefix,
        }
    }

    pub fn encode(&self) -> [u8; LONG_RECORD_SIZE] {
        let mut out = [0u8; LONG_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.total_size.to_be_bytes());
        out[4..12].copy_from_slice(&self.head_page.to_be_bytes());
        out[12..26].copy_from_slice(&self.prefix);
        out
    }

    pub fn decode(bytes: &[u8]) -> DbResult<LongRecordDescriptor> {
        if bytes.len() != LONG_RECORD_SIZE {
            return Err(DbError::corruption(&format!(
                "long-record descriptor has {} bytes, expected {}",
                bytes.len(),
                LONG_RECORD_SIZE
            )));
        }
        let total_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let head_page = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
        let mut prefix = [0u8; LONG_RECORD_PREFIX_SIZE];
        prefix.copy_from_slice(&bytes[12..26]);
        Ok(LongRecordDescriptor {
            total_size,
            head_page,
            prefix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trip() {
        let payload = vec![7u8; 100];
        let d = LongRecordDescriptor::new(payload.len() as u32, 42, &payload);
        let encoded = d.encode();
        assert_eq!(encoded.len(), LONG_RECORD_SIZE);

        let decoded = LongRecordDescriptor::decode(&encoded).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.total_size, 100);
        assert_eq!(decoded.head_page, 42);
        assert_eq!(decoded.prefix, [7u8; LONG_RECORD_PREFIX_SIZE]);
    }

    #[test]
    fn short_payload_pads_prefix() {
        let d = LongRecordDescriptor::new(3, 9, &[1, 2, 3]);
        assert_eq!(&d.prefix[..3], &[1, 2, 3]);
        assert_eq!(&d.prefix[3..], &[0u8; LONG_RECORD_PREFIX_SIZE - 3]);
    }

    #[test]
    fn truncated_descriptor_is_corrupt() {
        assert!(LongRecordDescriptor::decode(&[0u8; 10]).is_err());
    }
}
