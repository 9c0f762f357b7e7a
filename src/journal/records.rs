use std::convert::TryInto;

use crate::{
    error::DbError,
    types::{DbResult, JournalAddress, Timestamp},
};

/// Every journal record starts with the same 12-byte frame:
/// `{length: u16, type: u8, reserved: u8, timestamp: u64}`.
/// `length` covers the frame itself.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Largest encodable record; larger payloads (TX envelopes, PM/TM
/// snapshots) are chained across several records.
pub const MAX_RECORD_SIZE: usize = u16::MAX as usize;

/// Magic number opening every `JH` record.
pub const JH_MAGIC: u32 = 0x4A52_4E4C;

/// Journal format version.
pub const JOURNAL_VERSION: u32 = 2;

/// Encoded size of a `JE` record.
pub const JE_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Journal header, first record of every file.
    JH,
    /// Journal end: clean shutdown marker.
    JE,
    /// Checkpoint.
    CP,
    /// Identify volume: binds a volume handle to a name and id.
    IV,
    /// Identify tree: binds a tree handle to (volume handle, name).
    IT,
    /// Page image.
    PA,
    /// Page map snapshot, written after rollover.
    PM,
    /// Transaction map snapshot, written after rollover.
    TM,
    /// Transaction envelope (chunk); inner records follow the header.
    TX,
    /// Inner record: store.
    SR,
    /// Inner record: delete range.
    DR,
    /// Inner record: delete tree.
    DT,
    /// Inner record: cache update (accumulator snapshot), parsed and
    /// ignored by the default recovery listener.
    CU,
}

impl RecordType {
    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::JH => 1,
            RecordType::JE => 2,
            RecordType::CP => 3,
            RecordType::IV => 4,
            RecordType::IT => 5,
            RecordType::PA => 6,
            RecordType::PM => 7,
            RecordType::TM => 8,
            RecordType::TX => 9,
            RecordType::SR => 10,
            RecordType::DR => 11,
            RecordType::DT => 12,
            RecordType::CU => 13,
        }
    }

    pub fn from_u8(value: u8) -> DbResult<RecordType> {
        match value {
            1 => Ok(RecordType::JH),
            2 => Ok(RecordType::JE),
            3 => Ok(RecordType::CP),
            4 => Ok(RecordType::IV),
            5 => Ok(RecordType::IT),
            6 => Ok(RecordType::PA),
            7 => Ok(RecordType::PM),
            8 => Ok(RecordType::TM),
            9 => Ok(RecordType::TX),
            10 => Ok(RecordType::SR),
            11 => Ok(RecordType::DR),
            12 => Ok(RecordType::DT),
            13 => Ok(RecordType::CU),
            _ => Err(DbError::corruption(&format!(
                "invalid journal record type: {}",
                value
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordType::JH => "JH",
            RecordType::JE => "JE",
            RecordType::CP => "CP",
            RecordType::IV => "IV",
            RecordType::IT => "IT",
            RecordType::PA => "PA",
            RecordType::PM => "PM",
            RecordType::TM => "TM",
            RecordType::TX => "TX",
            RecordType::SR => "SR",
            RecordType::DR => "DR",
            RecordType::DT => "DT",
            RecordType::CU => "CU",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub length: usize,
    pub rtype: RecordType,
    pub timestamp: Timestamp,
}

/// Frame a record. Panics if the payload does not fit one record; the
/// callers that can exceed the bound (TX, PM, TM) chunk beforehand.
pub fn encode_record(rtype: RecordType, timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let length = RECORD_HEADER_SIZE + payload.len();
    assert!(length <= MAX_RECORD_SIZE, "record too large: {}", length);

    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.push(rtype.to_u8());
    out.push(0u8);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn decode_header(bytes: &[u8]) -> DbResult<RecordHeader> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(DbError::corruption("journal record header truncated"));
    }
    let length = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
    if length < RECORD_HEADER_SIZE {
        return Err(DbError::corruption(&format!(
            "bad journal record length: {}",
            length
        )));
    }
    let rtype = RecordType::from_u8(bytes[2])?;
    let timestamp = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
    Ok(RecordHeader {
        length,
        rtype,
        timestamp,
    })
}

/// Checked cursor over a record payload; every overrun is corruption,
/// never a panic.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> RecordReader<'a> {
        RecordReader { buf, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn take(&mut self, count: usize) -> DbResult<&'a [u8]> {
        if self.cursor + count > self.buf.len() {
            return Err(DbError::corruption("journal record payload truncated"));
        }
        let slice = &self.buf[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(slice)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.cursor..];
        self.cursor = self.buf.len();
        slice
    }

    pub fn u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> DbResult<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> DbResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> DbResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn string(&mut self) -> DbResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DbError::corruption("journal record holds invalid utf-8"))
    }
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

// ----------------------------------------------------------------------
// typed payloads

pub struct JhRecord {
    pub block_size: u64,
    pub base_address: JournalAddress,
    pub current_address: JournalAddress,
}

impl JhRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        out.extend_from_slice(&JH_MAGIC.to_be_bytes());
        out.extend_from_slice(&JOURNAL_VERSION.to_be_bytes());
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out.extend_from_slice(&self.base_address.to_be_bytes());
        out.extend_from_slice(&self.current_address.to_be_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> DbResult<JhRecord> {
        let mut r = RecordReader::new(payload);
        let magic = r.u32()?;
        if magic != JH_MAGIC {
            return Err(DbError::corruption("bad journal header magic"));
        }
        let version = r.u32()?;
        if version != JOURNAL_VERSION {
            return Err(DbError::corruption(&format!(
                "unsupported journal version: {}",
                version
            )));
        }
        Ok(JhRecord {
            block_size: r.u64()?,
            base_address: r.u64()?,
            current_address: r.u64()?,
        })
    }
}

pub struct PaRecord<'a> {
    pub volume_handle: u32,
    pub page_address: u64,
    pub bytes: &'a [u8],
}

impl<'a> PaRecord<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + self.bytes.len());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        out.extend_from_slice(&self.page_address.to_be_bytes());
        out.extend_from_slice(&(self.bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(self.bytes);
        out
    }

    pub fn decode(payload: &'a [u8]) -> DbResult<PaRecord<'a>> {
        let mut r = RecordReader::new(payload);
        let volume_handle = r.u32()?;
        let page_address = r.u64()?;
        let len = r.u16()? as usize;
        let bytes = r.take(len)?;
        Ok(PaRecord {
            volume_handle,
            page_address,
            bytes,
        })
    }
}

/// SR value flag: the value bytes are a long-record descriptor whose
/// chain pages precede this envelope in the journal.
pub const SR_LONG_RECORD: u8 = 0x01;

/// One record inside a `TX` envelope. The frame's timestamp slot
/// carries the transaction step number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerRecord {
    Store {
        tree: u32,
        flags: u8,
        key: Vec<u8>,
        value: Vec<u8>,
        step: u64,
    },
    DeleteRange {
        tree: u32,
        low: Vec<u8>,
        high: Vec<u8>,
        step: u64,
    },
    DeleteTree {
        tree: u32,
        step: u64,
    },
    CacheUpdate {
        tree: u32,
        payload: Vec<u8>,
        step: u64,
    },
}

impl InnerRecord {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            InnerRecord::Store {
                tree,
                flags,
                key,
                value,
                step,
            } => {
                let mut payload = Vec::with_capacity(7 + key.len() + value.len());
                payload.extend_from_slice(&tree.to_be_bytes());
                payload.push(*flags);
                payload.extend_from_slice(&(key.len() as u16).to_be_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
                encode_record(RecordType::SR, *step, &payload)
            }
            InnerRecord::DeleteRange {
                tree,
                low,
                high,
                step,
            } => {
                let mut payload = Vec::with_capacity(8 + low.len() + high.len());
                payload.extend_from_slice(&tree.to_be_bytes());
                payload.extend_from_slice(&(low.len() as u16).to_be_bytes());
                payload.extend_from_slice(&(high.len() as u16).to_be_bytes());
                payload.extend_from_slice(low);
                payload.extend_from_slice(high);
                encode_record(RecordType::DR, *step, &payload)
            }
            InnerRecord::DeleteTree { tree, step } => {
                encode_record(RecordType::DT, *step, &tree.to_be_bytes())
            }
            InnerRecord::CacheUpdate {
                tree,
                payload,
                step,
            } => {
                let mut body = Vec::with_capacity(6 + payload.len());
                body.extend_from_slice(&tree.to_be_bytes());
                body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                body.extend_from_slice(payload);
                encode_record(RecordType::CU, *step, &body)
            }
        }
    }

    /// Parse the concatenated inner records of an assembled envelope.
    pub fn parse_stream(bytes: &[u8]) -> DbResult<Vec<InnerRecord>> {
        let mut records = Vec::new();
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            let header = decode_header(&bytes[cursor..])?;
            if cursor + header.length > bytes.len() {
                return Err(DbError::corruption("inner record overruns its envelope"));
            }
            let payload = &bytes[cursor + RECORD_HEADER_SIZE..cursor + header.length];
            let step = header.timestamp;
            let mut r = RecordReader::new(payload);

            let record = match header.rtype {
                RecordType::SR => {
                    let tree = r.u32()?;
                    let flags = r.u8()?;
                    let klen = r.u16()? as usize;
                    let key = r.take(klen)?.to_vec();
                    let value = r.rest().to_vec();
                    InnerRecord::Store {
                        tree,
                        flags,
                        key,
                        value,
                        step,
                    }
                }
                RecordType::DR => {
                    let tree = r.u32()?;
                    let llen = r.u16()? as usize;
                    let hlen = r.u16()? as usize;
                    let low = r.take(llen)?.to_vec();
                    let high = r.take(hlen)?.to_vec();
                    InnerRecord::DeleteRange {
                        tree,
                        low,
                        high,
                        step,
                    }
                }
                RecordType::DT => InnerRecord::DeleteTree {
                    tree: r.u32()?,
                    step,
                },
                RecordType::CU => {
                    let tree = r.u32()?;
                    let len = r.u16()? as usize;
                    let payload = r.take(len)?.to_vec();
                    InnerRecord::CacheUpdate {
                        tree,
                        payload,
                        step,
                    }
                }
                other => {
                    return Err(DbError::corruption(&format!(
                        "unexpected {} record inside a TX envelope",
                        other.name()
                    )))
                }
            };
            records.push(record);
            cursor += header.length;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_frame_round_trip() {
        let record = encode_record(RecordType::CP, 42, &[1, 2, 3]);
        assert_eq!(record.len(), 15);

        let header = decode_header(&record).unwrap();
        assert_eq!(header.length, 15);
        assert_eq!(header.rtype, RecordType::CP);
        assert_eq!(header.timestamp, 42);
        assert_eq!(&record[RECORD_HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn bad_type_is_corruption() {
        let mut record = encode_record(RecordType::CP, 1, &[]);
        record[2] = 200;
        assert!(decode_header(&record).is_err());
    }

    #[test]
    fn jh_round_trip() {
        let jh = JhRecord {
            block_size: 1 << 24,
            base_address: 100,
            current_address: 200,
        };
        let decoded = JhRecord::decode(&jh.encode()).unwrap();
        assert_eq!(decoded.block_size, 1 << 24);
        assert_eq!(decoded.base_address, 100);
        assert_eq!(decoded.current_address, 200);
    }

    #[test]
    fn jh_bad_magic() {
        let mut payload = JhRecord {
            block_size: 1,
            base_address: 0,
            current_address: 0,
        }
        .encode();
        payload[0] = 0;
        assert!(JhRecord::decode(&payload).is_err());
    }

    #[test]
    fn pa_round_trip() {
        let image = vec![7u8; 128];
        let pa = PaRecord {
            volume_handle: 3,
            page_address: 99,
            bytes: &image,
        };
        let encoded = pa.encode();
        let decoded = PaRecord::decode(&encoded).unwrap();
        assert_eq!(decoded.volume_handle, 3);
        assert_eq!(decoded.page_address, 99);
        assert_eq!(decoded.bytes, image.as_slice());
    }

    #[test]
    fn reader_overrun_is_corruption() {
        let mut r = RecordReader::new(&[1, 2]);
        assert!(r.u64().is_err());
    }

    #[test]
    fn inner_record_stream_round_trip() {
        let records = vec![
            InnerRecord::Store {
                tree: 7,
                flags: 0,
                key: vec![1, 0],
                value: vec![9, 9, 9],
                step: 1,
            },
            InnerRecord::DeleteRange {
                tree: 7,
                low: vec![2, 0],
                high: vec![5, 0],
                step: 2,
            },
            InnerRecord::DeleteTree { tree: 8, step: 3 },
            InnerRecord::CacheUpdate {
                tree: 7,
                payload: vec![0xAA],
                step: 4,
            },
        ];

        let mut stream = Vec::new();
        for r in records.iter() {
            stream.extend_from_slice(&r.encode());
        }

        let parsed = InnerRecord::parse_stream(&stream).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn truncated_inner_stream_is_corruption() {
        let record = InnerRecord::DeleteTree { tree: 1, step: 0 }.encode();
        assert!(InnerRecord::parse_stream(&record[..record.len() - 1]).is_err());
    }
}
