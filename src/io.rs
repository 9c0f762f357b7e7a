use std::{convert::TryInto, io::Read, mem::size_of};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: Read>(reader: &mut R) -> Self;
}

pub fn read_into<T: Decodeable, R: Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("io error, expect {}", bytes_count));
    buffer
}

/// Growing byte sink used to assemble page images and journal records
/// before they hit the file.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }

        buf.resize(size, 0);
        buf
    }
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

// The on-disk formats (volume head page, journal records) are
// big-endian throughout.
macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_be_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

/// # Format
///
/// - 2 bytes: length (big-endian)
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        let len = self.len() as u16;
        buffer.extend_from_slice(&len.to_be_bytes());
        buffer.extend_from_slice(self);

        buffer
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let len = u16::decode_from(reader);
        read_exact(reader, len as usize)
    }
}

impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec().encode()
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let bytes = Vec::<u8>::decode_from(reader);
        String::from_utf8(bytes).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn integer_round_trip() {
        let mut w = ByteWriter::new();
        w.write(&0xDEAD_BEEFu32);
        w.write(&42u64);
        w.write(&7u8);

        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 13);

        let mut r = Cursor::new(bytes);
        assert_eq!(u32::decode_from(&mut r), 0xDEAD_BEEF);
        assert_eq!(u64::decode_from(&mut r), 42);
        assert_eq!(u8::decode_from(&mut r), 7);
    }

    #[test]
    fn length_prefixed_bytes() {
        let payload: Vec<u8> = vec![1, 2, 3, 4, 5];
        let encoded = payload.encode();
        assert_eq!(&encoded[..2], &[0, 5]);

        let mut r = Cursor::new(encoded);
        let decoded: Vec<u8> = read_into(&mut r);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn padded_bytes() {
        let mut w = ByteWriter::new();
        w.write_bytes(&[9, 9]);
        let padded = w.to_padded_bytes(8);
        assert_eq!(padded, vec![9, 9, 0, 0, 0, 0, 0, 0]);
    }
}
