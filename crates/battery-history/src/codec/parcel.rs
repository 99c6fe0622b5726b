//! Four-byte aligned little-endian primitives for history records.
//!
//! Every value written here occupies a multiple of four bytes, so a payload
//! made only of these writes always has a length divisible by four. Segment
//! loading relies on that to reject misaligned payloads as corrupt.

use crate::error::{HistoryError, Result};

/// Appends aligned primitives to a byte buffer.
pub struct ParcelWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ParcelWriter<'a> {
    /// Wraps `buf`; writes are appended after any existing content.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Current length of the underlying buffer.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Writes a signed 32-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an unsigned 32-bit integer.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a signed 64-bit integer.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a 64-bit float.
    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a length-prefixed UTF-8 string padded to a four-byte boundary.
    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.write_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
        let padding = padded_len(bytes.len()) - bytes.len();
        self.buf.extend(std::iter::repeat(0u8).take(padding));
    }
}

/// Reads aligned primitives from a byte slice.
#[derive(Debug, Clone)]
pub struct ParcelReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ParcelReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Byte offset of the next read.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(HistoryError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Reads an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Reads a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads a 64-bit float.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Reads a string written by [`ParcelWriter::write_string`].
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(HistoryError::CorruptSegment(format!(
                "negative string length {}",
                len
            )));
        }
        let len = len as usize;
        let bytes = self.take(padded_len(len))?;
        String::from_utf8(bytes[..len].to_vec())
            .map_err(|err| HistoryError::CorruptSegment(format!("invalid tag string: {}", err)))
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_padding_keeps_alignment() {
        for s in ["", "a", "ab", "abc", "abcd", "wake:alarm"] {
            let mut buf = Vec::new();
            ParcelWriter::new(&mut buf).write_string(s);
            assert_eq!(buf.len() % 4, 0, "misaligned for {:?}", s);

            let mut reader = ParcelReader::new(&buf);
            assert_eq!(reader.read_string().unwrap(), s);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_mixed_primitives() {
        let mut buf = Vec::new();
        let mut writer = ParcelWriter::new(&mut buf);
        writer.write_i32(-7);
        writer.write_i64(i64::MIN);
        writer.write_f64(2.5);
        writer.write_u32(0xdead_beef);
        assert_eq!(writer.position(), 24);

        let mut reader = ParcelReader::new(&buf);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_i64().unwrap(), i64::MIN);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_truncated_read() {
        let buf = [1u8, 2, 3];
        let mut reader = ParcelReader::new(&buf);
        match reader.read_i32() {
            Err(HistoryError::Truncated { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 3);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_string_length_is_corrupt() {
        let mut buf = Vec::new();
        ParcelWriter::new(&mut buf).write_i32(-2);
        let err = ParcelReader::new(&buf).read_string().unwrap_err();
        assert!(err.is_corruption());
    }
}
