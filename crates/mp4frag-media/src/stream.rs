//! Byte stream helpers.
//!
//! Every component reads and writes through `std::io::{Read, Write, Seek}`.
//! This module adds the positioned helpers the box writers need: `tell`,
//! stream sizing, exact reads at an offset, and seek-back patching that
//! restores the write cursor afterwards.

use crate::{Error, Result};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// In-memory stream, used for tests and small outputs.
pub type MemoryStream = Cursor<Vec<u8>>;

/// Object-safe combination of `Read + Seek`.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Object-safe combination of `Write + Seek`.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek + ?Sized> WriteSeek for T {}

/// Current stream position.
pub fn tell<S: Seek + ?Sized>(stream: &mut S) -> Result<u64> {
    Ok(stream.stream_position()?)
}

/// Total stream size. The current position is preserved.
pub fn stream_size<S: Seek + ?Sized>(stream: &mut S) -> Result<u64> {
    let here = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(here))?;
    Ok(end)
}

/// Read exactly `len` bytes starting at `pos`.
pub fn read_at<R: Read + Seek + ?Sized>(reader: &mut R, pos: u64, len: usize) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(pos))?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Overwrite `bytes` at `pos`, then return to the position that was current
/// before the patch.
pub fn patch_at<W: Write + Seek + ?Sized>(writer: &mut W, pos: u64, bytes: &[u8]) -> Result<()> {
    let here = writer.stream_position()?;
    writer.seek(SeekFrom::Start(pos))?;
    writer.write_all(bytes)?;
    writer.seek(SeekFrom::Start(here))?;
    Ok(())
}

/// Checked big-endian reader over an in-memory box payload.
///
/// Every accessor fails with `InvalidFormat` instead of panicking when the
/// payload is shorter than the field being read.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> PayloadReader<'a> {
    /// Wrap a payload. `context` names the box in error messages.
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current offset in the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Take the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::invalid_format(format!(
                "{}: need {} bytes at offset {}, have {}",
                self.context,
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Take everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Result<u32> {
        let b = self.bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    /// Read a big-endian unsigned integer of 1 to 4 bytes.
    pub fn uint(&mut self, width: usize) -> Result<u32> {
        let b = self.bytes(width)?;
        Ok(b.iter().fold(0u32, |acc, &x| (acc << 8) | x as u32))
    }

    pub fn fourcc(&mut self) -> Result<[u8; 4]> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_restores_position() {
        let mut stream = MemoryStream::default();
        stream.write_all(&[0u8; 16]).unwrap();
        patch_at(&mut stream, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(tell(&mut stream).unwrap(), 16);
        stream.write_all(&[9]).unwrap();

        let data = stream.into_inner();
        assert_eq!(&data[4..8], &[1, 2, 3, 4]);
        assert_eq!(data[16], 9);
    }

    #[test]
    fn test_stream_size_keeps_position() {
        let mut stream = MemoryStream::new(vec![0u8; 100]);
        stream.seek(SeekFrom::Start(10)).unwrap();
        assert_eq!(stream_size(&mut stream).unwrap(), 100);
        assert_eq!(tell(&mut stream).unwrap(), 10);
    }

    #[test]
    fn test_payload_reader_bounds() {
        let data = [0x00, 0x01, 0x02, 0x03, 0x04];
        let mut r = PayloadReader::new(&data, "test");
        assert_eq!(r.u16().unwrap(), 0x0001);
        assert_eq!(r.u24().unwrap(), 0x020304);
        assert_eq!(r.remaining(), 0);
        let err = r.u8().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_payload_reader_variable_width() {
        let data = [0x01, 0x02, 0x03];
        let mut r = PayloadReader::new(&data, "test");
        assert_eq!(r.uint(3).unwrap(), 0x010203);
    }

    #[test]
    fn test_read_at() {
        let mut stream = MemoryStream::new((0u8..32).collect());
        let data = read_at(&mut stream, 8, 4).unwrap();
        assert_eq!(data, vec![8, 9, 10, 11]);
        assert!(read_at(&mut stream, 30, 4).is_err());
    }
}
