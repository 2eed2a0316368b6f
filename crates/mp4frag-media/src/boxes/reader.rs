//! Box parsing from streams and byte slices.

use super::{BoxHeader, BoxType, MdatBox, Mp4Box, BOX_HEADER_SIZE, BOX_LARGE_HEADER_SIZE};
use crate::{Error, Result};
use std::io::{Read, Seek, SeekFrom};
use tracing::trace;

/// Maximum payload size (256 MB) of a box read into memory, to prevent OOM
/// on malformed files. `mdat` is never read and is exempt.
pub const MAX_BOX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;

fn decode_header(bytes: &[u8], available: u64) -> Result<Option<BoxHeader>> {
    if bytes.len() < BOX_HEADER_SIZE as usize {
        return Ok(None);
    }
    let size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64;
    let box_type = BoxType([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let (size, header_size) = match size {
        1 => {
            let ext = bytes
                .get(8..16)
                .ok_or_else(|| Error::invalid_format(format!("{box_type}: truncated 64-bit size")))?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(ext);
            (u64::from_be_bytes(arr), BOX_LARGE_HEADER_SIZE)
        }
        // Box extends to the end of its parent.
        0 => (available, BOX_HEADER_SIZE),
        n => (n, BOX_HEADER_SIZE),
    };

    if size < header_size {
        return Err(Error::invalid_format(format!(
            "{box_type}: size {size} smaller than its header"
        )));
    }
    if size > available {
        return Err(Error::invalid_format(format!(
            "{box_type}: size {size} exceeds the {available} bytes available"
        )));
    }
    Ok(Some(BoxHeader {
        box_type,
        size,
        header_size,
    }))
}

/// Parse one complete box (header included) from a byte slice.
pub fn parse_box(bytes: &[u8]) -> Result<Mp4Box> {
    let header = decode_header(bytes, bytes.len() as u64)?
        .ok_or_else(|| Error::invalid_format("truncated box header"))?;
    let payload = &bytes[header.header_size as usize..header.size as usize];
    Mp4Box::from_payload(header.box_type, payload)
}

/// Parse a sequence of sibling boxes filling a container payload.
pub(super) fn parse_children(payload: &[u8]) -> Result<Vec<Mp4Box>> {
    let mut children = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let rest = &payload[pos..];
        let Some(header) = decode_header(rest, rest.len() as u64)? else {
            trace!(bytes = rest.len(), "ignoring trailing bytes in container");
            break;
        };
        let body = &rest[header.header_size as usize..header.size as usize];
        children.push(Mp4Box::from_payload(header.box_type, body)?);
        pos += header.size as usize;
    }
    Ok(children)
}

/// Iterator over the boxes of a stream range, yielding `(offset, box)`.
///
/// `mdat` payloads are skipped over and reported as [`MdatBox`] locations.
/// Iteration stops at the end of the range, when fewer than 8 bytes remain,
/// or after the first error.
pub struct BoxReader<'a, R: ?Sized> {
    reader: &'a mut R,
    pos: u64,
    end: u64,
}

impl<'a, R: Read + Seek + ?Sized> BoxReader<'a, R> {
    /// Read every box from the start of the stream.
    pub fn new(reader: &'a mut R) -> Result<Self> {
        let end = crate::stream::stream_size(reader)?;
        Ok(Self::with_range(reader, 0, end))
    }

    /// Read boxes located between `start` and `end`.
    pub fn with_range(reader: &'a mut R, start: u64, end: u64) -> Self {
        Self {
            reader,
            pos: start,
            end,
        }
    }

    /// Offset of the next box.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn read_next(&mut self) -> Result<Option<(u64, Mp4Box)>> {
        let available = self.end.saturating_sub(self.pos);
        if available < BOX_HEADER_SIZE {
            return Ok(None);
        }
        self.reader.seek(SeekFrom::Start(self.pos))?;
        let mut raw = [0u8; 16];
        let want = available.min(16) as usize;
        self.reader.read_exact(&mut raw[..want])?;
        let Some(header) = decode_header(&raw[..want], available)? else {
            return Ok(None);
        };

        let offset = self.pos;
        let payload_offset = offset + header.header_size;
        let payload_size = header.payload_size();

        let parsed = if header.box_type == BoxType::MDAT {
            Mp4Box::Mdat(MdatBox {
                payload_offset,
                payload_size,
            })
        } else {
            if payload_size > MAX_BOX_PAYLOAD_SIZE {
                return Err(Error::invalid_format(format!(
                    "{} payload size {} exceeds maximum {}",
                    header.box_type, payload_size, MAX_BOX_PAYLOAD_SIZE
                )));
            }
            let payload = crate::stream::read_at(&mut *self.reader, payload_offset, payload_size as usize)?;
            Mp4Box::from_payload(header.box_type, &payload)?
        };

        trace!(box_type = %header.box_type, offset, size = header.size, "read box");
        self.pos = offset + header.size;
        Ok(Some((offset, parsed)))
    }
}

impl<R: Read + Seek + ?Sized> Iterator for BoxReader<'_, R> {
    type Item = Result<(u64, Mp4Box)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn raw_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_reader_lists_top_level_boxes() {
        let mut data = raw_box(b"ftyp", b"isom\0\0\0\x01isom");
        data.extend(raw_box(b"mdat", &[0u8; 20]));
        data.extend(raw_box(b"free", &[]));
        let mut stream = MemoryStream::new(data);

        let boxes: Vec<_> = BoxReader::new(&mut stream)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(boxes.len(), 3);
        assert_eq!(boxes[0].0, 0);
        assert_eq!(boxes[0].1.as_ftyp().unwrap().major_brand, BoxType(*b"isom"));
        assert_eq!(
            boxes[1].1,
            Mp4Box::Mdat(MdatBox {
                payload_offset: 28,
                payload_size: 20
            })
        );
        assert_eq!(boxes[2].0, 48);
    }

    #[test]
    fn test_size_zero_extends_to_end() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[1u8; 12]);
        let mut stream = MemoryStream::new(data);
        let (_, b) = BoxReader::new(&mut stream).unwrap().next().unwrap().unwrap();
        assert_eq!(b.size(), 20);
    }

    #[test]
    fn test_large_size_header() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(b"free");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let b = parse_box(&data).unwrap();
        assert_eq!(b.box_type(), BoxType::FREE);
        // Re-serialized with a compact header.
        assert_eq!(b.size(), 16);
    }

    #[test]
    fn test_truncated_box_is_an_error() {
        let mut data = raw_box(b"free", &[0u8; 8]);
        data.truncate(12);
        let mut stream = MemoryStream::new(data);
        let mut reader = BoxReader::new(&mut stream).unwrap();
        assert_eq!(
            reader.next().unwrap().unwrap_err().kind(),
            crate::ErrorKind::InvalidFormat
        );
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_nested_container_parse() {
        let mfhd = raw_box(b"mfhd", &[0, 0, 0, 0, 0, 0, 0, 5]);
        let moof = raw_box(b"moof", &mfhd);
        let b = parse_box(&moof).unwrap();
        let seq = b.child(BoxType::MFHD).and_then(Mp4Box::as_mfhd).unwrap().sequence_number;
        assert_eq!(seq, 5);
    }
}
