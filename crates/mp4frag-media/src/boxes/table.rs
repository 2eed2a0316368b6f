//! Sample table boxes (`stbl` children).

use super::{put_full_box_header, read_full_box_header, BoxType, Inspector, LeafBox, ParseBox};
use crate::stream::PayloadReader;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

fn read_count(r: &mut PayloadReader<'_>, entry_size: usize) -> Result<usize> {
    let count = r.u32()? as usize;
    if count > r.remaining() / entry_size {
        return Err(Error::invalid_format(format!(
            "entry count {count} exceeds payload"
        )));
    }
    Ok(count)
}

/// Decoding time-to-sample box: run-length `(sample_count, sample_delta)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SttsBox {
    pub entries: Vec<(u32, u32)>,
}

impl ParseBox for SttsBox {
    const TYPE: BoxType = BoxType::STTS;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let count = read_count(r, 8)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push((r.u32()?, r.u32()?));
        }
        Ok(Self { entries })
    }
}

impl LeafBox for SttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 8 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entries.len() as u32);
        for &(count, delta) in &self.entries {
            buf.put_u32(count);
            buf.put_u32(delta);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

/// Composition offset box: run-length `(sample_count, offset)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CttsBox {
    pub version: u8,
    pub entries: Vec<(u32, i32)>,
}

impl ParseBox for CttsBox {
    const TYPE: BoxType = BoxType::CTTS;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let count = read_count(r, 8)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push((r.u32()?, r.i32()?));
        }
        Ok(Self { version, entries })
    }
}

impl LeafBox for CttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 8 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, self.version, 0);
        buf.put_u32(self.entries.len() as u32);
        for &(count, offset) in &self.entries {
            buf.put_u32(count);
            buf.put_i32(offset);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

/// Sync sample box: 1-based sample numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StssBox {
    pub entries: Vec<u32>,
}

impl ParseBox for StssBox {
    const TYPE: BoxType = BoxType::STSS;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let count = read_count(r, 4)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(r.u32()?);
        }
        Ok(Self { entries })
    }
}

impl LeafBox for StssBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 4 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entries.len() as u32);
        for &n in &self.entries {
            buf.put_u32(n);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

/// One sample-to-chunk run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    /// 1-based.
    pub sample_description_index: u32,
}

/// Sample-to-chunk box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

impl ParseBox for StscBox {
    const TYPE: BoxType = BoxType::STSC;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let count = read_count(r, 12)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(StscEntry {
                first_chunk: r.u32()?,
                samples_per_chunk: r.u32()?,
                sample_description_index: r.u32()?,
            });
        }
        Ok(Self { entries })
    }
}

impl LeafBox for StscBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 12 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_u32(e.first_chunk);
            buf.put_u32(e.samples_per_chunk);
            buf.put_u32(e.sample_description_index);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

/// Sample size box. When `sample_size` is non-zero every sample has that
/// size and `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StszBox {
    pub sample_size: u32,
    pub sample_count: u32,
    pub entries: Vec<u32>,
}

impl StszBox {
    /// Size of a sample by 0-based index.
    pub fn size_of(&self, index: usize) -> Option<u32> {
        if self.sample_size != 0 {
            (index < self.sample_count as usize).then_some(self.sample_size)
        } else {
            self.entries.get(index).copied()
        }
    }
}

impl ParseBox for StszBox {
    const TYPE: BoxType = BoxType::STSZ;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let sample_size = r.u32()?;
        if sample_size != 0 {
            let sample_count = r.u32()?;
            return Ok(Self {
                sample_size,
                sample_count,
                entries: Vec::new(),
            });
        }
        let count = read_count(r, 4)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(r.u32()?);
        }
        Ok(Self {
            sample_size,
            sample_count: count as u32,
            entries,
        })
    }
}

impl LeafBox for StszBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        if self.sample_size != 0 {
            12
        } else {
            12 + 4 * self.entries.len() as u64
        }
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.sample_size);
        if self.sample_size != 0 {
            buf.put_u32(self.sample_count);
        } else {
            buf.put_u32(self.entries.len() as u32);
            for &size in &self.entries {
                buf.put_u32(size);
            }
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("sample_size", &self.sample_size);
        inspector.field("sample_count", &self.sample_count);
    }
}

/// 32-bit chunk offset box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StcoBox {
    pub entries: Vec<u32>,
}

impl ParseBox for StcoBox {
    const TYPE: BoxType = BoxType::STCO;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let count = read_count(r, 4)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(r.u32()?);
        }
        Ok(Self { entries })
    }
}

impl LeafBox for StcoBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 4 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entries.len() as u32);
        for &offset in &self.entries {
            buf.put_u32(offset);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

/// 64-bit chunk offset box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Co64Box {
    pub entries: Vec<u64>,
}

impl ParseBox for Co64Box {
    const TYPE: BoxType = BoxType::CO64;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let count = read_count(r, 8)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(r.u64()?);
        }
        Ok(Self { entries })
    }
}

impl LeafBox for Co64Box {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 8 * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entries.len() as u32);
        for &offset in &self.entries {
            buf.put_u64(offset);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stsz_uniform_size() {
        let stsz = StszBox {
            sample_size: 100,
            sample_count: 3,
            entries: Vec::new(),
        };
        assert_eq!(stsz.size_of(2), Some(100));
        assert_eq!(stsz.size_of(3), None);
    }

    #[test]
    fn test_stsz_parse_per_sample() {
        let payload = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 10, 0, 0, 0, 20];
        let mut r = PayloadReader::new(&payload, "stsz");
        let stsz = StszBox::parse(&mut r).unwrap();
        assert_eq!(stsz.sample_count, 2);
        assert_eq!(stsz.entries, vec![10, 20]);
    }

    #[test]
    fn test_entry_count_larger_than_payload_is_rejected() {
        let payload = [0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut r = PayloadReader::new(&payload, "stco");
        let err = StcoBox::parse(&mut r).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidFormat);
    }
}
