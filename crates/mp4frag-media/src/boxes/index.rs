//! Segment index and random access boxes.

use super::{put_full_box_header, read_full_box_header, BoxType, Inspector, LeafBox, ParseBox};
use crate::stream::PayloadReader;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// One `sidx` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SidxReference {
    /// `true` when the reference points at another `sidx`.
    pub reference_type: bool,
    /// 31-bit size of the referenced material.
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    /// 3-bit SAP type.
    pub sap_type: u8,
    /// 28-bit SAP delta time.
    pub sap_delta_time: u32,
}

/// Segment index box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SidxBox {
    pub version: u8,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

impl SidxBox {
    fn effective_version(&self) -> u8 {
        if self.version == 1
            || self.earliest_presentation_time > u32::MAX as u64
            || self.first_offset > u32::MAX as u64
        {
            1
        } else {
            0
        }
    }
}

impl ParseBox for SidxBox {
    const TYPE: BoxType = BoxType::SIDX;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let reference_id = r.u32()?;
        let timescale = r.u32()?;
        let (earliest_presentation_time, first_offset) = if version == 1 {
            (r.u64()?, r.u64()?)
        } else {
            (r.u32()? as u64, r.u32()? as u64)
        };
        r.skip(2)?;
        let count = r.u16()? as usize;
        let mut references = Vec::with_capacity(count);
        for _ in 0..count {
            let word = r.u32()?;
            let subsegment_duration = r.u32()?;
            let sap = r.u32()?;
            references.push(SidxReference {
                reference_type: word >> 31 == 1,
                referenced_size: word & 0x7FFF_FFFF,
                subsegment_duration,
                starts_with_sap: sap >> 31 == 1,
                sap_type: ((sap >> 28) & 0x7) as u8,
                sap_delta_time: sap & 0x0FFF_FFFF,
            });
        }
        Ok(Self {
            version,
            reference_id,
            timescale,
            earliest_presentation_time,
            first_offset,
            references,
        })
    }
}

impl LeafBox for SidxBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let times = if self.effective_version() == 1 { 16 } else { 8 };
        4 + 8 + times + 4 + 12 * self.references.len() as u64
    }

    fn check_encodable(&self) -> Result<()> {
        if self.references.len() > u16::MAX as usize {
            return Err(Error::invalid_parameters(format!(
                "sidx holds {} references, at most {} fit",
                self.references.len(),
                u16::MAX
            )));
        }
        if let Some(reference) = self.references.iter().find(|r| r.referenced_size > 0x7FFF_FFFF) {
            return Err(Error::invalid_parameters(format!(
                "sidx referenced size {} does not fit in 31 bits",
                reference.referenced_size
            )));
        }
        Ok(())
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        buf.put_u32(self.reference_id);
        buf.put_u32(self.timescale);
        if version == 1 {
            buf.put_u64(self.earliest_presentation_time);
            buf.put_u64(self.first_offset);
        } else {
            buf.put_u32(self.earliest_presentation_time as u32);
            buf.put_u32(self.first_offset as u32);
        }
        buf.put_u16(0);
        buf.put_u16(self.references.len() as u16);
        for reference in &self.references {
            buf.put_u32(
                ((reference.reference_type as u32) << 31)
                    | (reference.referenced_size & 0x7FFF_FFFF),
            );
            buf.put_u32(reference.subsegment_duration);
            buf.put_u32(
                ((reference.starts_with_sap as u32) << 31)
                    | (((reference.sap_type & 0x7) as u32) << 28)
                    | (reference.sap_delta_time & 0x0FFF_FFFF),
            );
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("reference_id", &self.reference_id);
        inspector.field("timescale", &self.timescale);
        inspector.field("earliest_presentation_time", &self.earliest_presentation_time);
        inspector.field("first_offset", &self.first_offset);
        for reference in &self.references {
            inspector.field(
                "reference",
                &format!(
                    "size={} duration={} sap={}",
                    reference.referenced_size, reference.subsegment_duration, reference.starts_with_sap
                ),
            );
        }
    }
}

/// One random access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfraEntry {
    pub time: u64,
    pub moof_offset: u64,
    /// 1-based.
    pub traf_number: u32,
    /// 1-based.
    pub trun_number: u32,
    /// 1-based.
    pub sample_number: u32,
}

impl TfraEntry {
    /// Entry pointing at the first sample of the first run of the first
    /// track fragment of a `moof`.
    pub fn new(time: u64, moof_offset: u64) -> Self {
        Self {
            time,
            moof_offset,
            traf_number: 1,
            trun_number: 1,
            sample_number: 1,
        }
    }
}

/// Track fragment random access box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfraBox {
    pub version: u8,
    pub track_id: u32,
    /// Byte widths (1 to 4) of the traf, trun and sample number fields.
    pub traf_number_size: u8,
    pub trun_number_size: u8,
    pub sample_number_size: u8,
    pub entries: Vec<TfraEntry>,
}

impl TfraBox {
    pub fn new(track_id: u32) -> Self {
        Self {
            version: 0,
            track_id,
            traf_number_size: 1,
            trun_number_size: 1,
            sample_number_size: 1,
            entries: Vec::new(),
        }
    }

    fn effective_version(&self) -> u8 {
        let wide = self
            .entries
            .iter()
            .any(|e| e.time > u32::MAX as u64 || e.moof_offset > u32::MAX as u64);
        if self.version == 1 || wide {
            1
        } else {
            0
        }
    }
}

fn put_uint(buf: &mut BytesMut, value: u32, width: u8) {
    let bytes = value.to_be_bytes();
    buf.put_slice(&bytes[4 - width as usize..]);
}

impl ParseBox for TfraBox {
    const TYPE: BoxType = BoxType::TFRA;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let track_id = r.u32()?;
        let lengths = r.u32()?;
        let traf_number_size = ((lengths >> 4) & 0x3) as u8 + 1;
        let trun_number_size = ((lengths >> 2) & 0x3) as u8 + 1;
        let sample_number_size = (lengths & 0x3) as u8 + 1;
        let count = r.u32()? as usize;
        let entry_size = if version == 1 { 16 } else { 8 }
            + (traf_number_size + trun_number_size + sample_number_size) as usize;
        if count > r.remaining() / entry_size {
            return Err(Error::invalid_format(format!(
                "tfra entry count {count} exceeds payload"
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (time, moof_offset) = if version == 1 {
                (r.u64()?, r.u64()?)
            } else {
                (r.u32()? as u64, r.u32()? as u64)
            };
            entries.push(TfraEntry {
                time,
                moof_offset,
                traf_number: r.uint(traf_number_size as usize)?,
                trun_number: r.uint(trun_number_size as usize)?,
                sample_number: r.uint(sample_number_size as usize)?,
            });
        }
        Ok(Self {
            version,
            track_id,
            traf_number_size,
            trun_number_size,
            sample_number_size,
            entries,
        })
    }
}

impl LeafBox for TfraBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let times = if self.effective_version() == 1 { 16 } else { 8 };
        let entry_size = times
            + (self.traf_number_size + self.trun_number_size + self.sample_number_size) as u64;
        16 + entry_size * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        buf.put_u32(self.track_id);
        let lengths = (((self.traf_number_size - 1) & 0x3) as u32) << 4
            | (((self.trun_number_size - 1) & 0x3) as u32) << 2
            | ((self.sample_number_size - 1) & 0x3) as u32;
        buf.put_u32(lengths);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            if version == 1 {
                buf.put_u64(e.time);
                buf.put_u64(e.moof_offset);
            } else {
                buf.put_u32(e.time as u32);
                buf.put_u32(e.moof_offset as u32);
            }
            put_uint(buf, e.traf_number, self.traf_number_size);
            put_uint(buf, e.trun_number, self.trun_number_size);
            put_uint(buf, e.sample_number, self.sample_number_size);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("track_id", &self.track_id);
        inspector.field("entry_count", &self.entries.len());
        for e in &self.entries {
            inspector.field(
                "entry",
                &format!("time={} moof_offset={}", e.time, e.moof_offset),
            );
        }
    }
}

/// Movie fragment random access offset box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfroBox {
    /// Size of the enclosing `mfra`, this box included.
    pub mfra_size: u32,
}

impl ParseBox for MfroBox {
    const TYPE: BoxType = BoxType::MFRO;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        Ok(Self {
            mfra_size: r.u32()?,
        })
    }
}

impl LeafBox for MfroBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.mfra_size);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("mfra_size", &self.mfra_size);
    }
}
