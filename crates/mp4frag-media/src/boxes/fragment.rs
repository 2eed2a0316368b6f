//! Movie extends and movie fragment boxes.

use super::{put_full_box_header, read_full_box_header, BoxType, Inspector, LeafBox, ParseBox};
use crate::stream::PayloadReader;
use crate::Result;
use bytes::{BufMut, BytesMut};

/// `sample_is_non_sync_sample` bit of the sample flags word.
pub const SAMPLE_FLAG_IS_NON_SYNC: u32 = 0x0001_0000;

/// Movie extends header box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MehdBox {
    pub fragment_duration: u64,
}

impl ParseBox for MehdBox {
    const TYPE: BoxType = BoxType::MEHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let fragment_duration = if version == 1 { r.u64()? } else { r.u32()? as u64 };
        Ok(Self { fragment_duration })
    }
}

impl LeafBox for MehdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        if self.fragment_duration > u32::MAX as u64 {
            12
        } else {
            8
        }
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        if self.fragment_duration > u32::MAX as u64 {
            put_full_box_header(buf, 1, 0);
            buf.put_u64(self.fragment_duration);
        } else {
            put_full_box_header(buf, 0, 0);
            buf.put_u32(self.fragment_duration as u32);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("fragment_duration", &self.fragment_duration);
    }
}

/// Track extends box: per-track fragment defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl TrexBox {
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            default_sample_description_index: 1,
            default_sample_duration: 0,
            default_sample_size: 0,
            default_sample_flags: 0,
        }
    }
}

impl ParseBox for TrexBox {
    const TYPE: BoxType = BoxType::TREX;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        Ok(Self {
            track_id: r.u32()?,
            default_sample_description_index: r.u32()?,
            default_sample_duration: r.u32()?,
            default_sample_size: r.u32()?,
            default_sample_flags: r.u32()?,
        })
    }
}

impl LeafBox for TrexBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        24
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.track_id);
        buf.put_u32(self.default_sample_description_index);
        buf.put_u32(self.default_sample_duration);
        buf.put_u32(self.default_sample_size);
        buf.put_u32(self.default_sample_flags);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("track_id", &self.track_id);
        inspector.field(
            "default_sample_description_index",
            &self.default_sample_description_index,
        );
        inspector.field("default_sample_duration", &self.default_sample_duration);
        inspector.field("default_sample_size", &self.default_sample_size);
        inspector.field("default_sample_flags", &format!("{:08x}", self.default_sample_flags));
    }
}

/// Movie fragment header box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl ParseBox for MfhdBox {
    const TYPE: BoxType = BoxType::MFHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        Ok(Self {
            sequence_number: r.u32()?,
        })
    }
}

impl LeafBox for MfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.sequence_number);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("sequence_number", &self.sequence_number);
    }
}

/// Track fragment header box.
///
/// Optional fields are present in the serialized form exactly when they are
/// `Some`; the flags word is derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub duration_is_empty: bool,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    pub const FLAG_BASE_DATA_OFFSET: u32 = 0x00_0001;
    pub const FLAG_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
    pub const FLAG_DEFAULT_SAMPLE_DURATION: u32 = 0x00_0008;
    pub const FLAG_DEFAULT_SAMPLE_SIZE: u32 = 0x00_0010;
    pub const FLAG_DEFAULT_SAMPLE_FLAGS: u32 = 0x00_0020;
    pub const FLAG_DURATION_IS_EMPTY: u32 = 0x01_0000;
    pub const FLAG_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            base_data_offset: None,
            sample_description_index: None,
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: None,
            duration_is_empty: false,
            default_base_is_moof: false,
        }
    }

    /// Flags word implied by the present fields.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.base_data_offset.is_some() {
            flags |= Self::FLAG_BASE_DATA_OFFSET;
        }
        if self.sample_description_index.is_some() {
            flags |= Self::FLAG_SAMPLE_DESCRIPTION_INDEX;
        }
        if self.default_sample_duration.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_DURATION;
        }
        if self.default_sample_size.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_SIZE;
        }
        if self.default_sample_flags.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_FLAGS;
        }
        if self.duration_is_empty {
            flags |= Self::FLAG_DURATION_IS_EMPTY;
        }
        if self.default_base_is_moof {
            flags |= Self::FLAG_DEFAULT_BASE_IS_MOOF;
        }
        flags
    }
}

impl ParseBox for TfhdBox {
    const TYPE: BoxType = BoxType::TFHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (_, flags) = read_full_box_header(r)?;
        let mut tfhd = Self::new(r.u32()?);
        if flags & Self::FLAG_BASE_DATA_OFFSET != 0 {
            tfhd.base_data_offset = Some(r.u64()?);
        }
        if flags & Self::FLAG_SAMPLE_DESCRIPTION_INDEX != 0 {
            tfhd.sample_description_index = Some(r.u32()?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_DURATION != 0 {
            tfhd.default_sample_duration = Some(r.u32()?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_SIZE != 0 {
            tfhd.default_sample_size = Some(r.u32()?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_FLAGS != 0 {
            tfhd.default_sample_flags = Some(r.u32()?);
        }
        tfhd.duration_is_empty = flags & Self::FLAG_DURATION_IS_EMPTY != 0;
        tfhd.default_base_is_moof = flags & Self::FLAG_DEFAULT_BASE_IS_MOOF != 0;
        Ok(tfhd)
    }
}

impl LeafBox for TfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + self.base_data_offset.map_or(0, |_| 8)
            + self.sample_description_index.map_or(0, |_| 4)
            + self.default_sample_duration.map_or(0, |_| 4)
            + self.default_sample_size.map_or(0, |_| 4)
            + self.default_sample_flags.map_or(0, |_| 4)
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, self.flags());
        buf.put_u32(self.track_id);
        if let Some(v) = self.base_data_offset {
            buf.put_u64(v);
        }
        if let Some(v) = self.sample_description_index {
            buf.put_u32(v);
        }
        if let Some(v) = self.default_sample_duration {
            buf.put_u32(v);
        }
        if let Some(v) = self.default_sample_size {
            buf.put_u32(v);
        }
        if let Some(v) = self.default_sample_flags {
            buf.put_u32(v);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("flags", &format!("{:06x}", self.flags()));
        inspector.field("track_id", &self.track_id);
        if let Some(v) = self.base_data_offset {
            inspector.field("base_data_offset", &v);
        }
        if let Some(v) = self.sample_description_index {
            inspector.field("sample_description_index", &v);
        }
        if let Some(v) = self.default_sample_duration {
            inspector.field("default_sample_duration", &v);
        }
        if let Some(v) = self.default_sample_size {
            inspector.field("default_sample_size", &v);
        }
        if let Some(v) = self.default_sample_flags {
            inspector.field("default_sample_flags", &format!("{v:08x}"));
        }
    }
}

/// Track fragment decode time box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfdtBox {
    pub version: u8,
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    /// Version 1 (64-bit) decode time box.
    pub fn new(base_media_decode_time: u64) -> Self {
        Self {
            version: 1,
            base_media_decode_time,
        }
    }

    fn effective_version(&self) -> u8 {
        if self.version == 1 || self.base_media_decode_time > u32::MAX as u64 {
            1
        } else {
            0
        }
    }
}

impl ParseBox for TfdtBox {
    const TYPE: BoxType = BoxType::TFDT;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let base_media_decode_time = if version == 1 { r.u64()? } else { r.u32()? as u64 };
        Ok(Self {
            version,
            base_media_decode_time,
        })
    }
}

impl LeafBox for TfdtBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        if self.effective_version() == 1 {
            12
        } else {
            8
        }
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        if version == 1 {
            buf.put_u64(self.base_media_decode_time);
        } else {
            buf.put_u32(self.base_media_decode_time as u32);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("base_media_decode_time", &self.base_media_decode_time);
    }
}

/// One track run entry. Fields absent from the run's flags are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunEntry {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
    pub sample_composition_time_offset: i32,
}

/// Track fragment run box.
///
/// Unlike `tfhd`, the flags word is stored: it decides which per-sample
/// fields every entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrunBox {
    pub version: u8,
    pub flags: u32,
    pub data_offset: i32,
    pub first_sample_flags: u32,
    pub entries: Vec<TrunEntry>,
}

impl TrunBox {
    pub const FLAG_DATA_OFFSET: u32 = 0x00_0001;
    pub const FLAG_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
    pub const FLAG_SAMPLE_DURATION: u32 = 0x00_0100;
    pub const FLAG_SAMPLE_SIZE: u32 = 0x00_0200;
    pub const FLAG_SAMPLE_FLAGS: u32 = 0x00_0400;
    pub const FLAG_SAMPLE_COMPOSITION_TIME_OFFSET: u32 = 0x00_0800;

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn entry_size(&self) -> u64 {
        [
            Self::FLAG_SAMPLE_DURATION,
            Self::FLAG_SAMPLE_SIZE,
            Self::FLAG_SAMPLE_FLAGS,
            Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET,
        ]
        .iter()
        .filter(|&&f| self.has(f))
        .count() as u64
            * 4
    }
}

impl ParseBox for TrunBox {
    const TYPE: BoxType = BoxType::TRUN;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, flags) = read_full_box_header(r)?;
        let mut trun = Self {
            version,
            flags,
            ..Default::default()
        };
        let count = r.u32()? as usize;
        if trun.has(Self::FLAG_DATA_OFFSET) {
            trun.data_offset = r.i32()?;
        }
        if trun.has(Self::FLAG_FIRST_SAMPLE_FLAGS) {
            trun.first_sample_flags = r.u32()?;
        }
        let entry_size = trun.entry_size() as usize;
        if entry_size > 0 && count > r.remaining() / entry_size {
            return Err(crate::Error::invalid_format(format!(
                "trun sample count {count} exceeds payload"
            )));
        }
        trun.entries.reserve(count.min(1 << 20));
        for _ in 0..count {
            let mut entry = TrunEntry::default();
            if trun.has(Self::FLAG_SAMPLE_DURATION) {
                entry.sample_duration = r.u32()?;
            }
            if trun.has(Self::FLAG_SAMPLE_SIZE) {
                entry.sample_size = r.u32()?;
            }
            if trun.has(Self::FLAG_SAMPLE_FLAGS) {
                entry.sample_flags = r.u32()?;
            }
            if trun.has(Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET) {
                entry.sample_composition_time_offset = r.i32()?;
            }
            trun.entries.push(entry);
        }
        Ok(trun)
    }
}

impl LeafBox for TrunBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let mut size = 8;
        if self.has(Self::FLAG_DATA_OFFSET) {
            size += 4;
        }
        if self.has(Self::FLAG_FIRST_SAMPLE_FLAGS) {
            size += 4;
        }
        size + self.entry_size() * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, self.version, self.flags);
        buf.put_u32(self.entries.len() as u32);
        if self.has(Self::FLAG_DATA_OFFSET) {
            buf.put_i32(self.data_offset);
        }
        if self.has(Self::FLAG_FIRST_SAMPLE_FLAGS) {
            buf.put_u32(self.first_sample_flags);
        }
        for e in &self.entries {
            if self.has(Self::FLAG_SAMPLE_DURATION) {
                buf.put_u32(e.sample_duration);
            }
            if self.has(Self::FLAG_SAMPLE_SIZE) {
                buf.put_u32(e.sample_size);
            }
            if self.has(Self::FLAG_SAMPLE_FLAGS) {
                buf.put_u32(e.sample_flags);
            }
            if self.has(Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET) {
                buf.put_i32(e.sample_composition_time_offset);
            }
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("flags", &format!("{:06x}", self.flags));
        inspector.field("sample_count", &self.entries.len());
        if self.has(Self::FLAG_DATA_OFFSET) {
            inspector.field("data_offset", &self.data_offset);
        }
        if self.has(Self::FLAG_FIRST_SAMPLE_FLAGS) {
            inspector.field("first_sample_flags", &format!("{:08x}", self.first_sample_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{parse_box, Mp4Box};

    #[test]
    fn test_tfhd_flags_follow_fields() {
        let mut tfhd = TfhdBox::new(1);
        tfhd.default_base_is_moof = true;
        tfhd.default_sample_flags = Some(0x0101_0000);
        assert_eq!(
            tfhd.flags(),
            TfhdBox::FLAG_DEFAULT_BASE_IS_MOOF | TfhdBox::FLAG_DEFAULT_SAMPLE_FLAGS
        );

        let b: Mp4Box = tfhd.into();
        assert_eq!(b.size(), 8 + 8 + 4);
        let parsed = parse_box(&b.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.as_tfhd(), Some(&tfhd));
    }

    #[test]
    fn test_trun_size_depends_on_flags() {
        let trun = TrunBox {
            version: 0,
            flags: TrunBox::FLAG_DATA_OFFSET | TrunBox::FLAG_SAMPLE_SIZE,
            data_offset: 100,
            first_sample_flags: 0,
            entries: vec![
                TrunEntry {
                    sample_size: 10,
                    ..Default::default()
                },
                TrunEntry {
                    sample_size: 20,
                    ..Default::default()
                },
            ],
        };
        let b: Mp4Box = trun.clone().into();
        assert_eq!(b.size(), 8 + 8 + 4 + 2 * 4);
        let parsed = parse_box(&b.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.as_trun(), Some(&trun));
    }

    #[test]
    fn test_trun_negative_composition_offset() {
        let trun = TrunBox {
            version: 1,
            flags: TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET,
            entries: vec![TrunEntry {
                sample_composition_time_offset: -512,
                ..Default::default()
            }],
            ..Default::default()
        };
        let b: Mp4Box = trun.into();
        let parsed = parse_box(&b.to_bytes().unwrap()).unwrap();
        assert_eq!(
            parsed.as_trun().unwrap().entries[0].sample_composition_time_offset,
            -512
        );
    }

    #[test]
    fn test_tfdt_promotes_to_64_bit() {
        let tfdt = TfdtBox {
            version: 0,
            base_media_decode_time: u32::MAX as u64 + 10,
        };
        let b: Mp4Box = tfdt.into();
        assert_eq!(b.size(), 20);
    }
}
