//! Movie-level and track-level header boxes.

use super::{
    put_full_box_header, read_full_box_header, BoxType, Inspector, LeafBox, ParseBox,
};
use crate::stream::PayloadReader;
use crate::Result;
use bytes::{BufMut, BytesMut};

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// File type box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtypBox {
    pub major_brand: BoxType,
    pub minor_version: u32,
    pub compatible_brands: Vec<BoxType>,
}

impl FtypBox {
    pub fn has_compatible_brand(&self, brand: BoxType) -> bool {
        self.compatible_brands.contains(&brand)
    }
}

impl ParseBox for FtypBox {
    const TYPE: BoxType = BoxType::FTYP;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let major_brand = BoxType(r.fourcc()?);
        let minor_version = r.u32()?;
        let mut compatible_brands = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            compatible_brands.push(BoxType(r.fourcc()?));
        }
        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }
}

impl LeafBox for FtypBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + 4 * self.compatible_brands.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.major_brand.0);
        buf.put_u32(self.minor_version);
        for brand in &self.compatible_brands {
            buf.put_slice(&brand.0);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("major_brand", &self.major_brand);
        inspector.field("minor_version", &self.minor_version);
        let brands: Vec<&str> = self.compatible_brands.iter().map(BoxType::as_str).collect();
        inspector.field("compatible_brands", &brands.join(","));
    }
}

/// Movie header box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvhdBox {
    pub version: u8,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub rate: u32,
    pub volume: u16,
    pub matrix: [u32; 9],
    pub next_track_id: u32,
}

impl MvhdBox {
    pub fn new(timescale: u32, duration: u64, next_track_id: u32) -> Self {
        Self {
            version: 0,
            creation_time: 0,
            modification_time: 0,
            timescale,
            duration,
            rate: 0x0001_0000,
            volume: 0x0100,
            matrix: UNITY_MATRIX,
            next_track_id,
        }
    }

    fn effective_version(&self) -> u8 {
        if self.version == 1 || self.duration > u32::MAX as u64 {
            1
        } else {
            0
        }
    }
}

impl ParseBox for MvhdBox {
    const TYPE: BoxType = BoxType::MVHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let (creation_time, modification_time, timescale, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u64()?)
        } else {
            (r.u32()? as u64, r.u32()? as u64, r.u32()?, r.u32()? as u64)
        };
        let rate = r.u32()?;
        let volume = r.u16()?;
        r.skip(10)?;
        let mut matrix = [0u32; 9];
        for value in matrix.iter_mut() {
            *value = r.u32()?;
        }
        r.skip(24)?;
        let next_track_id = r.u32()?;
        Ok(Self {
            version,
            creation_time,
            modification_time,
            timescale,
            duration,
            rate,
            volume,
            matrix,
            next_track_id,
        })
    }
}

impl LeafBox for MvhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let times = if self.effective_version() == 1 { 28 } else { 16 };
        4 + times + 80
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        if version == 1 {
            buf.put_u64(self.creation_time);
            buf.put_u64(self.modification_time);
            buf.put_u32(self.timescale);
            buf.put_u64(self.duration);
        } else {
            buf.put_u32(self.creation_time as u32);
            buf.put_u32(self.modification_time as u32);
            buf.put_u32(self.timescale);
            buf.put_u32(self.duration as u32);
        }
        buf.put_u32(self.rate);
        buf.put_u16(self.volume);
        buf.put_bytes(0, 10);
        for value in &self.matrix {
            buf.put_u32(*value);
        }
        buf.put_bytes(0, 24);
        buf.put_u32(self.next_track_id);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("timescale", &self.timescale);
        inspector.field("duration", &self.duration);
        inspector.field("next_track_id", &self.next_track_id);
    }
}

/// Track header box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkhdBox {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub duration: u64,
    pub layer: u16,
    pub alternate_group: u16,
    pub volume: u16,
    pub matrix: [u32; 9],
    /// 16.16 fixed point.
    pub width: u32,
    /// 16.16 fixed point.
    pub height: u32,
}

impl TkhdBox {
    /// Enabled, in-movie, in-preview.
    pub const DEFAULT_FLAGS: u32 = 0x7;

    pub fn new(track_id: u32, duration: u64) -> Self {
        Self {
            version: 0,
            flags: Self::DEFAULT_FLAGS,
            creation_time: 0,
            modification_time: 0,
            track_id,
            duration,
            layer: 0,
            alternate_group: 0,
            volume: 0,
            matrix: UNITY_MATRIX,
            width: 0,
            height: 0,
        }
    }

    fn effective_version(&self) -> u8 {
        if self.version == 1 || self.duration > u32::MAX as u64 {
            1
        } else {
            0
        }
    }
}

impl ParseBox for TkhdBox {
    const TYPE: BoxType = BoxType::TKHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, flags) = read_full_box_header(r)?;
        let (creation_time, modification_time, track_id, duration) = if version == 1 {
            let c = r.u64()?;
            let m = r.u64()?;
            let id = r.u32()?;
            r.skip(4)?;
            (c, m, id, r.u64()?)
        } else {
            let c = r.u32()? as u64;
            let m = r.u32()? as u64;
            let id = r.u32()?;
            r.skip(4)?;
            (c, m, id, r.u32()? as u64)
        };
        r.skip(8)?;
        let layer = r.u16()?;
        let alternate_group = r.u16()?;
        let volume = r.u16()?;
        r.skip(2)?;
        let mut matrix = [0u32; 9];
        for value in matrix.iter_mut() {
            *value = r.u32()?;
        }
        let width = r.u32()?;
        let height = r.u32()?;
        Ok(Self {
            version,
            flags,
            creation_time,
            modification_time,
            track_id,
            duration,
            layer,
            alternate_group,
            volume,
            matrix,
            width,
            height,
        })
    }
}

impl LeafBox for TkhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let times = if self.effective_version() == 1 { 32 } else { 20 };
        4 + times + 60
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, self.flags);
        if version == 1 {
            buf.put_u64(self.creation_time);
            buf.put_u64(self.modification_time);
            buf.put_u32(self.track_id);
            buf.put_u32(0);
            buf.put_u64(self.duration);
        } else {
            buf.put_u32(self.creation_time as u32);
            buf.put_u32(self.modification_time as u32);
            buf.put_u32(self.track_id);
            buf.put_u32(0);
            buf.put_u32(self.duration as u32);
        }
        buf.put_bytes(0, 8);
        buf.put_u16(self.layer);
        buf.put_u16(self.alternate_group);
        buf.put_u16(self.volume);
        buf.put_u16(0);
        for value in &self.matrix {
            buf.put_u32(*value);
        }
        buf.put_u32(self.width);
        buf.put_u32(self.height);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("track_id", &self.track_id);
        inspector.field("duration", &self.duration);
        inspector.field("width", &(self.width >> 16));
        inspector.field("height", &(self.height >> 16));
    }
}

/// Media header box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdhdBox {
    pub version: u8,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    /// Packed ISO-639-2/T language code.
    pub language: u16,
}

impl MdhdBox {
    /// Packed code for "und".
    pub const LANGUAGE_UNDETERMINED: u16 = 0x55C4;

    pub fn new(timescale: u32, duration: u64) -> Self {
        Self {
            version: 0,
            creation_time: 0,
            modification_time: 0,
            timescale,
            duration,
            language: Self::LANGUAGE_UNDETERMINED,
        }
    }

    /// Unpacked three-letter language code.
    pub fn language_code(&self) -> String {
        (0..3)
            .rev()
            .map(|i| (((self.language >> (i * 5)) & 0x1F) as u8 + 0x60) as char)
            .collect()
    }

    fn effective_version(&self) -> u8 {
        if self.version == 1 || self.duration > u32::MAX as u64 {
            1
        } else {
            0
        }
    }
}

impl ParseBox for MdhdBox {
    const TYPE: BoxType = BoxType::MDHD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let (creation_time, modification_time, timescale, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u64()?)
        } else {
            (r.u32()? as u64, r.u32()? as u64, r.u32()?, r.u32()? as u64)
        };
        let language = r.u16()?;
        Ok(Self {
            version,
            creation_time,
            modification_time,
            timescale,
            duration,
            language,
        })
    }
}

impl LeafBox for MdhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let times = if self.effective_version() == 1 { 28 } else { 16 };
        4 + times + 4
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        if version == 1 {
            buf.put_u64(self.creation_time);
            buf.put_u64(self.modification_time);
            buf.put_u32(self.timescale);
            buf.put_u64(self.duration);
        } else {
            buf.put_u32(self.creation_time as u32);
            buf.put_u32(self.modification_time as u32);
            buf.put_u32(self.timescale);
            buf.put_u32(self.duration as u32);
        }
        buf.put_u16(self.language);
        buf.put_u16(0);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("timescale", &self.timescale);
        inspector.field("duration", &self.duration);
        inspector.field("language", &self.language_code());
    }
}

/// Handler reference box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlrBox {
    pub handler_type: BoxType,
    /// Raw name bytes, terminator included when present.
    pub name: Vec<u8>,
}

impl HdlrBox {
    pub const VIDE: BoxType = BoxType(*b"vide");
    pub const SOUN: BoxType = BoxType(*b"soun");
    pub const SUBT: BoxType = BoxType(*b"subt");
    pub const TEXT: BoxType = BoxType(*b"text");
    pub const SBTL: BoxType = BoxType(*b"sbtl");

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

impl ParseBox for HdlrBox {
    const TYPE: BoxType = BoxType::HDLR;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        r.skip(4)?;
        let handler_type = BoxType(r.fourcc()?);
        r.skip(12)?;
        Ok(Self {
            handler_type,
            name: r.rest().to_vec(),
        })
    }
}

impl LeafBox for HdlrBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        24 + self.name.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(0);
        buf.put_slice(&self.handler_type.0);
        buf.put_bytes(0, 12);
        buf.put_slice(&self.name);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("handler_type", &self.handler_type);
        inspector.field("name", &self.name_str());
    }
}

/// One edit list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElstEntry {
    /// In movie timescale units.
    pub segment_duration: u64,
    /// In media timescale units; -1 marks an empty edit.
    pub media_time: i64,
    pub media_rate_integer: i16,
    pub media_rate_fraction: i16,
}

/// Edit list box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElstBox {
    pub version: u8,
    pub entries: Vec<ElstEntry>,
}

impl ElstBox {
    fn effective_version(&self) -> u8 {
        let wide = self.entries.iter().any(|e| {
            e.segment_duration > u32::MAX as u64
                || e.media_time > i32::MAX as i64
                || e.media_time < i32::MIN as i64
        });
        if self.version == 1 || wide {
            1
        } else {
            0
        }
    }
}

impl ParseBox for ElstBox {
    const TYPE: BoxType = BoxType::ELST;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        let (version, _) = read_full_box_header(r)?;
        let count = r.u32()? as usize;
        let entry_size = if version == 1 { 20 } else { 12 };
        let mut entries = Vec::with_capacity(count.min(r.remaining() / entry_size));
        for _ in 0..count {
            let (segment_duration, media_time) = if version == 1 {
                (r.u64()?, r.i64()?)
            } else {
                (r.u32()? as u64, r.i32()? as i64)
            };
            entries.push(ElstEntry {
                segment_duration,
                media_time,
                media_rate_integer: r.u16()? as i16,
                media_rate_fraction: r.u16()? as i16,
            });
        }
        Ok(Self { version, entries })
    }
}

impl LeafBox for ElstBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        let entry_size = if self.effective_version() == 1 { 20 } else { 12 };
        8 + entry_size * self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        let version = self.effective_version();
        put_full_box_header(buf, version, 0);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            if version == 1 {
                buf.put_u64(e.segment_duration);
                buf.put_i64(e.media_time);
            } else {
                buf.put_u32(e.segment_duration as u32);
                buf.put_i32(e.media_time as i32);
            }
            buf.put_i16(e.media_rate_integer);
            buf.put_i16(e.media_rate_fraction);
        }
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entries.len());
        for e in &self.entries {
            inspector.field(
                "entry",
                &format!(
                    "segment_duration={} media_time={}",
                    e.segment_duration, e.media_time
                ),
            );
        }
    }
}

/// Sample description box. Entries are kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsdBox {
    pub entry_count: u32,
    pub entries: Vec<u8>,
}

impl StsdBox {
    /// Type codes of each sample entry.
    pub fn entry_types(&self) -> Vec<BoxType> {
        let mut types = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= self.entries.len() && types.len() < self.entry_count as usize {
            let size = read_u32(&self.entries[pos..]) as usize;
            types.push(BoxType([
                self.entries[pos + 4],
                self.entries[pos + 5],
                self.entries[pos + 6],
                self.entries[pos + 7],
            ]));
            if size < 8 {
                break;
            }
            pos += size;
        }
        types
    }

    /// NAL unit length field size declared in the first entry's `avcC`,
    /// when the first entry is an AVC sample entry.
    pub fn avc_nalu_length_size(&self) -> Option<u8> {
        let entry_type = *self.entry_types().first()?;
        if !matches!(&entry_type.0, b"avc1" | b"avc2" | b"avc3" | b"avc4") {
            return None;
        }
        let entry_size = (read_u32(&self.entries) as usize).min(self.entries.len());
        // Sample entry header (8) + reserved/data ref (8) + visual fields (70).
        let mut pos = 86usize;
        while pos + 8 <= entry_size {
            let size = read_u32(&self.entries[pos..]) as usize;
            if &self.entries[pos + 4..pos + 8] == b"avcC" {
                let config = self.entries.get(pos + 8..pos + size.max(8))?;
                return config.get(4).map(|b| (b & 0x03) + 1);
            }
            if size < 8 {
                break;
            }
            pos += size;
        }
        None
    }
}

fn read_u32(data: &[u8]) -> u32 {
    match data.get(0..4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

impl ParseBox for StsdBox {
    const TYPE: BoxType = BoxType::STSD;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self> {
        read_full_box_header(r)?;
        let entry_count = r.u32()?;
        Ok(Self {
            entry_count,
            entries: r.rest().to_vec(),
        })
    }
}

impl LeafBox for StsdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn payload_size(&self) -> u64 {
        8 + self.entries.len() as u64
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        put_full_box_header(buf, 0, 0);
        buf.put_u32(self.entry_count);
        buf.put_slice(&self.entries);
    }

    fn inspect_fields(&self, inspector: &mut dyn Inspector) {
        inspector.field("entry_count", &self.entry_count);
        for t in self.entry_types() {
            inspector.field("entry", &t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::Mp4Box;

    fn reparse(b: &Mp4Box) -> Mp4Box {
        let bytes = b.to_bytes().unwrap();
        crate::boxes::parse_box(&bytes).unwrap()
    }

    #[test]
    fn test_mvhd_version_follows_duration() {
        let small: Mp4Box = MvhdBox::new(1000, 5000, 2).into();
        assert_eq!(small.size(), 108);

        let large: Mp4Box = MvhdBox::new(1000, u32::MAX as u64 + 1, 2).into();
        assert_eq!(large.size(), 120);
        let parsed = reparse(&large);
        assert_eq!(parsed.as_mvhd().unwrap().duration, u32::MAX as u64 + 1);
    }

    #[test]
    fn test_tkhd_fields_survive_reserialization() {
        let mut tkhd = TkhdBox::new(3, 9000);
        tkhd.width = 1920 << 16;
        tkhd.height = 1080 << 16;
        let b: Mp4Box = tkhd.clone().into();
        assert_eq!(b.size(), 92);
        assert_eq!(reparse(&b).as_tkhd(), Some(&tkhd));
    }

    #[test]
    fn test_mdhd_language() {
        let mdhd = MdhdBox::new(48000, 0);
        assert_eq!(mdhd.language_code(), "und");
    }

    #[test]
    fn test_elst_negative_media_time() {
        let elst = ElstBox {
            version: 0,
            entries: vec![ElstEntry {
                segment_duration: 1000,
                media_time: -1,
                media_rate_integer: 1,
                media_rate_fraction: 0,
            }],
        };
        let b: Mp4Box = elst.into();
        assert_eq!(reparse(&b).as_elst().unwrap().entries[0].media_time, -1);
    }

    #[test]
    fn test_stsd_avc_length_size() {
        let mut entry = Vec::new();
        let avcc = [1u8, 0x64, 0, 0x1F, 0xFF, 0xE0, 0x00];
        let entry_size = 86 + 8 + avcc.len();
        entry.extend_from_slice(&(entry_size as u32).to_be_bytes());
        entry.extend_from_slice(b"avc1");
        entry.resize(86, 0);
        entry.extend_from_slice(&((8 + avcc.len()) as u32).to_be_bytes());
        entry.extend_from_slice(b"avcC");
        entry.extend_from_slice(&avcc);

        let stsd = StsdBox {
            entry_count: 1,
            entries: entry,
        };
        assert_eq!(stsd.entry_types(), vec![BoxType(*b"avc1")]);
        assert_eq!(stsd.avc_nalu_length_size(), Some(4));
    }

    #[test]
    fn test_stsd_non_avc_has_no_length_size() {
        let mut entry = vec![0, 0, 0, 16];
        entry.extend_from_slice(b"mp4a");
        entry.extend_from_slice(&[0u8; 8]);
        let stsd = StsdBox {
            entry_count: 1,
            entries: entry,
        };
        assert_eq!(stsd.avc_nalu_length_size(), None);
    }
}
