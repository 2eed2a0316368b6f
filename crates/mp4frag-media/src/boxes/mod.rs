//! ISO BMFF box tree.
//!
//! Boxes are modelled as a closed enum, [`Mp4Box`], with one variant per box
//! kind this crate understands, a generic [`ContainerBox`] for pure
//! containers, [`MdatBox`] for media data (payload never held in memory) and
//! [`UnknownBox`] for everything else (raw payload preserved byte for byte).
//!
//! Box sizes are never stored. They are computed bottom-up from the fields on
//! every call to [`Mp4Box::size`], so a box tree can be mutated freely and
//! the declared size written by [`Mp4Box::write`] always matches the number
//! of bytes produced.

mod fragment;
mod index;
mod inspect;
mod movie;
mod reader;
mod table;

pub use fragment::{
    MehdBox, MfhdBox, TfdtBox, TfhdBox, TrexBox, TrunBox, TrunEntry, SAMPLE_FLAG_IS_NON_SYNC,
};
pub use index::{MfroBox, SidxBox, SidxReference, TfraBox, TfraEntry};
pub use inspect::{Inspector, JsonInspector, TextInspector};
pub use movie::{ElstBox, ElstEntry, FtypBox, HdlrBox, MdhdBox, MvhdBox, StsdBox, TkhdBox};
pub use reader::{parse_box, BoxReader, MAX_BOX_PAYLOAD_SIZE};
pub use table::{Co64Box, CttsBox, StcoBox, StscBox, StscEntry, StssBox, StszBox, SttsBox};

use crate::stream::PayloadReader;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::io::Write;

/// Size of a compact box header (32-bit size + type).
pub const BOX_HEADER_SIZE: u64 = 8;
/// Size of a box header carrying a 64-bit size.
pub const BOX_LARGE_HEADER_SIZE: u64 = 16;
/// Size of the version + flags prefix of a full box.
pub const FULL_BOX_HEADER_SIZE: u64 = 4;

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const ELST: Self = Self(*b"elst");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const DINF: Self = Self(*b"dinf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const UDTA: Self = Self(*b"udta");
    pub const MVEX: Self = Self(*b"mvex");
    pub const MEHD: Self = Self(*b"mehd");
    pub const TREX: Self = Self(*b"trex");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const MFRA: Self = Self(*b"mfra");
    pub const TFRA: Self = Self(*b"tfra");
    pub const MFRO: Self = Self(*b"mfro");
    pub const SIDX: Self = Self(*b"sidx");
    pub const SSIX: Self = Self(*b"ssix");
    pub const FREE: Self = Self(*b"free");

    /// Brands used in `ftyp`.
    pub const BRAND_ISO5: Self = Self(*b"iso5");
    pub const BRAND_MP42: Self = Self(*b"mp42");

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether boxes of this type hold only child boxes.
    pub fn is_container(&self) -> bool {
        matches!(
            *self,
            Self::MOOV
                | Self::TRAK
                | Self::EDTS
                | Self::MDIA
                | Self::MINF
                | Self::DINF
                | Self::STBL
                | Self::UDTA
                | Self::MVEX
                | Self::MOOF
                | Self::TRAF
                | Self::MFRA
        )
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Box type code.
    pub box_type: BoxType,
    /// Box size including the header.
    pub size: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u64,
}

impl BoxHeader {
    /// Size of the payload that follows the header.
    pub fn payload_size(&self) -> u64 {
        self.size - self.header_size
    }
}

/// Header size needed to declare a payload of the given size.
pub fn header_size_for(payload_size: u64) -> u64 {
    if payload_size + BOX_HEADER_SIZE > u32::MAX as u64 {
        BOX_LARGE_HEADER_SIZE
    } else {
        BOX_HEADER_SIZE
    }
}

/// Append a box header for a payload of the given size.
pub fn put_box_header(buf: &mut BytesMut, box_type: BoxType, payload_size: u64) {
    let header_size = header_size_for(payload_size);
    if header_size == BOX_LARGE_HEADER_SIZE {
        buf.put_u32(1);
        buf.put_slice(&box_type.0);
        buf.put_u64(payload_size + header_size);
    } else {
        buf.put_u32((payload_size + header_size) as u32);
        buf.put_slice(&box_type.0);
    }
}

pub(crate) fn put_full_box_header(buf: &mut BytesMut, version: u8, flags: u32) {
    buf.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
}

pub(crate) fn read_full_box_header(r: &mut PayloadReader<'_>) -> Result<(u8, u32)> {
    let word = r.u32()?;
    Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
}

/// Fixed-layout leaf box behaviour shared by all typed variants.
pub trait LeafBox {
    fn box_type(&self) -> BoxType;

    /// Serialized size of the payload (everything after the box header).
    fn payload_size(&self) -> u64;

    /// Reject field values the payload layout cannot represent.
    fn check_encodable(&self) -> Result<()> {
        Ok(())
    }

    /// Append the payload bytes.
    fn write_payload(&self, buf: &mut BytesMut);

    /// Report the parsed fields.
    fn inspect_fields(&self, inspector: &mut dyn Inspector);
}

/// Construction of a leaf box from its payload.
pub trait ParseBox: Sized {
    const TYPE: BoxType;

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self>;
}

/// A box holding only child boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerBox {
    pub box_type: BoxType,
    pub children: Vec<Mp4Box>,
}

impl ContainerBox {
    /// Create an empty container.
    pub fn new(box_type: BoxType) -> Self {
        Self {
            box_type,
            children: Vec::new(),
        }
    }

    /// Create a container with the given children.
    pub fn with_children(box_type: BoxType, children: Vec<Mp4Box>) -> Self {
        Self { box_type, children }
    }

    /// Append a child box.
    pub fn add_child(&mut self, child: impl Into<Mp4Box>) {
        self.children.push(child.into());
    }

    /// Insert a child box at the given position (clamped to the end).
    pub fn insert_child(&mut self, index: usize, child: impl Into<Mp4Box>) {
        let index = index.min(self.children.len());
        self.children.insert(index, child.into());
    }
}

/// Media data box. Only its location in the source stream is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdatBox {
    /// Stream offset of the first payload byte.
    pub payload_offset: u64,
    /// Payload size in bytes.
    pub payload_size: u64,
}

/// A box this crate does not interpret. The payload is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBox {
    pub box_type: BoxType,
    pub payload: Vec<u8>,
}

macro_rules! typed_boxes {
    ($($variant:ident($ty:ty) => $as_ref:ident, $as_mut:ident;)*) => {
        /// A node of the box tree.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Mp4Box {
            Container(ContainerBox),
            Mdat(MdatBox),
            Unknown(UnknownBox),
            $($variant($ty),)*
        }

        impl Mp4Box {
            $(
                pub fn $as_ref(&self) -> Option<&$ty> {
                    match self {
                        Self::$variant(b) => Some(b),
                        _ => None,
                    }
                }

                pub fn $as_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Self::$variant(b) => Some(b),
                        _ => None,
                    }
                }
            )*

            fn as_leaf(&self) -> Option<&dyn LeafBox> {
                match self {
                    $(Self::$variant(b) => Some(b),)*
                    _ => None,
                }
            }

            fn parse_typed(box_type: BoxType, r: &mut PayloadReader<'_>) -> Option<Result<Self>> {
                $(
                    if box_type == <$ty as ParseBox>::TYPE {
                        return Some(<$ty as ParseBox>::parse(r).map(Self::$variant));
                    }
                )*
                None
            }
        }

        $(
            impl From<$ty> for Mp4Box {
                fn from(b: $ty) -> Self {
                    Self::$variant(b)
                }
            }
        )*
    };
}

typed_boxes! {
    Ftyp(FtypBox) => as_ftyp, as_ftyp_mut;
    Mvhd(MvhdBox) => as_mvhd, as_mvhd_mut;
    Tkhd(TkhdBox) => as_tkhd, as_tkhd_mut;
    Mdhd(MdhdBox) => as_mdhd, as_mdhd_mut;
    Hdlr(HdlrBox) => as_hdlr, as_hdlr_mut;
    Elst(ElstBox) => as_elst, as_elst_mut;
    Stsd(StsdBox) => as_stsd, as_stsd_mut;
    Stts(SttsBox) => as_stts, as_stts_mut;
    Ctts(CttsBox) => as_ctts, as_ctts_mut;
    Stss(StssBox) => as_stss, as_stss_mut;
    Stsc(StscBox) => as_stsc, as_stsc_mut;
    Stsz(StszBox) => as_stsz, as_stsz_mut;
    Stco(StcoBox) => as_stco, as_stco_mut;
    Co64(Co64Box) => as_co64, as_co64_mut;
    Mehd(MehdBox) => as_mehd, as_mehd_mut;
    Trex(TrexBox) => as_trex, as_trex_mut;
    Mfhd(MfhdBox) => as_mfhd, as_mfhd_mut;
    Tfhd(TfhdBox) => as_tfhd, as_tfhd_mut;
    Tfdt(TfdtBox) => as_tfdt, as_tfdt_mut;
    Trun(TrunBox) => as_trun, as_trun_mut;
    Sidx(SidxBox) => as_sidx, as_sidx_mut;
    Tfra(TfraBox) => as_tfra, as_tfra_mut;
    Mfro(MfroBox) => as_mfro, as_mfro_mut;
}

impl From<ContainerBox> for Mp4Box {
    fn from(b: ContainerBox) -> Self {
        Self::Container(b)
    }
}

impl From<UnknownBox> for Mp4Box {
    fn from(b: UnknownBox) -> Self {
        Self::Unknown(b)
    }
}

impl Mp4Box {
    /// Create an empty container box.
    pub fn container(box_type: BoxType) -> Self {
        Self::Container(ContainerBox::new(box_type))
    }

    /// Build a box from its header type and payload bytes.
    pub fn from_payload(box_type: BoxType, payload: &[u8]) -> Result<Self> {
        if box_type.is_container() {
            let children = reader::parse_children(payload)?;
            return Ok(Self::Container(ContainerBox::with_children(box_type, children)));
        }
        let mut r = PayloadReader::new(payload, "box payload");
        match Self::parse_typed(box_type, &mut r) {
            Some(parsed) => parsed.map_err(|e| match e {
                Error::InvalidFormat(msg) => {
                    Error::invalid_format(format!("{box_type}: {msg}"))
                }
                other => other,
            }),
            None => Ok(Self::Unknown(UnknownBox {
                box_type,
                payload: payload.to_vec(),
            })),
        }
    }

    /// Box type code.
    pub fn box_type(&self) -> BoxType {
        match self {
            Self::Container(c) => c.box_type,
            Self::Mdat(_) => BoxType::MDAT,
            Self::Unknown(u) => u.box_type,
            other => other.as_leaf().map(|l| l.box_type()).unwrap_or(BoxType::FREE),
        }
    }

    fn payload_size(&self) -> u64 {
        match self {
            Self::Container(c) => c.children.iter().map(Mp4Box::size).sum(),
            Self::Mdat(m) => m.payload_size,
            Self::Unknown(u) => u.payload.len() as u64,
            other => other.as_leaf().map(|l| l.payload_size()).unwrap_or(0),
        }
    }

    /// Total serialized size, header included.
    pub fn size(&self) -> u64 {
        let payload = self.payload_size();
        payload + header_size_for(payload)
    }

    /// Header size this box will be written with.
    pub fn header_size(&self) -> u64 {
        header_size_for(self.payload_size())
    }

    /// Append the serialized box to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Mdat(_) => {
                return Err(Error::not_supported(
                    "mdat payload is not held in memory and cannot be re-serialized",
                ))
            }
            Self::Container(c) => {
                put_box_header(buf, c.box_type, self.payload_size());
                for child in &c.children {
                    child.write_to(buf)?;
                }
            }
            Self::Unknown(u) => {
                put_box_header(buf, u.box_type, u.payload.len() as u64);
                buf.put_slice(&u.payload);
            }
            other => {
                if let Some(leaf) = other.as_leaf() {
                    leaf.check_encodable()?;
                    put_box_header(buf, leaf.box_type(), leaf.payload_size());
                    leaf.write_payload(buf);
                }
            }
        }
        Ok(())
    }

    /// Serialize the box into a new byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.size() as usize);
        self.write_to(&mut buf)?;
        debug_assert_eq!(buf.len() as u64, self.size(), "{} size mismatch", self.box_type());
        Ok(buf.to_vec())
    }

    /// Write the box to a stream.
    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Walk the box and its children through an inspector.
    pub fn inspect(&self, inspector: &mut dyn Inspector) {
        inspector.start_box(self.box_type(), self.size());
        match self {
            Self::Container(c) => {
                for child in &c.children {
                    child.inspect(inspector);
                }
            }
            Self::Mdat(m) => {
                inspector.field("payload_offset", &m.payload_offset);
                inspector.field("payload_size", &m.payload_size);
            }
            Self::Unknown(u) => {
                inspector.field("payload_size", &u.payload.len());
            }
            other => {
                if let Some(leaf) = other.as_leaf() {
                    leaf.inspect_fields(inspector);
                }
            }
        }
        inspector.end_box();
    }

    pub fn as_container(&self) -> Option<&ContainerBox> {
        match self {
            Self::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_container_mut(&mut self) -> Option<&mut ContainerBox> {
        match self {
            Self::Container(c) => Some(c),
            _ => None,
        }
    }

    /// Child boxes (empty for leaves).
    pub fn children(&self) -> &[Mp4Box] {
        match self {
            Self::Container(c) => &c.children,
            _ => &[],
        }
    }

    /// First child of the given type.
    pub fn child(&self, box_type: BoxType) -> Option<&Mp4Box> {
        self.children().iter().find(|c| c.box_type() == box_type)
    }

    /// First child of the given type, mutably.
    pub fn child_mut(&mut self, box_type: BoxType) -> Option<&mut Mp4Box> {
        self.as_container_mut()?
            .children
            .iter_mut()
            .find(|c| c.box_type() == box_type)
    }

    /// All children of the given type.
    pub fn children_of(&self, box_type: BoxType) -> impl Iterator<Item = &Mp4Box> {
        self.children()
            .iter()
            .filter(move |c| c.box_type() == box_type)
    }

    /// Remove all children of the given type, returning how many were removed.
    pub fn remove_children(&mut self, box_type: BoxType) -> usize {
        match self.as_container_mut() {
            Some(c) => {
                let before = c.children.len();
                c.children.retain(|child| child.box_type() != box_type);
                before - c.children.len()
            }
            None => 0,
        }
    }

    /// Follow a `/`-separated path of box types, e.g. `"mdia/minf/stbl"`.
    pub fn find(&self, path: &str) -> Option<&Mp4Box> {
        let mut current = self;
        for segment in path.split('/') {
            current = current.child(path_type(segment)?)?;
        }
        Some(current)
    }

    /// Mutable variant of [`Mp4Box::find`].
    pub fn find_mut(&mut self, path: &str) -> Option<&mut Mp4Box> {
        let mut current = self;
        for segment in path.split('/') {
            current = current.child_mut(path_type(segment)?)?;
        }
        Some(current)
    }
}

fn path_type(segment: &str) -> Option<BoxType> {
    let bytes: [u8; 4] = segment.as_bytes().try_into().ok()?;
    Some(BoxType(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_moof() -> Mp4Box {
        let mut traf = ContainerBox::new(BoxType::TRAF);
        traf.add_child(TfhdBox::new(1));
        traf.add_child(TfdtBox::new(1000));
        let mut moof = ContainerBox::new(BoxType::MOOF);
        moof.add_child(MfhdBox { sequence_number: 7 });
        moof.add_child(traf);
        moof.into()
    }

    #[test]
    fn test_container_size_matches_bytes() {
        let moof = sample_moof();
        let bytes = moof.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, moof.size());
        assert_eq!(&bytes[4..8], b"moof");
        assert_eq!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize, bytes.len());
    }

    #[test]
    fn test_find_path() {
        let moof = sample_moof();
        let tfhd = moof.find("traf/tfhd").and_then(Mp4Box::as_tfhd).unwrap();
        assert_eq!(tfhd.track_id, 1);
        assert!(moof.find("traf/trun").is_none());
        assert!(moof.find("bad").is_none());
    }

    #[test]
    fn test_find_mut_and_remove() {
        let mut moof = sample_moof();
        moof.find_mut("traf/tfdt")
            .and_then(Mp4Box::as_tfdt_mut)
            .unwrap()
            .base_media_decode_time = 42;
        assert_eq!(
            moof.find("traf/tfdt").and_then(Mp4Box::as_tfdt).unwrap().base_media_decode_time,
            42
        );
        assert_eq!(moof.remove_children(BoxType::MFHD), 1);
        assert!(moof.child(BoxType::MFHD).is_none());
    }

    #[test]
    fn test_unknown_box_kept_verbatim() {
        let b = Mp4Box::from_payload(BoxType(*b"abcd"), &[1, 2, 3]).unwrap();
        assert_eq!(b.to_bytes().unwrap(), vec![0, 0, 0, 11, b'a', b'b', b'c', b'd', 1, 2, 3]);
    }

    #[test]
    fn test_mdat_cannot_be_serialized() {
        let b = Mp4Box::Mdat(MdatBox {
            payload_offset: 8,
            payload_size: 100,
        });
        assert_eq!(b.size(), 108);
        assert_eq!(b.to_bytes().unwrap_err().kind(), crate::ErrorKind::NotSupported);
    }

    #[test]
    fn test_header_size_switches_to_64_bit() {
        assert_eq!(header_size_for(100), 8);
        assert_eq!(header_size_for(u32::MAX as u64), 16);

        let mut buf = BytesMut::new();
        put_box_header(&mut buf, BoxType::MDAT, u32::MAX as u64);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
    }
}
