//! Parsed view of an MP4 file: top-level layout, movie and tracks.

use crate::boxes::{BoxReader, BoxType, FtypBox, HdlrBox, Mp4Box, TrexBox};
use crate::sample_table::StblSampleTable;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tracing::debug;

/// Track media kind, from the `hdlr` handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum TrackType {
    Video,
    Audio,
    Subtitles,
    Text,
    Hint,
    Other,
}

impl TrackType {
    pub fn from_handler(handler_type: BoxType) -> Self {
        match &handler_type.0 {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            b"subt" | b"sbtl" => Self::Subtitles,
            b"text" => Self::Text,
            b"hint" => Self::Hint,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitles => "subtitles",
            Self::Text => "text",
            Self::Hint => "hint",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// One track of a movie.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub track_type: TrackType,
    pub handler_type: BoxType,
    /// Media timescale from `mdhd`.
    pub media_timescale: u32,
    /// Duration in media timescale units.
    pub media_duration: u64,
    /// Duration in movie timescale units, from `tkhd`.
    pub duration: u64,
    /// Copy of the `trak` box.
    pub trak: Mp4Box,
    pub sample_table: StblSampleTable,
}

impl Track {
    /// Build a track from a `trak` box.
    pub fn from_trak(trak: &Mp4Box) -> Result<Self> {
        let tkhd = trak
            .child(BoxType::TKHD)
            .and_then(Mp4Box::as_tkhd)
            .ok_or_else(|| Error::invalid_format("trak has no tkhd"))?;
        let mdhd = trak
            .find("mdia/mdhd")
            .and_then(Mp4Box::as_mdhd)
            .ok_or_else(|| Error::invalid_format(format!("track {} has no mdhd", tkhd.track_id)))?;
        let handler_type = trak
            .find("mdia/hdlr")
            .and_then(Mp4Box::as_hdlr)
            .map_or(BoxType(*b"none"), |h: &HdlrBox| h.handler_type);
        let stbl = trak
            .find("mdia/minf/stbl")
            .ok_or_else(|| Error::invalid_format(format!("track {} has no stbl", tkhd.track_id)))?;

        Ok(Self {
            id: tkhd.track_id,
            track_type: TrackType::from_handler(handler_type),
            handler_type,
            media_timescale: mdhd.timescale,
            media_duration: mdhd.duration,
            duration: tkhd.duration,
            sample_table: StblSampleTable::from_stbl(stbl)?,
            trak: trak.clone(),
        })
    }

    /// The track's `stsd`, if any.
    pub fn stsd(&self) -> Option<&crate::boxes::StsdBox> {
        self.trak
            .find("mdia/minf/stbl/stsd")
            .and_then(Mp4Box::as_stsd)
    }

    /// NAL unit length size of an AVC track.
    pub fn avc_nalu_length_size(&self) -> Option<u8> {
        self.stsd()?.avc_nalu_length_size()
    }

    /// Number of sample descriptions.
    pub fn sample_description_count(&self) -> u32 {
        self.stsd().map_or(0, |s| s.entry_count)
    }
}

/// The `moov` box and the tracks it declares.
#[derive(Debug, Clone)]
pub struct Movie {
    moov: Mp4Box,
    tracks: Vec<Track>,
}

impl Movie {
    /// Build a movie from a `moov` box.
    pub fn from_moov(moov: Mp4Box) -> Result<Self> {
        if moov.box_type() != BoxType::MOOV {
            return Err(Error::invalid_format(format!(
                "expected moov, found {}",
                moov.box_type()
            )));
        }
        let tracks = moov
            .children_of(BoxType::TRAK)
            .map(Track::from_trak)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { moov, tracks })
    }

    pub fn moov(&self) -> &Mp4Box {
        &self.moov
    }

    pub fn moov_mut(&mut self) -> &mut Mp4Box {
        &mut self.moov
    }

    pub fn into_moov(self) -> Mp4Box {
        self.moov
    }

    /// Movie timescale from `mvhd`.
    pub fn timescale(&self) -> u32 {
        self.moov
            .child(BoxType::MVHD)
            .and_then(Mp4Box::as_mvhd)
            .map_or(0, |m| m.timescale)
    }

    /// Movie duration in movie timescale units.
    pub fn duration(&self) -> u64 {
        self.moov
            .child(BoxType::MVHD)
            .and_then(Mp4Box::as_mvhd)
            .map_or(0, |m| m.duration)
    }

    /// Whether the movie declares fragments (`mvex`).
    pub fn has_fragments(&self) -> bool {
        self.moov.child(BoxType::MVEX).is_some()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn track(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// First track of the given type.
    pub fn track_of_type(&self, track_type: TrackType) -> Option<&Track> {
        self.tracks.iter().find(|t| t.track_type == track_type)
    }

    /// The `trex` declared for a track.
    pub fn trex(&self, track_id: u32) -> Option<&TrexBox> {
        self.moov
            .child(BoxType::MVEX)?
            .children_of(BoxType::TREX)
            .filter_map(Mp4Box::as_trex)
            .find(|t| t.track_id == track_id)
    }

    /// The `trak` box of a track inside the `moov`.
    pub fn trak_mut(&mut self, track_id: u32) -> Option<&mut Mp4Box> {
        self.moov
            .as_container_mut()?
            .children
            .iter_mut()
            .filter(|c| c.box_type() == BoxType::TRAK)
            .find(|trak| {
                trak.child(BoxType::TKHD)
                    .and_then(Mp4Box::as_tkhd)
                    .is_some_and(|tkhd| tkhd.track_id == track_id)
            })
    }

    /// Write every track's sample table layout back into the `moov`,
    /// adding `delta` to every chunk offset.
    pub fn write_sample_tables(&mut self, delta: u64) -> Result<()> {
        let layouts: Vec<(u32, StblSampleTable)> = self
            .tracks
            .iter()
            .map(|t| (t.id, t.sample_table.clone()))
            .collect();
        for (track_id, table) in layouts {
            let stbl = self
                .trak_mut(track_id)
                .and_then(|trak| trak.find_mut("mdia/minf/stbl"))
                .ok_or_else(|| Error::NoSuchItem(format!("stbl of track {track_id}")))?;
            table.write_into(stbl, delta)?;
        }
        Ok(())
    }
}

/// Top-level layout of an MP4 file.
#[derive(Debug, Clone, Default)]
pub struct Mp4File {
    pub ftyp: Option<FtypBox>,
    pub movie: Option<Movie>,
    /// `mfra` box, if present.
    pub mfra: Option<Mp4Box>,
    /// Offset of the first `moof`, if any.
    pub first_moof_offset: Option<u64>,
    /// Number of `moof` boxes.
    pub moof_count: usize,
    /// Offset and size of every top-level box, in stream order.
    pub layout: Vec<(u64, BoxType, u64)>,
}

impl Mp4File {
    /// Open and parse a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::CannotOpenFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&mut BufReader::new(file))
    }

    /// Parse the top-level boxes of a stream.
    pub fn parse<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut file = Self::default();
        for item in BoxReader::new(reader)? {
            let (offset, parsed) = item?;
            let box_type = parsed.box_type();
            file.layout.push((offset, box_type, parsed.size()));
            match parsed {
                Mp4Box::Ftyp(ftyp) if file.ftyp.is_none() => file.ftyp = Some(ftyp),
                b if box_type == BoxType::MOOV && file.movie.is_none() => {
                    file.movie = Some(Movie::from_moov(b)?);
                }
                b if box_type == BoxType::MFRA => file.mfra = Some(b),
                _ if box_type == BoxType::MOOF => {
                    file.first_moof_offset.get_or_insert(offset);
                    file.moof_count += 1;
                }
                _ => {}
            }
        }
        debug!(
            boxes = file.layout.len(),
            moofs = file.moof_count,
            "parsed top-level layout"
        );
        Ok(file)
    }

    /// Whether the file carries movie fragments.
    pub fn is_fragmented(&self) -> bool {
        self.first_moof_offset.is_some()
            || self.movie.as_ref().is_some_and(Movie::has_fragments)
    }

    /// The movie, or `InvalidFormat` when there is no `moov`.
    pub fn require_movie(&self) -> Result<&Movie> {
        self.movie
            .as_ref()
            .ok_or_else(|| Error::invalid_format("no moov box"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Mp4Builder, TrackSpec};

    #[test]
    fn test_track_type_from_handler() {
        assert_eq!(TrackType::from_handler(BoxType(*b"vide")), TrackType::Video);
        assert_eq!(TrackType::from_handler(BoxType(*b"sbtl")), TrackType::Subtitles);
        assert_eq!(TrackType::from_handler(BoxType(*b"meta")), TrackType::Other);
        assert_eq!(TrackType::Audio.to_string(), "audio");
    }

    #[test]
    fn test_parse_synthetic_file() {
        let data = Mp4Builder::new()
            .track(TrackSpec::video(1, 10, 1000).sync_every(5))
            .track(TrackSpec::audio(2, 20, 1024))
            .build();
        let file = Mp4File::parse(&mut std::io::Cursor::new(data)).unwrap();
        assert!(!file.is_fragmented());
        assert!(file.ftyp.is_some());

        let movie = file.require_movie().unwrap();
        assert_eq!(movie.tracks().len(), 2);
        let video = movie.track_of_type(TrackType::Video).unwrap();
        assert_eq!(video.id, 1);
        assert_eq!(video.sample_table.samples().len(), 10);
        assert!(video.sample_table.samples()[5].is_sync);
        assert!(!video.sample_table.samples()[6].is_sync);
        assert_eq!(movie.track(2).unwrap().track_type, TrackType::Audio);
    }

    #[test]
    fn test_write_sample_tables_moves_chunks() {
        let data = Mp4Builder::new().track(TrackSpec::audio(1, 4, 1024)).build();
        let file = Mp4File::parse(&mut std::io::Cursor::new(data)).unwrap();
        let mut movie = file.movie.unwrap();
        movie.write_sample_tables(1_000_000).unwrap();
        let reparsed = Movie::from_moov(movie.into_moov()).unwrap();
        let original = file_offset_of_first_sample(&reparsed);
        assert!(original >= 1_000_000);
    }

    fn file_offset_of_first_sample(movie: &Movie) -> u64 {
        movie.tracks()[0].sample_table.samples()[0].offset
    }

    #[test]
    fn test_open_missing_file() {
        let err = Mp4File::open("/nonexistent/input.mp4").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CannotOpenFile);
    }
}
