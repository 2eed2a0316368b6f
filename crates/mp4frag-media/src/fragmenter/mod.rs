//! Conversion of a movie into a fragmented MP4.
//!
//! The output is `ftyp`, a `moov` whose tracks carry no samples, an
//! optional `sidx`, one `moof` + `mdat` pair per fragment and a closing
//! `mfra`.
//!
//! Fragment boundaries follow an anchor track (the selected track, else the
//! first video, audio or subtitles track). Each anchor fragment ends at the
//! sync sample closest to the next multiple of the target duration. The
//! other tracks are cut at the anchor's current decode time, so their
//! fragments interleave with the anchor's. When the anchor runs out of
//! samples, another track takes over unless trimming was requested.
//!
//! All fragments are planned first, so every `moof` is complete before
//! anything is written. The `sidx` is the only box patched afterwards.

mod cursor;
mod detect;
mod options;

pub use options::{
    ForceSyncMode, FragmentOptions, TrackSelector, DEFAULT_FRAGMENT_DURATION_MS,
    MAX_AUTO_FRAGMENT_DURATION_MS, OUTPUT_MOVIE_TIMESCALE,
};

use crate::boxes::{
    header_size_for, put_box_header, BoxType, ContainerBox, ElstBox, FtypBox, MehdBox, MfhdBox,
    MfroBox, Mp4Box, MvhdBox, SidxBox, SidxReference, TfdtBox, TfhdBox, TfraEntry, TrexBox,
    TrunBox, TrunEntry,
};
use crate::linear_reader::{LinearReader, DEFAULT_MAX_BUFFER};
use crate::movie::{Movie, Mp4File, Track, TrackType};
use crate::sample_table::{SampleTable, SyntheticSampleTable};
use crate::stream::{patch_at, tell};
use crate::time::{convert_time, convert_time_signed};
use crate::{Error, Result};
use bytes::BytesMut;
use cursor::{SampleArray, TrackCursor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// `tfhd` default flags for video: non-sync, depends on other samples.
const VIDEO_DEFAULT_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// `trun` first-sample flags for video: does not depend on others.
const VIDEO_FIRST_SAMPLE_FLAGS: u32 = 0x0200_0000;

/// One emitted fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct FragmentInfo {
    pub track_id: u32,
    pub sequence_number: u32,
    pub sample_count: usize,
    /// Decode time of the first sample, in the output media timescale.
    pub timestamp: u64,
    pub duration: u64,
    pub moof_position: u64,
    pub moof_size: u64,
    /// `mdat` size, header included.
    pub mdat_size: u64,
}

/// Summary of a fragmentation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct FragmentReport {
    pub anchor_track_id: u32,
    pub fragment_duration_ms: u32,
    pub fragments: Vec<FragmentInfo>,
    /// Bytes written.
    pub output_size: u64,
}

impl FragmentReport {
    /// Fragments of one track.
    pub fn fragments_of(&self, track_id: u32) -> impl Iterator<Item = &FragmentInfo> {
        self.fragments.iter().filter(move |f| f.track_id == track_id)
    }
}

struct PlannedFragment {
    cursor: usize,
    sample_indexes: Vec<usize>,
    moof: Mp4Box,
    mdat_header_size: u64,
    info: FragmentInfo,
}

/// Converts unfragmented (or already fragmented) movies into fragmented
/// ones.
#[derive(Debug, Clone, Default)]
pub struct Fragmenter {
    options: FragmentOptions,
}

impl Fragmenter {
    pub fn new(options: FragmentOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FragmentOptions {
        &self.options
    }

    /// Fragment the file at `input` into `output`.
    pub fn fragment_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<FragmentReport> {
        let input = input.as_ref();
        let output = output.as_ref();
        let mut reader = BufReader::new(File::open(input).map_err(|source| Error::CannotOpenFile {
            path: input.to_path_buf(),
            source,
        })?);
        let file = Mp4File::parse(&mut reader)?;
        let out = File::create(output).map_err(|source| Error::CannotOpenFile {
            path: output.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(out);
        let report = self.fragment(&mut reader, &file, &mut writer)?;
        writer.flush()?;
        Ok(report)
    }

    /// Fragment a parsed file. Sample data is read from `input`.
    pub fn fragment<R, W>(&self, input: &mut R, file: &Mp4File, output: &mut W) -> Result<FragmentReport>
    where
        R: Read + Seek + ?Sized,
        W: Write + Seek + ?Sized,
    {
        self.options.validate()?;
        let movie = file.require_movie()?;
        let fragmented = movie.has_fragments();
        if fragmented {
            info!("input is already fragmented, it will be re-fragmented");
        }

        let mut cursors = self.create_cursors(input, movie, fragmented)?;
        let selected = self.select_track(&cursors)?;
        if let Some(id) = selected {
            cursors.retain(|c| c.track.id == id);
        }
        if !cursors.iter().any(|c| {
            matches!(
                c.track.track_type,
                TrackType::Video | TrackType::Audio | TrackType::Subtitles
            )
        }) {
            return Err(Error::NoSuchItem("no audio, video or subtitles track".into()));
        }

        if !fragmented {
            self.force_i_frame_sync(input, &mut cursors)?;
        }
        let fragment_duration_ms = self.fragment_duration(input, &cursors, fragmented)?;
        for cursor in &mut cursors {
            cursor.init()?;
        }

        let anchor = anchor_index(&cursors, selected)
            .ok_or_else(|| Error::NoSuchItem("no anchor track".into()))?;
        let anchor_track_id = cursors[anchor].track.id;
        info!(
            anchor_track_id,
            fragment_duration_ms,
            tracks = cursors.len(),
            "fragmenting"
        );

        let moov = self.build_moov(movie, &cursors)?;
        let planned = self.plan_fragments(&mut cursors, anchor, fragment_duration_ms)?;

        let start = tell(output)?;
        output_ftyp(file.ftyp.as_ref()).write(output)?;
        moov.write(output)?;

        let sidx_position = tell(output)?;
        let mut sidx = self.options.create_segment_index.then(|| SidxBox {
            reference_id: anchor_track_id,
            timescale: self
                .options
                .timescale
                .unwrap_or(cursors[anchor].track.media_timescale),
            references: vec![SidxReference::default(); planned.len()],
            ..Default::default()
        });
        let reserved = match &sidx {
            Some(sidx) => {
                let bytes = Mp4Box::from(sidx.clone()).to_bytes()?;
                output.write_all(&bytes)?;
                bytes.len()
            }
            None => 0,
        };

        let mut fragments = Vec::with_capacity(planned.len());
        for mut fragment in planned {
            let cursor = &mut cursors[fragment.cursor];
            fragment.info.moof_position = tell(output)?;
            cursor
                .tfra
                .entries
                .push(TfraEntry::new(fragment.info.timestamp, fragment.info.moof_position));
            fragment.moof.write(output)?;

            let mut header = BytesMut::with_capacity(16);
            put_box_header(
                &mut header,
                BoxType::MDAT,
                fragment.info.mdat_size - fragment.mdat_header_size,
            );
            output.write_all(&header)?;
            for &index in &fragment.sample_indexes {
                let sample = cursor.samples.sample(index)?;
                let data = sample.read_data(input)?;
                output.write_all(&data)?;
            }
            debug!(
                track_id = fragment.info.track_id,
                sequence_number = fragment.info.sequence_number,
                samples = fragment.info.sample_count,
                position = fragment.info.moof_position,
                "wrote fragment"
            );
            fragments.push(fragment.info);
        }

        if let Some(sidx) = sidx.as_mut() {
            for (reference, info) in sidx.references.iter_mut().zip(&fragments) {
                let referenced_size = u32::try_from(info.moof_size + info.mdat_size)
                    .map_err(|_| Error::not_supported("fragment too large for sidx"))?;
                let subsegment_duration = u32::try_from(info.duration)
                    .map_err(|_| Error::not_supported("fragment duration too long for sidx"))?;
                *reference = SidxReference {
                    referenced_size,
                    subsegment_duration,
                    starts_with_sap: true,
                    ..Default::default()
                };
            }
            let bytes = Mp4Box::from(sidx.clone()).to_bytes()?;
            if bytes.len() != reserved {
                return Err(Error::invalid_state(format!(
                    "sidx grew from {reserved} to {} bytes",
                    bytes.len()
                )));
            }
            patch_at(output, sidx_position, &bytes)?;
        }

        let mut mfra: Mp4Box = ContainerBox::with_children(
            BoxType::MFRA,
            cursors.into_iter().map(|c| c.tfra.into()).collect(),
        )
        .into();
        let mut mfro = MfroBox { mfra_size: 0 };
        mfro.mfra_size = u32::try_from(mfra.size() + Mp4Box::from(mfro).size())
            .map_err(|_| Error::not_supported("mfra larger than 4 GiB"))?;
        if let Some(container) = mfra.as_container_mut() {
            container.add_child(mfro);
        }
        mfra.write(output)?;

        let output_size = tell(output)? - start;
        info!(fragments = fragments.len(), output_size, "fragmenting done");
        Ok(FragmentReport {
            anchor_track_id,
            fragment_duration_ms,
            fragments,
            output_size,
        })
    }

    fn create_cursors<R: Read + Seek + ?Sized>(
        &self,
        input: &mut R,
        movie: &Movie,
        fragmented: bool,
    ) -> Result<Vec<TrackCursor>> {
        let mut cursors = Vec::new();
        if fragmented {
            let mut cached: Vec<SyntheticSampleTable> = movie
                .tracks()
                .iter()
                .map(|track| {
                    let mut table = SyntheticSampleTable::default();
                    table.set_sample_description_count(track.sample_description_count());
                    table
                })
                .collect();
            let mut reader = LinearReader::new(movie, &mut *input, DEFAULT_MAX_BUFFER)?;
            for track in movie.tracks() {
                reader.enable_track(track.id)?;
            }
            loop {
                match reader.next_sample() {
                    Ok((track_id, sample)) => {
                        if let Some(i) = movie.tracks().iter().position(|t| t.id == track_id) {
                            cached[i].add_sample(sample);
                        }
                    }
                    Err(Error::EndOfStream) => break,
                    Err(e) => return Err(e),
                }
            }
            for (track, table) in movie.tracks().iter().zip(cached) {
                trace!(track_id = track.id, samples = table.sample_count(), "cached samples");
                cursors.push(TrackCursor::new(track.clone(), SampleArray::new(Box::new(table))));
            }
        } else {
            for track in movie.tracks() {
                if track.sample_table.sample_count() == 0 {
                    warn!(track_id = track.id, "track has no samples, skipping");
                    continue;
                }
                let table = Box::new(track.sample_table.clone());
                cursors.push(TrackCursor::new(track.clone(), SampleArray::new(table)));
            }
        }
        if cursors.is_empty() {
            return Err(Error::NoSuchItem("no valid track".into()));
        }
        if cursors
            .iter()
            .filter(|c| c.track.track_type == TrackType::Video)
            .count()
            > 1
        {
            warn!("more than one video track found");
        }
        Ok(cursors)
    }

    /// Resolve the track selector to a track id.
    fn select_track(&self, cursors: &[TrackCursor]) -> Result<Option<u32>> {
        let first_of = |track_type: TrackType, name: &str| {
            cursors
                .iter()
                .find(|c| c.track.track_type == track_type)
                .map(|c| Some(c.track.id))
                .ok_or_else(|| Error::NoSuchItem(format!("no {name} track found")))
        };
        match self.options.track {
            TrackSelector::All => Ok(None),
            TrackSelector::Audio => first_of(TrackType::Audio, "audio"),
            TrackSelector::Video => first_of(TrackType::Video, "video"),
            TrackSelector::Subtitles => first_of(TrackType::Subtitles, "subtitles"),
            TrackSelector::Id(id) => {
                if cursors.iter().any(|c| c.track.id == id) {
                    Ok(Some(id))
                } else {
                    Err(Error::NoSuchItem(format!("track {id}")))
                }
            }
        }
    }

    fn force_i_frame_sync<R: Read + Seek + ?Sized>(
        &self,
        input: &mut R,
        cursors: &mut [TrackCursor],
    ) -> Result<()> {
        let mut mode = self.options.force_i_frame_sync;
        if mode == ForceSyncMode::None {
            return Ok(());
        }
        let Some(video) = cursors
            .iter_mut()
            .find(|c| c.track.track_type == TrackType::Video)
        else {
            return Ok(());
        };
        let nalu_length_size = video.track.avc_nalu_length_size().ok_or_else(|| {
            Error::not_supported("forced I-frame sync needs AVC/H.264 video")
        })?;

        let count = video.samples.sample_count();
        if mode == ForceSyncMode::Auto {
            for i in 1..count {
                if video.samples.sample(i)?.is_sync {
                    debug!("not an open-GOP source, not forcing I-frame sync");
                    mode = ForceSyncMode::None;
                    break;
                }
            }
        }
        if mode == ForceSyncMode::None {
            return Ok(());
        }

        let mut forced = 0usize;
        for i in 0..count {
            let sample = video.samples.sample(i)?;
            let data = sample.read_data(input)?;
            if detect::is_i_frame(&data, nalu_length_size) {
                if !sample.is_sync {
                    forced += 1;
                }
                video.samples.force_sync(i);
            }
        }
        info!(track_id = video.track.id, forced, "forced I-frame sync flags");
        Ok(())
    }

    fn fragment_duration<R: Read + Seek + ?Sized>(
        &self,
        input: &mut R,
        cursors: &[TrackCursor],
        fragmented: bool,
    ) -> Result<u32> {
        if let Some(ms) = self.options.fragment_duration_ms {
            return Ok(ms);
        }
        let video = cursors.iter().find(|c| c.track.track_type == TrackType::Video);
        let audio = cursors.iter().find(|c| c.track.track_type == TrackType::Audio);
        let detected = match (video, audio) {
            (Some(v), _) => detect::video_fragment_duration(&v.samples, v.track.media_timescale)?,
            (None, Some(a)) if fragmented => {
                detect::audio_fragment_duration(input, a.track.id, &a.samples, a.track.media_timescale)?
            }
            _ => 0,
        };
        if detected == 0 {
            info!("unable to detect fragment duration, using default");
            Ok(DEFAULT_FRAGMENT_DURATION_MS)
        } else if detected > MAX_AUTO_FRAGMENT_DURATION_MS {
            info!(detected, "detected fragment duration too large, using default");
            Ok(DEFAULT_FRAGMENT_DURATION_MS)
        } else {
            debug!(detected, "detected fragment duration");
            Ok(detected)
        }
    }

    fn build_moov(&self, movie: &Movie, cursors: &[TrackCursor]) -> Result<Mp4Box> {
        let input_timescale = movie.timescale();
        let mut mvex = ContainerBox::new(BoxType::MVEX);
        let mut traks = Vec::with_capacity(cursors.len());
        let mut duration = 0;
        for cursor in cursors {
            let track_duration = convert_time(cursor.track.duration, input_timescale, OUTPUT_MOVIE_TIMESCALE);
            duration = duration.max(track_duration);
            traks.push(self.output_trak(&cursor.track, input_timescale, track_duration)?);
            mvex.add_child(TrexBox::new(cursor.track.id));
        }
        mvex.insert_child(0, MehdBox {
            fragment_duration: duration,
        });

        let next_track_id = cursors.iter().map(|c| c.track.id).max().unwrap_or(0) + 1;
        let mut moov = ContainerBox::new(BoxType::MOOV);
        moov.add_child(MvhdBox::new(OUTPUT_MOVIE_TIMESCALE, duration, next_track_id));
        for trak in traks {
            moov.add_child(trak);
        }
        moov.add_child(mvex);
        if self.options.copy_udta {
            if let Some(udta) = movie.moov().child(BoxType::UDTA) {
                moov.add_child(udta.clone());
            }
        }
        Ok(moov.into())
    }

    /// Copy of the input `trak` with an empty sample table and output
    /// timing.
    fn output_trak(&self, track: &Track, input_timescale: u32, duration: u64) -> Result<Mp4Box> {
        let stsd = track
            .stsd()
            .cloned()
            .ok_or_else(|| Error::invalid_format(format!("track {} has no stsd", track.id)))?;
        let mut trak = track.trak.clone();

        let stbl = trak
            .find_mut("mdia/minf/stbl")
            .ok_or_else(|| Error::invalid_format(format!("track {} has no stbl", track.id)))?;
        *stbl = SyntheticSampleTable::default().to_stbl(stsd);

        if let Some(tkhd) = trak.child_mut(BoxType::TKHD).and_then(Mp4Box::as_tkhd_mut) {
            tkhd.duration = duration;
        }
        if let Some(mdhd) = trak.find_mut("mdia/mdhd").and_then(Mp4Box::as_mdhd_mut) {
            mdhd.timescale = self.options.timescale.unwrap_or(track.media_timescale);
            mdhd.duration = 0;
        }

        if let Some(edts) = trak.child(BoxType::EDTS).cloned() {
            let mut new_edts = ContainerBox::new(BoxType::EDTS);
            for elst in edts.children().iter().filter_map(Mp4Box::as_elst) {
                let mut new_elst = ElstBox {
                    version: elst.version,
                    entries: elst.entries.clone(),
                };
                for entry in &mut new_elst.entries {
                    entry.segment_duration =
                        convert_time(entry.segment_duration, input_timescale, OUTPUT_MOVIE_TIMESCALE);
                    if let Some(timescale) = self.options.timescale.filter(|_| entry.media_time > 0) {
                        entry.media_time = convert_time_signed(entry.media_time, track.media_timescale, timescale);
                    }
                }
                new_edts.add_child(new_elst);
            }
            trak.remove_children(BoxType::EDTS);
            if let Some(container) = trak.as_container_mut() {
                container.insert_child(1, new_edts);
            }
        }
        Ok(trak)
    }

    fn plan_fragments(
        &self,
        cursors: &mut [TrackCursor],
        anchor: usize,
        fragment_duration_ms: u32,
    ) -> Result<Vec<PlannedFragment>> {
        let fragment_duration = fragment_duration_ms as u64;
        let mut anchor = Some(anchor);
        let mut sequence_number = self.options.sequence_number_start;
        let mut planned = Vec::new();

        while let Some(current_anchor) = anchor {
            let anchor_fragment_index = cursors[current_anchor].fragment_index;
            let mut chosen = cursors
                .iter()
                .position(|c| !c.eos && c.fragment_index < anchor_fragment_index);
            if chosen.is_none() {
                if cursors[current_anchor].eos {
                    anchor = None;
                    if !self.options.trim {
                        for (i, c) in cursors.iter().enumerate() {
                            if c.eos {
                                continue;
                            }
                            if anchor.is_none()
                                || matches!(c.track.track_type, TrackType::Video | TrackType::Audio)
                            {
                                anchor = Some(i);
                            }
                        }
                        if let Some(a) = anchor {
                            debug!(track_id = cursors[a].track.id, "new anchor");
                        }
                    }
                }
                chosen = anchor;
            }
            let (Some(index), Some(anchor_index)) = (chosen, anchor) else {
                break;
            };

            let target_dts = target_dts(cursors, index, anchor_index, fragment_duration);
            let end = cursors[index].end_sample_index(target_dts)?;
            trace!(
                track_id = cursors[index].track.id,
                dts = cursors[index].sample.dts,
                target_dts,
                start = cursors[index].sample_index,
                end,
                "fragment boundary"
            );
            planned.push(self.build_fragment(&mut cursors[index], index, end, sequence_number)?);
            sequence_number = sequence_number.wrapping_add(1);
        }
        Ok(planned)
    }

    /// Consume the cursor's samples up to `end` into one fragment.
    fn build_fragment(
        &self,
        cursor: &mut TrackCursor,
        index: usize,
        end: usize,
        sequence_number: u32,
    ) -> Result<PlannedFragment> {
        let is_video = cursor.track.track_type == TrackType::Video;
        let media_timescale = cursor.track.media_timescale;
        let timescale = self.options.timescale;
        let scale = |t: u64| timescale.map_or(t, |ts| convert_time(t, media_timescale, ts));

        let mut tfhd = TfhdBox::new(cursor.track.id);
        tfhd.default_base_is_moof = true;
        let description_index = cursor.sample.description_index;
        if description_index > 0 {
            tfhd.sample_description_index = Some(description_index + 1);
        }
        if is_video {
            tfhd.default_sample_flags = Some(VIDEO_DEFAULT_SAMPLE_FLAGS);
        }
        let mut trun = TrunBox {
            flags: TrunBox::FLAG_DATA_OFFSET | TrunBox::FLAG_SAMPLE_SIZE,
            ..Default::default()
        };
        if is_video {
            trun.flags |= TrunBox::FLAG_FIRST_SAMPLE_FLAGS;
            trun.first_sample_flags = VIDEO_FIRST_SAMPLE_FLAGS;
        }

        let timestamp = cursor.timestamp;
        let mut sample_indexes = Vec::new();
        let mut payload_size = 0u64;
        let mut duration = 0u64;
        let mut constant_duration = 0u32;
        let mut all_durations_equal = true;
        loop {
            let sample = cursor.sample;
            if sample.cts_delta != 0 {
                trun.flags |= TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET;
            }
            let next_unscaled = cursor.unscaled_timestamp + sample.duration as u64;
            let next_scaled = scale(next_unscaled);
            let sample_duration = u32::try_from(next_scaled.saturating_sub(cursor.timestamp))
                .map_err(|_| Error::not_supported("sample duration does not fit in 32 bits"))?;
            let entry = TrunEntry {
                sample_duration,
                sample_size: sample.size,
                sample_flags: 0,
                sample_composition_time_offset: match timescale {
                    Some(ts) => convert_time_signed(sample.cts_delta as i64, media_timescale, ts) as i32,
                    None => sample.cts_delta,
                },
            };
            if entry.sample_composition_time_offset < 0 {
                trun.version = 1;
            }
            sample_indexes.push(cursor.sample_index);
            payload_size += entry.sample_size as u64;
            duration += entry.sample_duration as u64;
            if all_durations_equal {
                if constant_duration == 0 {
                    constant_duration = entry.sample_duration;
                } else if constant_duration != entry.sample_duration {
                    all_durations_equal = false;
                }
            }
            trun.entries.push(entry);

            cursor.unscaled_timestamp = next_unscaled;
            cursor.timestamp = next_scaled;
            cursor.set_sample_index(cursor.sample_index + 1)?;
            if cursor.eos {
                debug!(track_id = cursor.track.id, "track reached the end");
                break;
            }
            if cursor.sample_index >= end {
                break;
            }
        }

        if all_durations_equal {
            tfhd.default_sample_duration = Some(constant_duration);
        } else {
            trun.flags |= TrunBox::FLAG_SAMPLE_DURATION;
        }

        let mut traf = ContainerBox::new(BoxType::TRAF);
        traf.add_child(tfhd);
        if !self.options.no_tfdt {
            let output_timescale = timescale.unwrap_or(media_timescale);
            let start = (self.options.tfdt_start * output_timescale as f64) as u64;
            traf.add_child(TfdtBox::new(timestamp + start));
        }
        traf.add_child(trun);
        let mut moof: Mp4Box =
            ContainerBox::with_children(BoxType::MOOF, vec![MfhdBox { sequence_number }.into(), traf.into()])
                .into();

        let moof_size = moof.size();
        let mdat_header_size = header_size_for(payload_size);
        if let Some(trun) = moof.find_mut("traf/trun").and_then(Mp4Box::as_trun_mut) {
            trun.data_offset = (moof_size + mdat_header_size) as i32;
        }
        cursor.fragment_index += 1;

        Ok(PlannedFragment {
            cursor: index,
            info: FragmentInfo {
                track_id: cursor.track.id,
                sequence_number,
                sample_count: sample_indexes.len(),
                timestamp,
                duration,
                moof_position: 0,
                moof_size,
                mdat_size: mdat_header_size + payload_size,
            },
            sample_indexes,
            moof,
            mdat_header_size,
        })
    }
}

/// The selected track, else the first video, audio or subtitles track.
fn anchor_index(cursors: &[TrackCursor], selected: Option<u32>) -> Option<usize> {
    if let Some(id) = selected {
        return cursors.iter().position(|c| c.track.id == id);
    }
    [TrackType::Video, TrackType::Audio, TrackType::Subtitles]
        .iter()
        .find_map(|&t| cursors.iter().position(|c| c.track.track_type == t))
}

/// Decode time, in the cursor's media timescale, the next fragment of
/// `cursors[index]` should end at.
fn target_dts(cursors: &[TrackCursor], index: usize, anchor: usize, fragment_duration: u64) -> u64 {
    let cursor = &cursors[index];
    let timescale = cursor.track.media_timescale;
    if index == anchor {
        let dts_ms = convert_time(cursor.sample.dts, timescale, 1000);
        let position = (dts_ms + fragment_duration / 2) / fragment_duration;
        return convert_time(fragment_duration * (position + 1), 1000, timescale);
    }
    let anchor = &cursors[anchor];
    let mut target = convert_time(anchor.sample.dts, anchor.track.media_timescale, timescale);
    if target <= cursor.sample.dts {
        // Past the anchor's last sample: fall back to the nominal grid.
        target = convert_time(fragment_duration * (cursor.fragment_index as u64 + 1), 1000, timescale);
        if target <= cursor.sample.dts {
            target = cursor.sample.dts + convert_time(fragment_duration, 1000, timescale);
        }
    }
    target
}

/// Input brands plus `iso5`, or `mp42` + `iso5` without an input `ftyp`.
fn output_ftyp(input: Option<&FtypBox>) -> Mp4Box {
    match input {
        Some(ftyp) => {
            let mut brands = ftyp.compatible_brands.clone();
            if !ftyp.has_compatible_brand(BoxType::BRAND_ISO5) {
                brands.push(BoxType::BRAND_ISO5);
            }
            FtypBox {
                major_brand: ftyp.major_brand,
                minor_version: ftyp.minor_version,
                compatible_brands: brands,
            }
            .into()
        }
        None => FtypBox {
            major_brand: BoxType::BRAND_MP42,
            minor_version: 0,
            compatible_brands: vec![BoxType::BRAND_ISO5],
        }
        .into(),
    }
}
