//! In-place rewriting of MP4 files through per-track sample transforms.
//!
//! A non-fragmented file is rewritten whole: samples are re-laid out in
//! source order behind a single `mdat`, with sizes taken from the handlers,
//! and the sample tables are updated before anything is written.
//!
//! A fragmented file is streamed one `moof` at a time. Each `moof` is written
//! as-is, followed by an `mdat` whose samples pass through the handlers.
//! Once the fragment is complete the `mdat` size and the `moof` (carrying the
//! new sample sizes and data offsets) are patched in place. A `sidx` is
//! patched with the new fragment sizes and `tfra` entries are remapped to the
//! new `moof` offsets.

mod fragment_map;
mod handler;

pub use fragment_map::FragmentMap;
pub use handler::{HandlerFactory, IdentityFactory, ProgressListener, TrackHandler};

use crate::boxes::{
    header_size_for, put_box_header, BoxReader, BoxType, Mp4Box, SidxBox, TrunBox,
    BOX_HEADER_SIZE,
};
use crate::movie::Movie;
use crate::sample_table::{FragmentSampleTable, Sample, SampleTable};
use crate::stream::{patch_at, tell, ReadSeek, WriteSeek};
use crate::{Error, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Summary of a processing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct ProcessReport {
    /// Tracks that had a handler.
    pub handled_tracks: Vec<u32>,
    /// Samples written in the non-fragmented path.
    pub samples: usize,
    pub fragments: usize,
    pub sidx_updated: bool,
    pub mfra_updated: bool,
    /// Bytes written.
    pub output_size: u64,
}

/// Top-level boxes of the input, sorted by role.
#[derive(Default)]
struct InputLayout {
    /// Boxes written ahead of any sample data, `moov` included.
    header: Vec<Mp4Box>,
    moov_index: Option<usize>,
    /// `moof` and `mdat` boxes with their source offsets, plus anything
    /// after the first `moof` that is not dropped.
    fragments: Vec<(u64, Mp4Box)>,
    mfra: Option<Mp4Box>,
    sidx_count: usize,
}

impl InputLayout {
    /// Scan `input`. With `init_only`, stop after the `moov`.
    fn scan(&mut self, input: &mut dyn ReadSeek, init_only: bool) -> Result<()> {
        let mut in_fragments = false;
        for item in BoxReader::new(input)? {
            let (offset, parsed) = item?;
            match parsed.box_type() {
                // fragment payloads are located through their mdat header
                BoxType::MDAT if !in_fragments => continue,
                BoxType::MOOV => {
                    self.moov_index = Some(self.header.len());
                    self.header.push(parsed);
                    if init_only {
                        break;
                    }
                }
                BoxType::MFRA => self.mfra = Some(parsed),
                BoxType::SSIX => {
                    debug!(offset, "dropping ssix");
                }
                BoxType::SIDX => {
                    self.sidx_count += 1;
                    if self.sidx_count == 1 {
                        self.push(offset, parsed, in_fragments);
                    }
                }
                BoxType::MOOF => {
                    in_fragments = true;
                    self.fragments.push((offset, parsed));
                }
                _ => self.push(offset, parsed, in_fragments),
            }
        }
        Ok(())
    }

    /// Scan a stream holding only fragments.
    fn scan_fragments(&mut self, input: &mut dyn ReadSeek) -> Result<()> {
        for item in BoxReader::new(input)? {
            let (offset, parsed) = item?;
            match parsed.box_type() {
                BoxType::SSIX => continue,
                BoxType::MFRA => self.mfra = Some(parsed),
                BoxType::SIDX => {
                    self.sidx_count += 1;
                    if self.sidx_count == 1 {
                        self.fragments.push((offset, parsed));
                    }
                }
                _ => self.fragments.push((offset, parsed)),
            }
        }
        Ok(())
    }

    fn push(&mut self, offset: u64, parsed: Mp4Box, in_fragments: bool) {
        if in_fragments {
            self.fragments.push((offset, parsed));
        } else {
            self.header.push(parsed);
        }
    }

    /// Multi-index streams cannot be updated: drop every `sidx`.
    fn drop_multiple_sidx(&mut self) {
        if self.sidx_count <= 1 {
            return;
        }
        warn!(count = self.sidx_count, "multiple sidx boxes found, dropping the segment index");
        self.header.retain(|b| b.box_type() != BoxType::SIDX);
        if let Some(moov_index) = self.moov_index.as_mut() {
            // the sidx may have sat before the moov
            *moov_index = self
                .header
                .iter()
                .position(|b| b.box_type() == BoxType::MOOV)
                .unwrap_or(*moov_index);
        }
        self.fragments.retain(|(_, b)| b.box_type() != BoxType::SIDX);
    }

    fn moof_count(&self) -> usize {
        self.fragments
            .iter()
            .filter(|(_, b)| b.box_type() == BoxType::MOOF)
            .count()
    }
}

/// One sample of the non-fragmented layout.
struct Locator {
    track: usize,
    index: usize,
    chunk: usize,
    sample: Sample,
}

/// A `sidx` written to the output, to be patched once fragments are known.
struct PendingSidx {
    position: u64,
    /// First byte after the written `sidx`.
    end: u64,
    sidx: SidxBox,
}

impl PendingSidx {
    fn new(output: &mut dyn WriteSeek, sidx: &Mp4Box) -> Result<Option<Self>> {
        let Some(typed) = sidx.as_sidx() else {
            return Ok(None);
        };
        let position = tell(output)?;
        Ok(Some(Self {
            position,
            end: position + sidx.size(),
            sidx: typed.clone(),
        }))
    }
}

/// Rewrites files through a [`HandlerFactory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Processor;

impl Processor {
    pub fn new() -> Self {
        Self
    }

    /// Process the file at `input` into `output`.
    pub fn process_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        factory: &mut dyn HandlerFactory,
        listener: Option<&mut dyn ProgressListener>,
    ) -> Result<ProcessReport> {
        let mut reader = BufReader::new(open(input.as_ref())?);
        let output = output.as_ref();
        let file = File::create(output).map_err(|source| Error::CannotOpenFile {
            path: output.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let report = self.process(&mut reader, &mut writer, factory, listener)?;
        writer.flush()?;
        Ok(report)
    }

    /// Process a complete file.
    pub fn process(
        &self,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        factory: &mut dyn HandlerFactory,
        mut listener: Option<&mut dyn ProgressListener>,
    ) -> Result<ProcessReport> {
        let mut layout = InputLayout::default();
        layout.scan(input, false)?;
        layout.drop_multiple_sidx();
        let moov_index = layout
            .moov_index
            .ok_or_else(|| Error::invalid_format("no moov box"))?;
        let mut movie = Movie::from_moov(layout.header[moov_index].clone())?;
        info!(
            tracks = movie.tracks().len(),
            fragments = layout.moof_count(),
            "processing"
        );

        let start = tell(output)?;
        let mut report = ProcessReport::default();
        let locators = layout_samples(&movie);
        let mut handlers = create_track_handlers(&movie, factory)?;
        report.handled_tracks = handlers.keys().copied().collect();
        report.handled_tracks.sort_unstable();

        let mdat_payload_size = assign_chunks(&mut movie, &locators, &mut handlers, input)?;
        for (&track_id, handler) in handlers.iter_mut() {
            if let Some(trak) = movie.trak_mut(track_id) {
                handler.process_track(trak)?;
            }
        }

        let mdat_header_size = if mdat_payload_size > 0 {
            header_size_for(mdat_payload_size)
        } else {
            0
        };
        // Chunk offsets may need co64, which grows the moov: iterate until
        // the header size is stable.
        let mut delta = 0;
        loop {
            movie.write_sample_tables(delta)?;
            let header_size: u64 = layout
                .header
                .iter()
                .enumerate()
                .map(|(i, b)| if i == moov_index { movie.moov().size() } else { b.size() })
                .sum();
            let next = header_size + mdat_header_size;
            if next == delta {
                break;
            }
            delta = next;
        }
        layout.header[moov_index] = movie.moov().clone();

        let mut pending_sidx = None;
        for b in &layout.header {
            if b.box_type() == BoxType::SIDX {
                pending_sidx = PendingSidx::new(output, b)?;
            }
            b.write(output)?;
        }

        if mdat_payload_size > 0 {
            let mut header = BytesMut::with_capacity(16);
            put_box_header(&mut header, BoxType::MDAT, mdat_payload_size);
            output.write_all(&header)?;
            let total = locators.len();
            for (step, locator) in locators.iter().enumerate() {
                let data = locator.sample.read_data(input)?;
                let track_id = movie.tracks()[locator.track].id;
                let data = match handlers.get_mut(&track_id) {
                    Some(handler) => handler.process_sample(&locator.sample, data)?,
                    None => data,
                };
                trace!(track_id, index = locator.index, size = data.len(), "sample");
                output.write_all(&data)?;
                notify(&mut listener, step + 1, total)?;
            }
            report.samples = total;
        }

        let fragments = std::mem::take(&mut layout.fragments);
        let map =
            self.process_fragments(&movie, fragments, input, output, factory, &mut pending_sidx, &mut listener)?;
        report.fragments = map.len();
        report.sidx_updated = finish_sidx(output, pending_sidx)?;
        report.mfra_updated = finish_mfra(output, layout.mfra.take(), &map)?;

        report.output_size = tell(output)? - start;
        info!(
            samples = report.samples,
            fragments = report.fragments,
            output_size = report.output_size,
            "processing done"
        );
        Ok(report)
    }

    /// Process the media segment `fragments` of a file whose `moov` lives in
    /// `init`. Only the rewritten fragments are written to `output`.
    pub fn process_with_fragments(
        &self,
        init: &mut dyn ReadSeek,
        fragments: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        factory: &mut dyn HandlerFactory,
        mut listener: Option<&mut dyn ProgressListener>,
    ) -> Result<ProcessReport> {
        let mut layout = InputLayout::default();
        layout.scan(init, true)?;
        let moov_index = layout
            .moov_index
            .ok_or_else(|| Error::invalid_format("no moov box in init segment"))?;
        let movie = Movie::from_moov(layout.header[moov_index].clone())?;
        layout.scan_fragments(fragments)?;
        layout.drop_multiple_sidx();
        info!(fragments = layout.moof_count(), "processing fragments");

        let start = tell(output)?;
        let mut pending_sidx = None;
        let entries = std::mem::take(&mut layout.fragments);
        let map =
            self.process_fragments(&movie, entries, fragments, output, factory, &mut pending_sidx, &mut listener)?;
        let sidx_updated = finish_sidx(output, pending_sidx)?;
        let mfra_updated = finish_mfra(output, layout.mfra.take(), &map)?;
        Ok(ProcessReport {
            fragments: map.len(),
            sidx_updated,
            mfra_updated,
            output_size: tell(output)? - start,
            ..Default::default()
        })
    }

    /// Rewrite every fragment of `entries`, reading samples from `input`.
    /// Non-`moof` entries are copied through. Returns where each `moof`
    /// moved to.
    #[allow(clippy::too_many_arguments)]
    fn process_fragments(
        &self,
        movie: &Movie,
        entries: Vec<(u64, Mp4Box)>,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        factory: &mut dyn HandlerFactory,
        pending_sidx: &mut Option<PendingSidx>,
        listener: &mut Option<&mut dyn ProgressListener>,
    ) -> Result<FragmentMap> {
        let total = entries
            .iter()
            .filter(|(_, b)| b.box_type() == BoxType::MOOF)
            .count();
        let mut map = FragmentMap::new();
        let mut next_dts: HashMap<u32, u64> = HashMap::new();
        let mut fragment_index = 0usize;
        let payload_offsets = mdat_payload_offsets(&entries);

        for (i, (offset, mut moof)) in entries.into_iter().enumerate() {
            if moof.box_type() == BoxType::MDAT {
                continue;
            }
            if moof.box_type() != BoxType::MOOF {
                if moof.box_type() == BoxType::SIDX {
                    *pending_sidx = PendingSidx::new(output, &moof)?;
                }
                moof.write(output)?;
                continue;
            }

            let mdat_payload_offset = payload_offsets[i].unwrap_or(offset + moof.size() + BOX_HEADER_SIZE);
            let mut tracks = Vec::new();
            for traf in moof.children_of(BoxType::TRAF) {
                let track_id = traf
                    .child(BoxType::TFHD)
                    .and_then(Mp4Box::as_tfhd)
                    .map(|tfhd| tfhd.track_id)
                    .ok_or_else(|| Error::invalid_format("traf has no tfhd"))?;
                let trex = movie.trex(track_id);
                let mut handler = factory.create_fragment_handler(movie.track(track_id), trex, traf)?;
                let origin = next_dts.get(&track_id).copied().unwrap_or(0);
                let table = FragmentSampleTable::new(traf, trex, offset, mdat_payload_offset, origin)?;
                next_dts.insert(
                    track_id,
                    table.samples().last().map_or(origin, |s| s.dts + s.duration as u64),
                );
                if let Some(handler) = handler.as_mut() {
                    handler.prepare_for_samples(&table)?;
                }
                tracks.push((handler, table));
            }

            let moof_position = tell(output)?;
            let moof_size = moof.size();
            moof.write(output)?;
            map.insert(offset, moof_position)?;

            let mdat_position = tell(output)?;
            output.write_all(&[0, 0, 0, 0])?;
            output.write_all(&BoxType::MDAT.0)?;
            let mut mdat_size = BOX_HEADER_SIZE;

            let trafs = moof
                .as_container_mut()
                .ok_or_else(|| Error::invalid_state("moof is not a container"))?
                .children
                .iter_mut()
                .filter(|c| c.box_type() == BoxType::TRAF);
            for (traf, (mut handler, table)) in trafs.zip(tracks) {
                mdat_size += rewrite_traf(
                    traf,
                    handler.as_deref_mut(),
                    &table,
                    input,
                    output,
                    moof_position,
                    mdat_position,
                    mdat_size,
                )?;
            }

            if mdat_size > u32::MAX as u64 {
                return Err(Error::not_supported("fragment mdat larger than 4 GiB"));
            }
            patch_at(output, mdat_position, &(mdat_size as u32).to_be_bytes())?;
            let bytes = moof.to_bytes()?;
            if bytes.len() as u64 != moof_size {
                return Err(Error::invalid_state("moof size changed while processing"));
            }
            patch_at(output, moof_position, &bytes)?;
            let fragment_end = tell(output)?;

            if let Some(pending) = pending_sidx.as_mut() {
                let sidx = &mut pending.sidx;
                if fragment_index == 0 {
                    sidx.first_offset = moof_position.saturating_sub(pending.end);
                }
                if let Some(reference) = sidx.references.get_mut(fragment_index) {
                    reference.referenced_size = u32::try_from(fragment_end - moof_position)
                        .map_err(|_| Error::not_supported("fragment too large for sidx"))?;
                }
            }

            debug!(
                source_offset = offset,
                moof_position,
                mdat_size,
                "processed fragment"
            );
            fragment_index += 1;
            notify(listener, fragment_index, total)?;
        }
        Ok(map)
    }
}

/// Payload offset of the `mdat` following each `moof` of `entries`, taken
/// from the parsed header so 64-bit `mdat` headers are honoured.
fn mdat_payload_offsets(entries: &[(u64, Mp4Box)]) -> Vec<Option<u64>> {
    entries
        .iter()
        .enumerate()
        .map(|(i, (_, b))| {
            if b.box_type() != BoxType::MOOF {
                return None;
            }
            entries[i + 1..]
                .iter()
                .take_while(|(_, next)| next.box_type() != BoxType::MOOF)
                .find_map(|(_, next)| match next {
                    Mp4Box::Mdat(mdat) => Some(mdat.payload_offset),
                    _ => None,
                })
        })
        .collect()
}

/// Sample order of the non-fragmented output: smallest source offset first.
fn layout_samples(movie: &Movie) -> Vec<Locator> {
    let tracks = movie.tracks();
    let mut next = vec![0usize; tracks.len()];
    let mut locators = Vec::new();
    loop {
        let mut chosen: Option<(usize, Sample)> = None;
        for (t, track) in tracks.iter().enumerate() {
            let Ok(sample) = track.sample_table.sample(next[t]) else {
                continue;
            };
            if chosen.map_or(true, |(_, best)| sample.offset <= best.offset) {
                chosen = Some((t, sample));
            }
        }
        let Some((track, sample)) = chosen else {
            break;
        };
        let index = next[track];
        let chunk = tracks[track]
            .sample_table
            .chunk_for_sample(index)
            .map_or(0, |(chunk, _)| chunk);
        locators.push(Locator {
            track,
            index,
            chunk,
            sample,
        });
        next[track] += 1;
    }
    locators
}

fn create_track_handlers(
    movie: &Movie,
    factory: &mut dyn HandlerFactory,
) -> Result<HashMap<u32, Box<dyn TrackHandler>>> {
    let mut handlers = HashMap::new();
    for track in movie.tracks() {
        if let Some(handler) = factory.create_track_handler(track)? {
            debug!(track_id = track.id, "track handler created");
            handlers.insert(track.id, handler);
        }
    }
    Ok(handlers)
}

/// Give every chunk its offset relative to the start of the `mdat`
/// payload, and every sample its processed size. Returns the payload size.
fn assign_chunks(
    movie: &mut Movie,
    locators: &[Locator],
    handlers: &mut HashMap<u32, Box<dyn TrackHandler>>,
    input: &mut dyn ReadSeek,
) -> Result<u64> {
    let mut current: Option<(usize, usize)> = None;
    let mut chunk_offset = 0u64;
    let mut chunk_size = 0u64;
    let mut payload_size = 0u64;
    for locator in locators {
        let track = &mut movie.tracks_mut()[locator.track];
        if current != Some((locator.track, locator.chunk)) {
            chunk_offset += chunk_size;
            chunk_size = 0;
            current = Some((locator.track, locator.chunk));
            track.sample_table.set_chunk_offset(locator.chunk, chunk_offset)?;
        }
        let size = match handlers.get_mut(&track.id) {
            Some(handler) => {
                let size = handler.processed_sample_size(&locator.sample, input)?;
                track.sample_table.set_sample_size(locator.index, size)?;
                size
            }
            None => locator.sample.size,
        };
        chunk_size += size as u64;
        payload_size += size as u64;
    }
    Ok(payload_size)
}

/// Write the samples of one `traf` and update its `trun` sizes and data
/// offsets. Returns the number of payload bytes written.
#[allow(clippy::too_many_arguments)]
fn rewrite_traf(
    traf: &mut Mp4Box,
    mut handler: Option<&mut (dyn TrackHandler + 'static)>,
    table: &FragmentSampleTable,
    input: &mut dyn ReadSeek,
    output: &mut dyn WriteSeek,
    moof_position: u64,
    mdat_position: u64,
    mdat_size: u64,
) -> Result<u64> {
    let explicit_base = traf
        .child(BoxType::TFHD)
        .and_then(Mp4Box::as_tfhd)
        .is_some_and(|tfhd| tfhd.base_data_offset.is_some());
    let base = if explicit_base {
        mdat_position + BOX_HEADER_SIZE
    } else {
        moof_position
    };

    let mut written = 0u64;
    let mut sizes = Vec::with_capacity(table.samples().len());
    for sample in table.samples() {
        let data = sample.read_data(input)?;
        let data = match handler.as_deref_mut() {
            Some(handler) => handler.process_sample(sample, data)?,
            None => data,
        };
        output.write_all(&data)?;
        sizes.push((sample.size, data.len() as u32));
        written += data.len() as u64;
    }

    let container = traf
        .as_container_mut()
        .ok_or_else(|| Error::invalid_state("traf is not a container"))?;
    let mut run_start = mdat_position + mdat_size;
    let mut sizes = sizes.into_iter();
    // Processed size shared by samples whose run relies on the default size.
    let mut implicit_size: Option<u32> = None;
    let mut implicit_changed = false;
    for trun in container.children.iter_mut().filter_map(Mp4Box::as_trun_mut) {
        if trun.has(TrunBox::FLAG_DATA_OFFSET) {
            trun.data_offset = i32::try_from(run_start as i64 - base as i64)
                .map_err(|_| Error::not_supported("trun data offset out of 32-bit range"))?;
        }
        let per_sample_size = trun.has(TrunBox::FLAG_SAMPLE_SIZE);
        for entry in &mut trun.entries {
            let Some((before, after)) = sizes.next() else {
                break;
            };
            if per_sample_size {
                entry.sample_size = after;
            } else {
                implicit_changed |= before != after;
                if *implicit_size.get_or_insert(after) != after {
                    return Err(Error::not_supported(
                        "processed samples differ in size in a run without per-sample sizes",
                    ));
                }
            }
            run_start += after as u64;
        }
    }

    if let Some(tfhd) = traf.child_mut(BoxType::TFHD).and_then(Mp4Box::as_tfhd_mut) {
        // data offsets above were computed against the new payload start
        if tfhd.base_data_offset.is_some() {
            tfhd.base_data_offset = Some(mdat_position + BOX_HEADER_SIZE);
        }
        if implicit_changed {
            match (tfhd.default_sample_size.as_mut(), implicit_size) {
                (Some(default), Some(size)) => *default = size,
                _ => {
                    return Err(Error::not_supported(
                        "processed sample size needs a default size in tfhd",
                    ))
                }
            }
        }
    }
    if let Some(handler) = handler {
        handler.finish_fragment(traf)?;
    }
    Ok(written)
}

/// Point every `tfra` entry at the new `moof` offsets and append the `mfra`.
fn finish_mfra(output: &mut dyn WriteSeek, mfra: Option<Mp4Box>, map: &FragmentMap) -> Result<bool> {
    let Some(mut mfra) = mfra else {
        return Ok(false);
    };
    if let Some(container) = mfra.as_container_mut() {
        for tfra in container.children.iter_mut().filter_map(Mp4Box::as_tfra_mut) {
            for entry in &mut tfra.entries {
                match map.get(entry.moof_offset) {
                    Some(offset) => entry.moof_offset = offset,
                    None => warn!(
                        track_id = tfra.track_id,
                        moof_offset = entry.moof_offset,
                        "tfra entry does not point at a moof"
                    ),
                }
            }
        }
    }
    mfra.write(output)?;
    Ok(true)
}

fn finish_sidx(output: &mut dyn WriteSeek, pending: Option<PendingSidx>) -> Result<bool> {
    let Some(PendingSidx { position, end, sidx }) = pending else {
        return Ok(false);
    };
    let bytes = Mp4Box::from(sidx).to_bytes()?;
    if bytes.len() as u64 != end - position {
        return Err(Error::invalid_state(format!(
            "sidx grew from {} to {} bytes while processing",
            end - position,
            bytes.len()
        )));
    }
    patch_at(output, position, &bytes)?;
    Ok(true)
}

fn notify(listener: &mut Option<&mut dyn ProgressListener>, step: usize, total: usize) -> Result<()> {
    if let Some(listener) = listener.as_mut() {
        if let ControlFlow::Break(()) = listener.on_progress(step, total) {
            info!(step, total, "processing cancelled");
            return Err(Error::Cancelled);
        }
    }
    Ok(())
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| Error::CannotOpenFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests;
