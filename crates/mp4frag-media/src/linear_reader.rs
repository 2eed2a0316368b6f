//! Multi-track sample reader.
//!
//! Samples of the enabled tracks come out in storage order: the pending
//! sample with the smallest source offset first. For a conventionally
//! interleaved file this is also non-decreasing decode time. Samples read
//! ahead for one track while another is being serviced are held in a
//! bounded buffer; once it is full, requests fail with
//! [`Error::NotEnoughSpace`] until the caller drains the other tracks.
//!
//! For fragmented movies the stream is scanned for `moof` boxes on demand
//! and each fragment's samples are resolved with a
//! [`FragmentSampleTable`]. Decode times carry over from one fragment to
//! the next when a fragment has no `tfdt`.

use crate::boxes::{BoxReader, BoxType, Mp4Box, TrexBox};
use crate::movie::Movie;
use crate::sample_table::{FragmentSampleTable, Sample};
use crate::stream::{read_at, stream_size};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::io::{Read, Seek};
use tracing::{debug, trace, warn};

/// Default read-ahead capacity in bytes.
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct Buffered {
    seq: u64,
    sample: Sample,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Tracker {
    track_id: u32,
    enabled: bool,
    trex: Option<TrexBox>,
    /// Samples of the current source: the `stbl`, then one fragment at a time.
    samples: Vec<Sample>,
    next: usize,
    next_dts: u64,
    queue: VecDeque<Buffered>,
}

impl Tracker {
    fn pending(&self) -> Option<&Sample> {
        if self.enabled {
            self.samples.get(self.next)
        } else {
            None
        }
    }
}

/// Reads the samples of several tracks from one stream.
pub struct LinearReader<R> {
    stream: R,
    trackers: Vec<Tracker>,
    fragmented: bool,
    fragment_pos: u64,
    stream_end: u64,
    buffered: usize,
    max_buffer: usize,
    seq: u64,
}

impl<R: Read + Seek> LinearReader<R> {
    /// Create a reader for `movie` whose sample data (and fragments, if
    /// any) live in `stream`. No track is enabled yet.
    pub fn new(movie: &Movie, mut stream: R, max_buffer: usize) -> Result<Self> {
        let stream_end = stream_size(&mut stream)?;
        let trackers = movie
            .tracks()
            .iter()
            .map(|track| Tracker {
                track_id: track.id,
                enabled: false,
                trex: movie.trex(track.id).copied(),
                samples: track.sample_table.samples().to_vec(),
                next: 0,
                next_dts: track
                    .sample_table
                    .samples()
                    .last()
                    .map_or(0, |s| s.dts + s.duration as u64),
                queue: VecDeque::new(),
            })
            .collect();
        Ok(Self {
            stream,
            trackers,
            fragmented: movie.has_fragments(),
            fragment_pos: 0,
            stream_end,
            buffered: 0,
            max_buffer: max_buffer.max(1),
            seq: 0,
        })
    }

    /// Include a track in the output.
    pub fn enable_track(&mut self, track_id: u32) -> Result<()> {
        let tracker = self
            .trackers
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or_else(|| Error::NoSuchItem(format!("track {track_id}")))?;
        tracker.enabled = true;
        Ok(())
    }

    /// Bytes currently held in the read-ahead buffer.
    pub fn buffer_fullness(&self) -> usize {
        self.buffered
    }

    pub fn into_inner(self) -> R {
        self.stream
    }

    /// Next sample of any enabled track, with its payload.
    pub fn read_next_sample(&mut self) -> Result<(u32, Sample, Vec<u8>)> {
        if let Some(item) = self.pop_earliest() {
            return Ok(item);
        }
        if !self.fill_next()? {
            return Err(Error::EndOfStream);
        }
        self.pop_earliest().ok_or(Error::EndOfStream)
    }

    /// Next sample of one track. Samples of other tracks met on the way are
    /// buffered.
    pub fn read_next_sample_for(&mut self, track_id: u32) -> Result<(Sample, Vec<u8>)> {
        let index = self.enabled_index(track_id)?;
        loop {
            if let Some(item) = self.trackers[index].queue.pop_front() {
                self.buffered -= item.data.len();
                return Ok((item.sample, item.data));
            }
            if !self.fill_next()? {
                return Err(Error::EndOfStream);
            }
        }
    }

    /// Next sample of any enabled track, without reading its payload.
    pub fn next_sample(&mut self) -> Result<(u32, Sample)> {
        if let Some((track_id, sample, _)) = self.pop_earliest() {
            return Ok((track_id, sample));
        }
        let (index, sample) = self.advance()?.ok_or(Error::EndOfStream)?;
        Ok((self.trackers[index].track_id, sample))
    }

    /// Reposition a track within its current sample source. Buffered
    /// samples of that track are dropped.
    pub fn set_sample_index(&mut self, track_id: u32, index: usize) -> Result<()> {
        let i = self.enabled_index(track_id)?;
        let tracker = &mut self.trackers[i];
        let sample = *tracker.samples.get(index).ok_or(Error::OutOfRange)?;
        let dropped: usize = tracker.queue.drain(..).map(|b| b.data.len()).sum();
        tracker.next = index;
        tracker.next_dts = sample.dts;
        self.buffered -= dropped;
        trace!(track_id, index, dropped, "seek");
        Ok(())
    }

    fn enabled_index(&self, track_id: u32) -> Result<usize> {
        self.trackers
            .iter()
            .position(|t| t.track_id == track_id && t.enabled)
            .ok_or_else(|| Error::NoSuchItem(format!("enabled track {track_id}")))
    }

    fn pop_earliest(&mut self) -> Option<(u32, Sample, Vec<u8>)> {
        let tracker = self
            .trackers
            .iter_mut()
            .filter(|t| !t.queue.is_empty())
            .min_by_key(|t| t.queue.front().map_or(u64::MAX, |b| b.seq))?;
        let item = tracker.queue.pop_front()?;
        self.buffered -= item.data.len();
        Some((tracker.track_id, item.sample, item.data))
    }

    /// Read the next sample in storage order into its track's queue.
    /// Returns `false` once every enabled track is exhausted.
    fn fill_next(&mut self) -> Result<bool> {
        let Some((index, sample)) = self.advance()? else {
            return Ok(false);
        };
        let size = sample.size as usize;
        if self.buffered > 0 && self.buffered + size > self.max_buffer {
            let tracker = &mut self.trackers[index];
            tracker.next -= 1;
            tracker.next_dts = sample.dts;
            return Err(Error::NotEnoughSpace);
        }
        let data = read_at(&mut self.stream, sample.offset, size)?;
        self.seq += 1;
        self.buffered += size;
        self.trackers[index].queue.push_back(Buffered {
            seq: self.seq,
            sample,
            data,
        });
        Ok(true)
    }

    /// Step past the pending sample with the smallest offset, loading
    /// fragments as needed.
    fn advance(&mut self) -> Result<Option<(usize, Sample)>> {
        loop {
            let next = self
                .trackers
                .iter()
                .enumerate()
                .filter_map(|(i, t)| t.pending().map(|s| (i, s.offset)))
                .min_by_key(|&(_, offset)| offset);
            if let Some((index, _)) = next {
                let tracker = &mut self.trackers[index];
                let sample = tracker.samples[tracker.next];
                tracker.next += 1;
                tracker.next_dts = sample.dts + sample.duration as u64;
                return Ok(Some((index, sample)));
            }
            if !self.fragmented || !self.load_next_fragment()? {
                return Ok(None);
            }
        }
    }

    fn load_next_fragment(&mut self) -> Result<bool> {
        let mut moof: Option<(u64, Mp4Box)> = None;
        let mut mdat_payload_offset = None;
        let mut boxes = BoxReader::with_range(&mut self.stream, self.fragment_pos, self.stream_end);
        for item in boxes.by_ref() {
            let (offset, parsed) = item?;
            match parsed {
                Mp4Box::Mdat(mdat) if moof.is_some() => {
                    mdat_payload_offset = Some(mdat.payload_offset);
                    break;
                }
                b if b.box_type() == BoxType::MOOF => {
                    if let Some((previous, _)) = moof.replace((offset, b)) {
                        warn!(offset = previous, "moof without mdat, skipping");
                    }
                }
                _ => {}
            }
        }
        self.fragment_pos = boxes.position();

        let Some((moof_offset, moof)) = moof else {
            debug!("no more fragments");
            return Ok(false);
        };
        let mdat_payload_offset = mdat_payload_offset.unwrap_or(moof_offset + moof.size());

        for tracker in self.trackers.iter_mut().filter(|t| t.enabled) {
            tracker.samples.clear();
            tracker.next = 0;
        }
        for traf in moof.children_of(BoxType::TRAF) {
            let track_id = traf
                .child(BoxType::TFHD)
                .and_then(Mp4Box::as_tfhd)
                .ok_or_else(|| Error::invalid_format("traf has no tfhd"))?
                .track_id;
            let Some(tracker) = self
                .trackers
                .iter_mut()
                .find(|t| t.track_id == track_id && t.enabled)
            else {
                continue;
            };
            let table = FragmentSampleTable::new(
                traf,
                tracker.trex.as_ref(),
                moof_offset,
                mdat_payload_offset,
                tracker.next_dts,
            )?;
            tracker.next_dts = tracker.next_dts.max(
                table
                    .samples()
                    .last()
                    .map_or(0, |s| s.dts + s.duration as u64),
            );
            tracker.samples.extend_from_slice(table.samples());
        }
        trace!(moof_offset, "loaded fragment");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movie::Mp4File;
    use crate::testing::{Mp4Builder, TrackSpec};
    use std::io::Cursor;

    fn open(builder: &Mp4Builder, max_buffer: usize) -> LinearReader<Cursor<Vec<u8>>> {
        let data = builder.build();
        let file = Mp4File::parse(&mut Cursor::new(data.clone())).unwrap();
        let movie = file.require_movie().unwrap();
        let mut reader = LinearReader::new(movie, Cursor::new(data), max_buffer).unwrap();
        for track in movie.tracks() {
            reader.enable_track(track.id).unwrap();
        }
        reader
    }

    fn av_builder() -> Mp4Builder {
        Mp4Builder::new()
            .track(TrackSpec::video(1, 10, 1000).sync_every(5))
            .track(TrackSpec::audio(2, 20, 1024))
    }

    #[test]
    fn test_reads_every_sample_in_storage_order() {
        let builder = av_builder();
        let mut reader = open(&builder, DEFAULT_MAX_BUFFER);
        let mut last_offset = 0;
        let mut counts = [0usize; 2];
        loop {
            match reader.read_next_sample() {
                Ok((track_id, sample, data)) => {
                    assert!(sample.offset >= last_offset);
                    last_offset = sample.offset;
                    let spec = &builder.tracks()[track_id as usize - 1];
                    assert_eq!(data, spec.payload(counts[track_id as usize - 1]));
                    counts[track_id as usize - 1] += 1;
                }
                Err(Error::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(counts, [10, 20]);
    }

    #[test]
    fn test_single_track_reads_buffer_the_others() {
        let mut reader = open(&av_builder(), DEFAULT_MAX_BUFFER);
        let mut offsets = Vec::new();
        for _ in 0..10 {
            let (sample, _) = reader.read_next_sample_for(1).unwrap();
            offsets.push(sample.offset);
        }
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert!(reader.buffer_fullness() > 0);
        assert_eq!(
            reader.read_next_sample_for(1).unwrap_err().kind(),
            crate::ErrorKind::EndOfStream
        );
        for _ in 0..20 {
            reader.read_next_sample_for(2).unwrap();
        }
        assert_eq!(reader.buffer_fullness(), 0);
    }

    #[test]
    fn test_full_buffer_is_not_end_of_stream() {
        let mut reader = open(&av_builder(), 300);
        let err = loop {
            if let Err(e) = reader.read_next_sample_for(1) {
                break e;
            }
        };
        assert_eq!(err.kind(), crate::ErrorKind::NotEnoughSpace);
        // Draining the audio track frees room for video again.
        while reader.buffer_fullness() > 0 {
            reader.read_next_sample_for(2).unwrap();
        }
        assert!(reader.read_next_sample_for(1).is_ok());
    }

    #[test]
    fn test_fragmented_input_continues_across_moofs() {
        let builder = Mp4Builder::new()
            .track(TrackSpec::video(1, 9, 1000).sync_every(3))
            .fragmented(3);
        let mut reader = open(&builder, DEFAULT_MAX_BUFFER);
        let mut dts = Vec::new();
        while let Ok((_, sample, data)) = reader.read_next_sample() {
            assert_eq!(data, builder.tracks()[0].payload(dts.len()));
            dts.push(sample.dts);
        }
        assert_eq!(dts, (0..9).map(|i| i * 1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_metadata_iteration_skips_payloads() {
        let mut reader = open(&av_builder(), DEFAULT_MAX_BUFFER);
        let mut count = 0;
        while reader.next_sample().is_ok() {
            count += 1;
        }
        assert_eq!(count, 30);
        assert_eq!(reader.buffer_fullness(), 0);
    }

    #[test]
    fn test_set_sample_index() {
        let mut reader = open(&av_builder(), DEFAULT_MAX_BUFFER);
        reader.read_next_sample_for(1).unwrap();
        reader.set_sample_index(1, 7).unwrap();
        let (sample, _) = reader.read_next_sample_for(1).unwrap();
        assert_eq!(sample.dts, 7000);
        assert_eq!(
            reader.set_sample_index(1, 10).unwrap_err().kind(),
            crate::ErrorKind::OutOfRange
        );
    }

    #[test]
    fn test_unknown_track() {
        let mut reader = open(&av_builder(), DEFAULT_MAX_BUFFER);
        assert_eq!(
            reader.enable_track(9).unwrap_err().kind(),
            crate::ErrorKind::NoSuchItem
        );
    }
}
