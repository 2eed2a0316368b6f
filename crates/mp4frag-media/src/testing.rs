//! Synthetic MP4 files for tests and benches.
//!
//! [`Mp4Builder`] lays out `ftyp`, `moov` and `mdat` for a set of
//! [`TrackSpec`]s, or an already fragmented file when asked to. Sample
//! payloads are deterministic (see [`TrackSpec::payload`]) so tests can
//! compare bytes after a round trip. Video tracks carry length-prefixed
//! H.264 NAL units with a real slice header.

use crate::boxes::{
    BoxType, ContainerBox, FtypBox, HdlrBox, MdhdBox, MehdBox, MfhdBox, MfroBox, Mp4Box, MvhdBox,
    SidxBox, SidxReference, StsdBox, TfdtBox, TfhdBox, TfraBox, TfraEntry, TkhdBox, TrexBox,
    TrunBox, TrunEntry, UnknownBox, SAMPLE_FLAG_IS_NON_SYNC,
};
use crate::movie::TrackType;
use crate::sample_table::{Sample, SyntheticSampleTable};
use crate::time::convert_time;

/// Description of one synthetic track.
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub id: u32,
    pub track_type: TrackType,
    pub sample_count: usize,
    pub sample_duration: u32,
    pub timescale: u32,
    /// Stride of flagged sync samples; 0 flags only the first sample.
    pub sync_every: usize,
    /// Stride of I-slice samples that are not flagged sync; 0 for none.
    pub unflagged_i_every: usize,
    /// Per-sample composition offsets, cycled.
    pub cts_pattern: Vec<i32>,
}

impl TrackSpec {
    /// Video track at timescale 10000, sync only at sample 0.
    pub fn video(id: u32, sample_count: usize, sample_duration: u32) -> Self {
        Self {
            id,
            track_type: TrackType::Video,
            sample_count,
            sample_duration,
            timescale: 10_000,
            sync_every: 0,
            unflagged_i_every: 0,
            cts_pattern: Vec::new(),
        }
    }

    /// Audio track at timescale 44100, every sample sync.
    pub fn audio(id: u32, sample_count: usize, sample_duration: u32) -> Self {
        Self {
            id,
            track_type: TrackType::Audio,
            sample_count,
            sample_duration,
            timescale: 44_100,
            sync_every: 1,
            unflagged_i_every: 0,
            cts_pattern: Vec::new(),
        }
    }

    /// Subtitle track at timescale 1000, every sample sync.
    pub fn subtitles(id: u32, sample_count: usize, sample_duration: u32) -> Self {
        Self {
            id,
            track_type: TrackType::Subtitles,
            sample_count,
            sample_duration,
            timescale: 1000,
            sync_every: 1,
            unflagged_i_every: 0,
            cts_pattern: Vec::new(),
        }
    }

    pub fn timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }

    pub fn sync_every(mut self, stride: usize) -> Self {
        self.sync_every = stride;
        self
    }

    /// Make every `stride`-th sample an I slice without flagging it sync
    /// (open-GOP style).
    pub fn unflagged_i_frames(mut self, stride: usize) -> Self {
        self.unflagged_i_every = stride;
        self
    }

    pub fn cts_pattern(mut self, pattern: Vec<i32>) -> Self {
        self.cts_pattern = pattern;
        self
    }

    /// Whether sample `index` is flagged sync.
    pub fn is_sync(&self, index: usize) -> bool {
        index == 0 || (self.sync_every > 0 && index % self.sync_every == 0)
    }

    fn is_unflagged_i(&self, index: usize) -> bool {
        !self.is_sync(index) && self.unflagged_i_every > 0 && index % self.unflagged_i_every == 0
    }

    fn handler(&self) -> BoxType {
        match self.track_type {
            TrackType::Video => HdlrBox::VIDE,
            TrackType::Audio => HdlrBox::SOUN,
            _ => HdlrBox::SUBT,
        }
    }

    /// Payload bytes of sample `index`.
    pub fn payload(&self, index: usize) -> Vec<u8> {
        let fill = |len: usize| -> Vec<u8> {
            (0..len)
                .map(|j| (self.id as usize * 31 + index * 7 + j) as u8)
                .collect()
        };
        match self.track_type {
            TrackType::Video => {
                // IDR, I slice (slice_type 7) or P slice (slice_type 0).
                let header: [u8; 2] = if self.is_sync(index) {
                    [0x65, 0x88]
                } else if self.is_unflagged_i(index) {
                    [0x41, 0x88]
                } else {
                    [0x41, 0xC0]
                };
                let nal_len = 198 + (index % 5) * 16;
                let mut out = (nal_len as u32).to_be_bytes().to_vec();
                out.extend_from_slice(&header);
                out.extend(fill(nal_len - 2));
                out
            }
            TrackType::Audio => fill(50 + (index % 3) * 4),
            _ => fill(20),
        }
    }

    fn sample(&self, index: usize) -> Sample {
        Sample {
            offset: 0,
            size: self.payload(index).len() as u32,
            duration: self.sample_duration,
            dts: index as u64 * self.sample_duration as u64,
            cts_delta: if self.cts_pattern.is_empty() {
                0
            } else {
                self.cts_pattern[index % self.cts_pattern.len()]
            },
            is_sync: self.is_sync(index),
            description_index: 0,
        }
    }

    fn media_duration(&self) -> u64 {
        self.sample_count as u64 * self.sample_duration as u64
    }

    fn stsd(&self) -> StsdBox {
        let mut entry = Vec::new();
        match self.track_type {
            TrackType::Video => {
                let avcc = [1u8, 0x64, 0x00, 0x1F, 0xFF, 0xE0, 0x00];
                entry.extend_from_slice(&((86 + 8 + avcc.len()) as u32).to_be_bytes());
                entry.extend_from_slice(b"avc1");
                entry.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
                entry.extend_from_slice(&[0u8; 16]);
                entry.extend_from_slice(&640u16.to_be_bytes());
                entry.extend_from_slice(&360u16.to_be_bytes());
                entry.extend_from_slice(&[0, 0x48, 0, 0, 0, 0x48, 0, 0, 0, 0, 0, 0, 0, 1]);
                entry.extend_from_slice(&[0u8; 32]);
                entry.extend_from_slice(&[0x00, 0x18, 0xFF, 0xFF]);
                entry.extend_from_slice(&((8 + avcc.len()) as u32).to_be_bytes());
                entry.extend_from_slice(b"avcC");
                entry.extend_from_slice(&avcc);
            }
            TrackType::Audio => {
                entry.extend_from_slice(&36u32.to_be_bytes());
                entry.extend_from_slice(b"mp4a");
                entry.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
                entry.extend_from_slice(&[0u8; 8]);
                entry.extend_from_slice(&[0, 2, 0, 16, 0, 0, 0, 0]);
                entry.extend_from_slice(&((self.timescale & 0xFFFF) << 16).to_be_bytes());
            }
            _ => {
                entry.extend_from_slice(&16u32.to_be_bytes());
                entry.extend_from_slice(b"tx3g");
                entry.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
            }
        }
        StsdBox {
            entry_count: 1,
            entries: entry,
        }
    }

    fn trak(&self, stbl: Mp4Box) -> Mp4Box {
        let mut tkhd = TkhdBox::new(self.id, convert_time(self.media_duration(), self.timescale, 1000));
        if self.track_type == TrackType::Video {
            tkhd.width = 640 << 16;
            tkhd.height = 360 << 16;
        }
        let dref = UnknownBox {
            box_type: BoxType(*b"dref"),
            payload: vec![0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 12, b'u', b'r', b'l', b' ', 0, 0, 0, 1],
        };
        let dinf = ContainerBox::with_children(BoxType::DINF, vec![dref.into()]);
        let minf = ContainerBox::with_children(BoxType::MINF, vec![dinf.into(), stbl]);
        let mdia = ContainerBox::with_children(
            BoxType::MDIA,
            vec![
                MdhdBox::new(self.timescale, self.media_duration()).into(),
                HdlrBox {
                    handler_type: self.handler(),
                    name: format!("{} handler\0", self.track_type).into_bytes(),
                }
                .into(),
                minf.into(),
            ],
        );
        ContainerBox::with_children(BoxType::TRAK, vec![tkhd.into(), mdia.into()]).into()
    }
}

/// Builder for synthetic MP4 files.
#[derive(Debug, Clone, Default)]
pub struct Mp4Builder {
    tracks: Vec<TrackSpec>,
    samples_per_chunk: Option<usize>,
    /// Anchor samples per fragment; `None` builds an unfragmented file.
    fragment_samples: Option<usize>,
    sidx: bool,
    mfra: bool,
}

/// Per-fragment `(track index, sample range)` lists.
type FragmentPlan = Vec<Vec<(usize, std::ops::Range<usize>)>>;

impl Mp4Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(mut self, spec: TrackSpec) -> Self {
        self.tracks.push(spec);
        self
    }

    /// Group samples into chunks of `n` (default 1).
    pub fn samples_per_chunk(mut self, n: usize) -> Self {
        self.samples_per_chunk = Some(n.max(1));
        self
    }

    /// Build an already fragmented file, cutting a fragment every `n`
    /// samples of the first track. Other tracks follow in time.
    pub fn fragmented(mut self, n: usize) -> Self {
        self.fragment_samples = Some(n.max(1));
        self
    }

    /// Add a `sidx` in front of the fragments.
    pub fn with_sidx(mut self) -> Self {
        self.sidx = true;
        self
    }

    /// Add an `mfra` after the fragments.
    pub fn with_mfra(mut self) -> Self {
        self.mfra = true;
        self
    }

    pub fn tracks(&self) -> &[TrackSpec] {
        &self.tracks
    }

    fn ftyp() -> Mp4Box {
        FtypBox {
            major_brand: BoxType(*b"isom"),
            minor_version: 0x200,
            compatible_brands: vec![BoxType(*b"isom"), BoxType(*b"avc1"), BoxType::BRAND_MP42],
        }
        .into()
    }

    fn moov(&self, traks: Vec<Mp4Box>, mvex: Option<Mp4Box>) -> Mp4Box {
        let duration = self
            .tracks
            .iter()
            .map(|t| convert_time(t.media_duration(), t.timescale, 1000))
            .max()
            .unwrap_or(0);
        let next_id = self.tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let mut moov = ContainerBox::new(BoxType::MOOV);
        moov.add_child(MvhdBox::new(1000, duration, next_id));
        for trak in traks {
            moov.add_child(trak);
        }
        if let Some(mvex) = mvex {
            moov.add_child(mvex);
        }
        moov.into()
    }

    /// Serialize the file.
    pub fn build(&self) -> Vec<u8> {
        match self.fragment_samples {
            Some(n) => self.build_fragmented(n),
            None => self.build_flat(),
        }
    }

    /// Build a fragmented file split into an init segment (`ftyp` + `moov`)
    /// and a media segment (everything after).
    pub fn build_segments(&self) -> (Vec<u8>, Vec<u8>) {
        let n = self.fragment_samples.unwrap_or(usize::MAX);
        let init_len = Self::ftyp().size() + self.moov(self.empty_traks(), Some(self.mvex())).size();
        let data = self.build_fragmented(n);
        let (init, media) = data.split_at(init_len as usize);
        (init.to_vec(), media.to_vec())
    }

    fn build_flat(&self) -> Vec<u8> {
        let per_chunk = self.samples_per_chunk.unwrap_or(1);

        // Chunks of every track, ordered by the decode time of their first sample.
        let mut chunks: Vec<(u64, usize, std::ops::Range<usize>)> = Vec::new();
        for (t, spec) in self.tracks.iter().enumerate() {
            let mut start = 0;
            while start < spec.sample_count {
                let end = (start + per_chunk).min(spec.sample_count);
                let dts_us = convert_time(start as u64 * spec.sample_duration as u64, spec.timescale, 1_000_000);
                chunks.push((dts_us, t, start..end));
                start = end;
            }
        }
        chunks.sort_by_key(|(dts, t, _)| (*dts, *t));

        let layout = |base: u64| -> (Vec<SyntheticSampleTable>, Vec<u8>) {
            let mut tables: Vec<SyntheticSampleTable> =
                self.tracks.iter().map(|_| SyntheticSampleTable::new(per_chunk)).collect();
            let mut payload = Vec::new();
            for (_, t, range) in &chunks {
                let spec = &self.tracks[*t];
                for i in range.clone() {
                    let mut sample = spec.sample(i);
                    sample.offset = base + payload.len() as u64;
                    payload.extend(spec.payload(i));
                    tables[*t].add_sample(sample);
                }
            }
            (tables, payload)
        };
        let make_moov = |tables: &[SyntheticSampleTable]| -> Mp4Box {
            let traks = self
                .tracks
                .iter()
                .zip(tables)
                .map(|(spec, table)| spec.trak(table.to_stbl(spec.stsd())))
                .collect();
            self.moov(traks, None)
        };

        // Chunk offsets stay 32-bit, so the moov size does not depend on them.
        let ftyp = Self::ftyp();
        let (probe_tables, _) = layout(0);
        let data_start = ftyp.size() + make_moov(&probe_tables).size() + 8;
        let (tables, payload) = layout(data_start);

        let mut out = ftyp.to_bytes().unwrap();
        out.extend(make_moov(&tables).to_bytes().unwrap());
        out.extend(((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(b"mdat");
        out.extend(payload);
        out
    }

    fn empty_traks(&self) -> Vec<Mp4Box> {
        self.tracks
            .iter()
            .map(|spec| spec.trak(SyntheticSampleTable::default().to_stbl(spec.stsd())))
            .collect()
    }

    fn mvex(&self) -> Mp4Box {
        let mut mvex = ContainerBox::new(BoxType::MVEX);
        let duration = self
            .tracks
            .iter()
            .map(|t| convert_time(t.media_duration(), t.timescale, 1000))
            .max()
            .unwrap_or(0);
        mvex.add_child(MehdBox {
            fragment_duration: duration,
        });
        for spec in &self.tracks {
            mvex.add_child(TrexBox::new(spec.id));
        }
        mvex.into()
    }

    fn plan_fragments(&self, n: usize) -> FragmentPlan {
        let Some(anchor) = self.tracks.first() else {
            return Vec::new();
        };
        let mut next = vec![0usize; self.tracks.len()];
        let mut plan = Vec::new();
        let mut start = 0;
        while start < anchor.sample_count {
            let end = start.saturating_add(n).min(anchor.sample_count);
            let last = end == anchor.sample_count;
            let boundary_dts = end as u64 * anchor.sample_duration as u64;
            let mut fragment = Vec::new();
            for (t, spec) in self.tracks.iter().enumerate() {
                let from = next[t];
                let mut to = from;
                while to < spec.sample_count {
                    let dts = to as u64 * spec.sample_duration as u64;
                    // dts / spec.ts < boundary / anchor.ts
                    if !last && dts as u128 * anchor.timescale as u128 >= boundary_dts as u128 * spec.timescale as u128 {
                        break;
                    }
                    to += 1;
                }
                if to > from {
                    fragment.push((t, from..to));
                }
                next[t] = to;
            }
            plan.push(fragment);
            start = end;
        }
        plan
    }

    fn build_moof(&self, sequence_number: u32, fragment: &[(usize, std::ops::Range<usize>)], data_offset: i32) -> Mp4Box {
        let mut moof = ContainerBox::new(BoxType::MOOF);
        moof.add_child(MfhdBox { sequence_number });
        let mut offset = data_offset;
        for (t, range) in fragment {
            let spec = &self.tracks[*t];
            let mut tfhd = TfhdBox::new(spec.id);
            tfhd.default_base_is_moof = true;
            let mut trun = TrunBox {
                version: 1,
                flags: TrunBox::FLAG_DATA_OFFSET
                    | TrunBox::FLAG_SAMPLE_DURATION
                    | TrunBox::FLAG_SAMPLE_SIZE
                    | TrunBox::FLAG_SAMPLE_FLAGS,
                data_offset: offset,
                ..Default::default()
            };
            if !spec.cts_pattern.is_empty() {
                trun.flags |= TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET;
            }
            for i in range.clone() {
                let sample = spec.sample(i);
                trun.entries.push(TrunEntry {
                    sample_duration: sample.duration,
                    sample_size: sample.size,
                    sample_flags: if sample.is_sync {
                        0x0200_0000
                    } else {
                        0x0100_0000 | SAMPLE_FLAG_IS_NON_SYNC
                    },
                    sample_composition_time_offset: sample.cts_delta,
                });
                offset += sample.size as i32;
            }
            let tfdt = TfdtBox::new(range.start as u64 * spec.sample_duration as u64);
            moof.add_child(ContainerBox::with_children(
                BoxType::TRAF,
                vec![tfhd.into(), tfdt.into(), trun.into()],
            ));
        }
        moof.into()
    }

    fn build_fragmented(&self, n: usize) -> Vec<u8> {
        let plan = self.plan_fragments(n);
        let mut out = Self::ftyp().to_bytes().unwrap();
        out.extend(self.moov(self.empty_traks(), Some(self.mvex())).to_bytes().unwrap());

        // Moof sizes do not depend on the data offset values.
        let pieces: Vec<(Mp4Box, Vec<u8>)> = plan
            .iter()
            .enumerate()
            .map(|(k, fragment)| {
                let probe = self.build_moof(k as u32 + 1, fragment, 0);
                let moof = self.build_moof(k as u32 + 1, fragment, probe.size() as i32 + 8);
                let mut mdat_payload = Vec::new();
                for (t, range) in fragment {
                    for i in range.clone() {
                        mdat_payload.extend(self.tracks[*t].payload(i));
                    }
                }
                (moof, mdat_payload)
            })
            .collect();

        if self.sidx {
            let anchor = &self.tracks[0];
            let sidx = SidxBox {
                version: 0,
                reference_id: anchor.id,
                timescale: anchor.timescale,
                earliest_presentation_time: 0,
                first_offset: 0,
                references: plan
                    .iter()
                    .zip(&pieces)
                    .map(|(fragment, (moof, payload))| {
                        let anchor_range = fragment
                            .iter()
                            .find(|(t, _)| *t == 0)
                            .map_or(0..0, |(_, r)| r.clone());
                        SidxReference {
                            referenced_size: (moof.size() + 8 + payload.len() as u64) as u32,
                            subsegment_duration: anchor_range.len() as u32 * anchor.sample_duration,
                            starts_with_sap: true,
                            ..Default::default()
                        }
                    })
                    .collect(),
            };
            out.extend(Mp4Box::from(sidx).to_bytes().unwrap());
        }

        let mut tfras: Vec<TfraBox> = self.tracks.iter().map(|t| TfraBox::new(t.id)).collect();
        for (fragment, (moof, payload)) in plan.iter().zip(&pieces) {
            let moof_offset = out.len() as u64;
            for (t, range) in fragment {
                let spec = &self.tracks[*t];
                tfras[*t]
                    .entries
                    .push(TfraEntry::new(range.start as u64 * spec.sample_duration as u64, moof_offset));
            }
            out.extend(moof.to_bytes().unwrap());
            out.extend(((payload.len() + 8) as u32).to_be_bytes());
            out.extend_from_slice(b"mdat");
            out.extend_from_slice(payload);
        }

        if self.mfra {
            let mut mfra = ContainerBox::new(BoxType::MFRA);
            for tfra in tfras {
                mfra.add_child(tfra);
            }
            mfra.add_child(MfroBox { mfra_size: 0 });
            let size = Mp4Box::from(mfra.clone()).size() as u32;
            if let Some(mfro) = mfra.children.last_mut().and_then(Mp4Box::as_mfro_mut) {
                mfro.mfra_size = size;
            }
            out.extend(Mp4Box::from(mfra).to_bytes().unwrap());
        }
        out
    }
}
