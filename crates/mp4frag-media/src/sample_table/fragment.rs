//! Sample table of one track fragment.

use super::{sample_at, Sample, SampleTable};
use crate::boxes::{BoxType, Mp4Box, TfhdBox, TrexBox, TrunBox, SAMPLE_FLAG_IS_NON_SYNC};
use crate::{Error, Result};

/// Samples described by one `traf`.
#[derive(Debug, Clone, Default)]
pub struct FragmentSampleTable {
    samples: Vec<Sample>,
    duration: u64,
}

impl FragmentSampleTable {
    /// Resolve the samples of `traf`.
    ///
    /// `moof_offset` is the stream offset of the enclosing `moof`,
    /// `mdat_payload_offset` the offset of the first byte after the following
    /// `mdat` header. Runs without an explicit data offset continue where the
    /// previous run ended, starting at `mdat_payload_offset`. Decode times
    /// start at the `tfdt` value, or at `dts_origin` when there is none.
    pub fn new(
        traf: &Mp4Box,
        trex: Option<&TrexBox>,
        moof_offset: u64,
        mdat_payload_offset: u64,
        dts_origin: u64,
    ) -> Result<Self> {
        let tfhd = traf
            .child(BoxType::TFHD)
            .and_then(Mp4Box::as_tfhd)
            .ok_or_else(|| Error::invalid_format("traf has no tfhd"))?;
        let mut dts = traf
            .child(BoxType::TFDT)
            .and_then(Mp4Box::as_tfdt)
            .map_or(dts_origin, |tfdt| tfdt.base_media_decode_time);

        let base = tfhd.base_data_offset.unwrap_or(moof_offset);
        let description_index = tfhd
            .sample_description_index
            .or(trex.map(|t| t.default_sample_description_index))
            .unwrap_or(1)
            .saturating_sub(1);

        let mut samples = Vec::new();
        let mut data_offset = mdat_payload_offset;
        let start_dts = dts;
        for trun in traf.children_of(BoxType::TRUN).filter_map(Mp4Box::as_trun) {
            if trun.has(TrunBox::FLAG_DATA_OFFSET) {
                data_offset = base
                    .checked_add_signed(trun.data_offset as i64)
                    .ok_or_else(|| Error::invalid_format("trun data offset before stream start"))?;
            }
            for (i, entry) in trun.entries.iter().enumerate() {
                let size = if trun.has(TrunBox::FLAG_SAMPLE_SIZE) {
                    entry.sample_size
                } else {
                    default_size(tfhd, trex)
                };
                let duration = if trun.has(TrunBox::FLAG_SAMPLE_DURATION) {
                    entry.sample_duration
                } else {
                    default_duration(tfhd, trex)
                };
                let flags = if i == 0 && trun.has(TrunBox::FLAG_FIRST_SAMPLE_FLAGS) {
                    trun.first_sample_flags
                } else if trun.has(TrunBox::FLAG_SAMPLE_FLAGS) {
                    entry.sample_flags
                } else {
                    default_flags(tfhd, trex)
                };
                let cts_delta = if trun.has(TrunBox::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET) {
                    entry.sample_composition_time_offset
                } else {
                    0
                };
                samples.push(Sample {
                    offset: data_offset,
                    size,
                    duration,
                    dts,
                    cts_delta,
                    is_sync: flags & SAMPLE_FLAG_IS_NON_SYNC == 0,
                    description_index,
                });
                data_offset += size as u64;
                dts += duration as u64;
            }
        }

        Ok(Self {
            samples,
            duration: dts - start_dts,
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sum of all sample durations.
    pub fn duration(&self) -> u64 {
        self.duration
    }
}

fn default_size(tfhd: &TfhdBox, trex: Option<&TrexBox>) -> u32 {
    tfhd.default_sample_size
        .or(trex.map(|t| t.default_sample_size))
        .unwrap_or(0)
}

fn default_duration(tfhd: &TfhdBox, trex: Option<&TrexBox>) -> u32 {
    tfhd.default_sample_duration
        .or(trex.map(|t| t.default_sample_duration))
        .unwrap_or(0)
}

fn default_flags(tfhd: &TfhdBox, trex: Option<&TrexBox>) -> u32 {
    tfhd.default_sample_flags
        .or(trex.map(|t| t.default_sample_flags))
        .unwrap_or(0)
}

impl SampleTable for FragmentSampleTable {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        sample_at(&self.samples, index)
    }

    fn sample_description_count(&self) -> u32 {
        1
    }

    fn chunk_for_sample(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.samples.len() {
            return Err(Error::OutOfRange);
        }
        Ok((0, index))
    }

    fn set_chunk_offset(&mut self, _chunk: usize, _offset: u64) -> Result<()> {
        Err(Error::not_supported("fragment sample tables have no chunks"))
    }

    fn set_sample_size(&mut self, index: usize, size: u32) -> Result<()> {
        self.samples.get_mut(index).ok_or(Error::OutOfRange)?.size = size;
        Ok(())
    }
}
