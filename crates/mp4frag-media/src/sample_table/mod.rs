//! Per-track sample tables.
//!
//! A sample table maps a 0-based sample index to the sample's location,
//! timing and sync flag. Three implementations exist:
//! - [`StblSampleTable`]: resolved from the `stbl` boxes of a `trak`
//! - [`SyntheticSampleTable`]: built in memory, one sample at a time
//! - [`FragmentSampleTable`]: resolved from one `traf` of a `moof`

mod fragment;
mod stbl;
mod synthetic;

pub use fragment::FragmentSampleTable;
pub use stbl::StblSampleTable;
pub use synthetic::SyntheticSampleTable;

use crate::stream::read_at;
use crate::{Error, Result};
use std::io::{Read, Seek};

/// A resolved sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct Sample {
    /// Stream offset of the sample data.
    pub offset: u64,
    /// Sample size in bytes.
    pub size: u32,
    /// Duration in media timescale units.
    pub duration: u32,
    /// Decode timestamp in media timescale units.
    pub dts: u64,
    /// Composition offset relative to the decode timestamp.
    pub cts_delta: i32,
    /// Whether the sample can be decoded on its own.
    pub is_sync: bool,
    /// 0-based sample description index.
    pub description_index: u32,
}

impl Sample {
    /// Composition timestamp, clamped at zero.
    pub fn cts(&self) -> u64 {
        (self.dts as i64 + self.cts_delta as i64).max(0) as u64
    }

    /// Read this sample's bytes from its source stream.
    pub fn read_data<R: Read + Seek + ?Sized>(&self, reader: &mut R) -> Result<Vec<u8>> {
        read_at(reader, self.offset, self.size as usize)
    }
}

/// Sample metadata access for one track.
pub trait SampleTable {
    fn sample_count(&self) -> usize;

    /// Sample by 0-based index; `OutOfRange` past the end.
    fn sample(&self, index: usize) -> Result<Sample>;

    fn sample_description_count(&self) -> u32;

    /// `(chunk index, index within chunk)` of a sample.
    fn chunk_for_sample(&self, index: usize) -> Result<(usize, usize)>;

    /// Move a chunk. Offsets of the samples it holds follow.
    fn set_chunk_offset(&mut self, chunk: usize, offset: u64) -> Result<()>;

    /// Change a sample's size. Later samples of the same chunk shift.
    fn set_sample_size(&mut self, index: usize, size: u32) -> Result<()>;
}

/// Sample tables held as a plain resolved sample list.
pub(crate) fn sample_at(samples: &[Sample], index: usize) -> Result<Sample> {
    samples.get(index).copied().ok_or(Error::OutOfRange)
}

/// Recompute the offsets of the samples `range` of a chunk starting at `base`.
pub(crate) fn layout_chunk(samples: &mut [Sample], range: std::ops::Range<usize>, base: u64) {
    let mut offset = base;
    for sample in &mut samples[range] {
        sample.offset = offset;
        offset += sample.size as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_cts() {
        let sample = Sample {
            dts: 1000,
            cts_delta: 500,
            ..Default::default()
        };
        assert_eq!(sample.cts(), 1500);

        let negative = Sample {
            dts: 100,
            cts_delta: -200,
            ..Default::default()
        };
        assert_eq!(negative.cts(), 0);
    }

    #[test]
    fn test_read_data() {
        let mut stream = crate::stream::MemoryStream::new((0u8..16).collect());
        let sample = Sample {
            offset: 4,
            size: 3,
            ..Default::default()
        };
        assert_eq!(sample.read_data(&mut stream).unwrap(), vec![4, 5, 6]);
    }
}
