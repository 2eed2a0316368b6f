//! In-memory, appendable sample table.

use super::{layout_chunk, sample_at, Sample, SampleTable};
use crate::boxes::{
    BoxType, Co64Box, ContainerBox, CttsBox, Mp4Box, StcoBox, StscBox, StscEntry, StsdBox, StssBox,
    StszBox, SttsBox,
};
use crate::{Error, Result};

/// Samples per chunk when none is given.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Sample table built by appending samples.
///
/// Samples are grouped into chunks of at most `chunk_size` samples. A new
/// sample description index also starts a new chunk.
#[derive(Debug, Clone)]
pub struct SyntheticSampleTable {
    samples: Vec<Sample>,
    /// `(first sample, offset)` per chunk.
    chunks: Vec<(usize, u64)>,
    chunk_size: usize,
    description_count: u32,
}

impl Default for SyntheticSampleTable {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl SyntheticSampleTable {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            samples: Vec::new(),
            chunks: Vec::new(),
            chunk_size: chunk_size.max(1),
            description_count: 1,
        }
    }

    pub fn set_sample_description_count(&mut self, count: u32) {
        self.description_count = count;
    }

    /// Append a sample. Its offset is kept as given.
    pub fn add_sample(&mut self, sample: Sample) {
        let index = self.samples.len();
        let start_chunk = match self.chunks.last() {
            None => true,
            Some(&(first, _)) => {
                index - first >= self.chunk_size
                    || self.samples[first].description_index != sample.description_index
            }
        };
        if start_chunk {
            self.chunks.push((index, sample.offset));
        }
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_range(&self, chunk: usize) -> std::ops::Range<usize> {
        let start = self.chunks[chunk].0;
        let end = self
            .chunks
            .get(chunk + 1)
            .map_or(self.samples.len(), |&(first, _)| first);
        start..end
    }

    /// Render an `stbl` box describing these samples.
    pub fn to_stbl(&self, stsd: StsdBox) -> Mp4Box {
        let mut stts: Vec<(u32, u32)> = Vec::new();
        let mut ctts: Vec<(u32, i32)> = Vec::new();
        for sample in &self.samples {
            match stts.last_mut() {
                Some((count, delta)) if *delta == sample.duration => *count += 1,
                _ => stts.push((1, sample.duration)),
            }
            match ctts.last_mut() {
                Some((count, offset)) if *offset == sample.cts_delta => *count += 1,
                _ => ctts.push((1, sample.cts_delta)),
            }
        }

        let mut stsc: Vec<StscEntry> = Vec::new();
        for chunk in 0..self.chunks.len() {
            let range = self.chunk_range(chunk);
            let samples_per_chunk = range.len() as u32;
            let sample_description_index = self.samples[range.start].description_index + 1;
            let same_run = stsc.last().is_some_and(|last| {
                last.samples_per_chunk == samples_per_chunk
                    && last.sample_description_index == sample_description_index
            });
            if !same_run {
                stsc.push(StscEntry {
                    first_chunk: chunk as u32 + 1,
                    samples_per_chunk,
                    sample_description_index,
                });
            }
        }

        let mut stbl = ContainerBox::new(BoxType::STBL);
        stbl.add_child(stsd);
        stbl.add_child(SttsBox { entries: stts });
        if ctts.iter().any(|&(_, offset)| offset != 0) {
            let version = if ctts.iter().any(|&(_, offset)| offset < 0) { 1 } else { 0 };
            stbl.add_child(CttsBox { version, entries: ctts });
        }
        if !self.samples.iter().all(|s| s.is_sync) {
            let entries = self
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            stbl.add_child(StssBox { entries });
        }
        stbl.add_child(StscBox { entries: stsc });
        stbl.add_child(StszBox {
            sample_size: 0,
            sample_count: self.samples.len() as u32,
            entries: self.samples.iter().map(|s| s.size).collect(),
        });
        let offsets: Vec<u64> = self.chunks.iter().map(|&(_, offset)| offset).collect();
        if offsets.iter().any(|&o| o > u32::MAX as u64) {
            stbl.add_child(Co64Box { entries: offsets });
        } else {
            stbl.add_child(StcoBox {
                entries: offsets.iter().map(|&o| o as u32).collect(),
            });
        }
        stbl.into()
    }
}

impl SampleTable for SyntheticSampleTable {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        sample_at(&self.samples, index)
    }

    fn sample_description_count(&self) -> u32 {
        self.description_count
    }

    fn chunk_for_sample(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.samples.len() {
            return Err(Error::OutOfRange);
        }
        let chunk = self.chunks.partition_point(|&(first, _)| first <= index) - 1;
        Ok((chunk, index - self.chunks[chunk].0))
    }

    fn set_chunk_offset(&mut self, chunk: usize, offset: u64) -> Result<()> {
        self.chunks.get_mut(chunk).ok_or(Error::OutOfRange)?.1 = offset;
        let range = self.chunk_range(chunk);
        layout_chunk(&mut self.samples, range, offset);
        Ok(())
    }

    fn set_sample_size(&mut self, index: usize, size: u32) -> Result<()> {
        let (chunk, _) = self.chunk_for_sample(index)?;
        self.samples[index].size = size;
        let range = self.chunk_range(chunk);
        layout_chunk(&mut self.samples, range, self.chunks[chunk].1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_table::StblSampleTable;

    fn sample(offset: u64, dts: u64, is_sync: bool) -> Sample {
        Sample {
            offset,
            size: 10,
            duration: 100,
            dts,
            is_sync,
            ..Default::default()
        }
    }

    #[test]
    fn test_chunking() {
        let mut table = SyntheticSampleTable::new(2);
        for i in 0..5 {
            table.add_sample(sample(i * 10, i * 100, i == 0));
        }
        assert_eq!(table.chunk_count(), 3);
        assert_eq!(table.chunk_for_sample(3).unwrap(), (1, 1));
        assert_eq!(table.chunk_for_sample(4).unwrap(), (2, 0));
        assert!(table.chunk_for_sample(5).is_err());
    }

    #[test]
    fn test_set_chunk_offset_relayouts_samples() {
        let mut table = SyntheticSampleTable::new(3);
        for i in 0..3 {
            table.add_sample(sample(1000 + i * 50, i * 100, true));
        }
        table.set_chunk_offset(0, 0).unwrap();
        assert_eq!(table.sample(2).unwrap().offset, 20);
    }

    #[test]
    fn test_to_stbl_resolves_back() {
        let mut table = SyntheticSampleTable::new(2);
        for i in 0..5u64 {
            table.add_sample(sample(i * 10, i * 100, i % 2 == 0));
        }
        let stsd = StsdBox {
            entry_count: 1,
            entries: Vec::new(),
        };
        let stbl = table.to_stbl(stsd);
        let resolved = StblSampleTable::from_stbl(&stbl).unwrap();
        assert_eq!(resolved.samples(), table.samples());
    }
}
