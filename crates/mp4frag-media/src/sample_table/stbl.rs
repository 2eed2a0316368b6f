//! Sample table backed by `stbl` boxes.
//!
//! Sample tables describe how samples (frames) are organized in the file:
//! - stts: sample durations (decoding time)
//! - stss: sync sample table (keyframes)
//! - stsc: sample-to-chunk mapping
//! - stsz: sample sizes
//! - stco/co64: chunk offsets
//! - ctts: composition time offsets (for B-frames)

use super::{layout_chunk, sample_at, Sample, SampleTable};
use crate::boxes::{BoxType, Co64Box, Mp4Box, StcoBox, StscEntry, StszBox};
use crate::{Error, Result};
use std::collections::HashSet;

/// Sample table resolved from a track's `stbl`.
#[derive(Debug, Clone, Default)]
pub struct StblSampleTable {
    samples: Vec<Sample>,
    /// 0-based chunk index of every sample.
    sample_chunks: Vec<u32>,
    /// Index of the first sample of every chunk.
    chunk_first_sample: Vec<usize>,
    chunk_offsets: Vec<u64>,
    description_count: u32,
}

impl StblSampleTable {
    /// Resolve every sample of an `stbl` box.
    pub fn from_stbl(stbl: &Mp4Box) -> Result<Self> {
        let stsz = stbl
            .child(BoxType::STSZ)
            .and_then(Mp4Box::as_stsz)
            .ok_or_else(|| Error::invalid_format("stbl has no stsz"))?;
        let chunk_offsets: Vec<u64> = match (
            stbl.child(BoxType::STCO).and_then(Mp4Box::as_stco),
            stbl.child(BoxType::CO64).and_then(Mp4Box::as_co64),
        ) {
            (Some(stco), _) => stco.entries.iter().map(|&o| o as u64).collect(),
            (None, Some(co64)) => co64.entries.clone(),
            (None, None) => Vec::new(),
        };
        let stts = stbl
            .child(BoxType::STTS)
            .and_then(Mp4Box::as_stts)
            .map(|b| b.entries.as_slice())
            .unwrap_or(&[]);
        let stsc = stbl
            .child(BoxType::STSC)
            .and_then(Mp4Box::as_stsc)
            .map(|b| b.entries.as_slice())
            .unwrap_or(&[]);
        // No stss means every sample is a sync sample.
        let sync_samples: Option<HashSet<u32>> = stbl
            .child(BoxType::STSS)
            .and_then(Mp4Box::as_stss)
            .map(|b| b.entries.iter().copied().collect());
        let ctts = stbl
            .child(BoxType::CTTS)
            .and_then(Mp4Box::as_ctts)
            .map(|b| b.entries.as_slice())
            .unwrap_or(&[]);
        let description_count = stbl
            .child(BoxType::STSD)
            .and_then(Mp4Box::as_stsd)
            .map(|b| b.entry_count)
            .unwrap_or(0);

        let sample_count = stsz.sample_count as usize;
        if sample_count > 0 && chunk_offsets.is_empty() {
            return Err(Error::invalid_format("stbl has samples but no chunk offsets"));
        }

        let (sample_chunks, descriptions) = resolve_sample_chunks(stsc, chunk_offsets.len(), sample_count);
        let (dts_values, durations) = resolve_timestamps(stts, sample_count);
        let cts_offsets = resolve_cts_offsets(ctts, sample_count);

        let mut samples = Vec::with_capacity(sample_count);
        for i in 0..sample_count {
            samples.push(Sample {
                offset: 0,
                size: stsz.size_of(i).unwrap_or(0),
                duration: durations[i],
                dts: dts_values[i],
                cts_delta: cts_offsets[i],
                is_sync: sync_samples
                    .as_ref()
                    .map_or(true, |set| set.contains(&(i as u32 + 1))),
                description_index: descriptions[i],
            });
        }

        let mut chunk_first_sample = vec![sample_count; chunk_offsets.len()];
        for (i, &chunk) in sample_chunks.iter().enumerate().rev() {
            chunk_first_sample[chunk as usize] = i;
        }

        let mut table = Self {
            samples,
            sample_chunks,
            chunk_first_sample,
            chunk_offsets,
            description_count,
        };
        for chunk in 0..table.chunk_offsets.len() {
            table.relayout(chunk);
        }
        Ok(table)
    }

    /// All resolved samples.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_offsets.len()
    }

    fn chunk_range(&self, chunk: usize) -> std::ops::Range<usize> {
        let start = self.chunk_first_sample[chunk].min(self.samples.len());
        let mut end = start;
        while end < self.samples.len() && self.sample_chunks[end] as usize == chunk {
            end += 1;
        }
        start..end
    }

    fn relayout(&mut self, chunk: usize) {
        let range = self.chunk_range(chunk);
        layout_chunk(&mut self.samples, range, self.chunk_offsets[chunk]);
    }

    /// Write the chunk layout and sample sizes back into `stbl`, adding
    /// `delta` to every chunk offset. `stco` is promoted to `co64` when an
    /// offset no longer fits in 32 bits.
    pub fn write_into(&self, stbl: &mut Mp4Box, delta: u64) -> Result<()> {
        let container = stbl
            .as_container_mut()
            .ok_or_else(|| Error::invalid_state("stbl is not a container"))?;

        let offsets: Vec<u64> = self.chunk_offsets.iter().map(|&o| o + delta).collect();
        let chunk_box: Mp4Box = if offsets.iter().any(|&o| o > u32::MAX as u64) {
            Co64Box { entries: offsets }.into()
        } else {
            StcoBox {
                entries: offsets.iter().map(|&o| o as u32).collect(),
            }
            .into()
        };
        let position = container
            .children
            .iter()
            .position(|c| matches!(c.box_type(), BoxType::STCO | BoxType::CO64));
        container
            .children
            .retain(|c| !matches!(c.box_type(), BoxType::STCO | BoxType::CO64));
        match position {
            Some(index) => container.insert_child(index, chunk_box),
            None => container.add_child(chunk_box),
        }

        let sizes: Vec<u32> = self.samples.iter().map(|s| s.size).collect();
        let stsz = match sizes.first() {
            Some(&first) if first != 0 && sizes.iter().all(|&s| s == first) => StszBox {
                sample_size: first,
                sample_count: sizes.len() as u32,
                entries: Vec::new(),
            },
            _ => StszBox {
                sample_size: 0,
                sample_count: sizes.len() as u32,
                entries: sizes,
            },
        };
        match container
            .children
            .iter_mut()
            .find(|c| c.box_type() == BoxType::STSZ)
        {
            Some(existing) => *existing = stsz.into(),
            None => container.add_child(stsz),
        }
        Ok(())
    }
}

impl SampleTable for StblSampleTable {
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
        let chunk = *self.sample_chunks.get(index).ok_or(Error::OutOfRange)? as usize;
        Ok((chunk, index - self.chunk_first_sample[chunk]))
    }

    fn set_chunk_offset(&mut self, chunk: usize, offset: u64) -> Result<()> {
        let slot = self.chunk_offsets.get_mut(chunk).ok_or(Error::OutOfRange)?;
        *slot = offset;
        self.relayout(chunk);
        Ok(())
    }

    fn set_sample_size(&mut self, index: usize, size: u32) -> Result<()> {
        let chunk = *self.sample_chunks.get(index).ok_or(Error::OutOfRange)? as usize;
        self.samples[index].size = size;
        self.relayout(chunk);
        Ok(())
    }
}

/// Chunk index and sample description index (both 0-based) per sample.
fn resolve_sample_chunks(
    stsc: &[StscEntry],
    chunk_count: usize,
    sample_count: usize,
) -> (Vec<u32>, Vec<u32>) {
    let mut chunks = Vec::with_capacity(sample_count);
    let mut descriptions = Vec::with_capacity(sample_count);
    let num_chunks = chunk_count as u32;

    for (i, entry) in stsc.iter().enumerate() {
        let next_first = stsc
            .get(i + 1)
            .map_or(num_chunks + 1, |next| next.first_chunk);
        for chunk in entry.first_chunk.max(1)..next_first {
            if chunk > num_chunks {
                break;
            }
            for _ in 0..entry.samples_per_chunk {
                if chunks.len() >= sample_count {
                    break;
                }
                chunks.push(chunk - 1);
                descriptions.push(entry.sample_description_index.saturating_sub(1));
            }
        }
    }

    // Pad if needed
    while chunks.len() < sample_count {
        chunks.push(chunks.last().copied().unwrap_or(0));
        descriptions.push(descriptions.last().copied().unwrap_or(0));
    }

    (chunks, descriptions)
}

fn resolve_timestamps(stts: &[(u32, u32)], sample_count: usize) -> (Vec<u64>, Vec<u32>) {
    let mut dts_values = Vec::with_capacity(sample_count);
    let mut durations = Vec::with_capacity(sample_count);
    let mut current_dts = 0u64;

    'entries: for &(count, delta) in stts {
        for _ in 0..count {
            if dts_values.len() >= sample_count {
                break 'entries;
            }
            dts_values.push(current_dts);
            durations.push(delta);
            current_dts += delta as u64;
        }
    }

    // Pad with last duration if needed
    let last_duration = durations.last().copied().unwrap_or(1);
    while dts_values.len() < sample_count {
        dts_values.push(current_dts);
        durations.push(last_duration);
        current_dts += last_duration as u64;
    }

    (dts_values, durations)
}

fn resolve_cts_offsets(ctts: &[(u32, i32)], sample_count: usize) -> Vec<i32> {
    let mut offsets = Vec::with_capacity(sample_count);
    'entries: for &(count, offset) in ctts {
        for _ in 0..count {
            if offsets.len() >= sample_count {
                break 'entries;
            }
            offsets.push(offset);
        }
    }
    offsets.resize(sample_count, 0);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{ContainerBox, StscBox, StssBox, SttsBox};

    fn stbl(sizes: Vec<u32>, chunk_offsets: Vec<u32>, stsc: Vec<StscEntry>) -> Mp4Box {
        let count = sizes.len() as u32;
        let mut stbl = ContainerBox::new(BoxType::STBL);
        stbl.add_child(SttsBox {
            entries: vec![(count, 1000)],
        });
        stbl.add_child(StssBox { entries: vec![1] });
        stbl.add_child(StscBox { entries: stsc });
        stbl.add_child(StszBox {
            sample_size: 0,
            sample_count: count,
            entries: sizes,
        });
        stbl.add_child(StcoBox {
            entries: chunk_offsets,
        });
        stbl.into()
    }

    fn run(first_chunk: u32, samples_per_chunk: u32) -> StscEntry {
        StscEntry {
            first_chunk,
            samples_per_chunk,
            sample_description_index: 1,
        }
    }

    #[test]
    fn test_resolve_single_chunk() {
        let table = StblSampleTable::from_stbl(&stbl(vec![100, 200, 150], vec![1000], vec![run(1, 3)])).unwrap();

        assert_eq!(table.sample_count(), 3);
        let first = table.sample(0).unwrap();
        assert_eq!(first.offset, 1000);
        assert_eq!(first.size, 100);
        assert_eq!(first.dts, 0);
        assert!(first.is_sync);

        let second = table.sample(1).unwrap();
        assert_eq!(second.offset, 1100);
        assert_eq!(second.dts, 1000);
        assert!(!second.is_sync);

        assert_eq!(table.sample(2).unwrap().offset, 1300);
        assert_eq!(table.sample(3).unwrap_err().kind(), crate::ErrorKind::OutOfRange);
    }

    #[test]
    fn test_resolve_multiple_chunks() {
        let table = StblSampleTable::from_stbl(&stbl(
            vec![10, 20, 30, 40, 50],
            vec![100, 500, 900],
            vec![run(1, 2), run(3, 1)],
        ))
        .unwrap();

        assert_eq!(table.chunk_for_sample(0).unwrap(), (0, 0));
        assert_eq!(table.chunk_for_sample(3).unwrap(), (1, 1));
        assert_eq!(table.chunk_for_sample(4).unwrap(), (2, 0));
        assert_eq!(table.sample(3).unwrap().offset, 530);
        assert_eq!(table.sample(4).unwrap().offset, 900);
    }

    #[test]
    fn test_set_chunk_offset_and_size() {
        let mut table = StblSampleTable::from_stbl(&stbl(vec![10, 20], vec![100], vec![run(1, 2)])).unwrap();
        table.set_chunk_offset(0, 5000).unwrap();
        table.set_sample_size(0, 16).unwrap();
        assert_eq!(table.sample(0).unwrap().offset, 5000);
        assert_eq!(table.sample(1).unwrap().offset, 5016);
        assert!(table.set_chunk_offset(1, 0).is_err());
    }

    #[test]
    fn test_write_into_promotes_to_co64() {
        let mut stbl_box = stbl(vec![10, 10], vec![100], vec![run(1, 2)]);
        let table = StblSampleTable::from_stbl(&stbl_box).unwrap();

        table.write_into(&mut stbl_box, 1000).unwrap();
        assert_eq!(stbl_box.child(BoxType::STCO).and_then(Mp4Box::as_stco).unwrap().entries, vec![1100]);
        let stsz = stbl_box.child(BoxType::STSZ).and_then(Mp4Box::as_stsz).unwrap();
        assert_eq!(stsz.sample_size, 10);

        table.write_into(&mut stbl_box, u32::MAX as u64).unwrap();
        assert!(stbl_box.child(BoxType::STCO).is_none());
        let co64 = stbl_box.child(BoxType::CO64).and_then(Mp4Box::as_co64).unwrap();
        assert_eq!(co64.entries, vec![u32::MAX as u64 + 100]);
    }

    #[test]
    fn test_empty_table() {
        let table = StblSampleTable::from_stbl(&stbl(vec![], vec![], vec![])).unwrap();
        assert_eq!(table.sample_count(), 0);
    }
}
