//! Per-track read position used while planning fragments.

use crate::boxes::TfraBox;
use crate::movie::Track;
use crate::sample_table::{Sample, SampleTable};
use crate::Result;
use std::collections::HashSet;

/// A track's samples, with sync flags that may be forced on.
pub(crate) struct SampleArray {
    table: Box<dyn SampleTable>,
    forced_sync: HashSet<usize>,
}

impl SampleArray {
    pub(crate) fn new(table: Box<dyn SampleTable>) -> Self {
        Self {
            table,
            forced_sync: HashSet::new(),
        }
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.table.sample_count()
    }

    pub(crate) fn sample(&self, index: usize) -> Result<Sample> {
        let mut sample = self.table.sample(index)?;
        if self.forced_sync.contains(&index) {
            sample.is_sync = true;
        }
        Ok(sample)
    }

    pub(crate) fn force_sync(&mut self, index: usize) {
        self.forced_sync.insert(index);
    }

    pub(crate) fn sync_count(&self) -> Result<usize> {
        let mut count = 0;
        for i in 0..self.sample_count() {
            if self.sample(i)?.is_sync {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Read position in one track.
///
/// Once past the last sample the cursor is at end of stream and its
/// current sample is a marker whose `dts` is the end of the track.
pub(crate) struct TrackCursor {
    pub track: Track,
    pub samples: SampleArray,
    pub sample_index: usize,
    pub sample: Sample,
    pub eos: bool,
    /// Number of fragments emitted so far.
    pub fragment_index: u32,
    /// Output timestamp of the next sample, in the output media timescale.
    pub timestamp: u64,
    /// Same as `timestamp`, in the track's own media timescale.
    pub unscaled_timestamp: u64,
    pub tfra: TfraBox,
    /// Tracks with at most one sync sample may cut fragments anywhere.
    sync_starved: bool,
}

impl TrackCursor {
    pub(crate) fn new(track: Track, samples: SampleArray) -> Self {
        let tfra = TfraBox::new(track.id);
        Self {
            track,
            samples,
            sample_index: 0,
            sample: Sample::default(),
            eos: false,
            fragment_index: 0,
            timestamp: 0,
            unscaled_timestamp: 0,
            tfra,
            sync_starved: false,
        }
    }

    /// Position on the first sample. Call after any forced sync marking.
    pub(crate) fn init(&mut self) -> Result<()> {
        self.sync_starved = self.samples.sync_count()? <= 1;
        self.set_sample_index(0)
    }

    pub(crate) fn set_sample_index(&mut self, index: usize) -> Result<()> {
        self.sample_index = index;
        if index >= self.samples.sample_count() {
            let end_dts = self.sample.dts + self.sample.duration as u64;
            self.sample = Sample {
                dts: end_dts,
                ..Default::default()
            };
            self.eos = true;
        } else {
            self.sample = self.samples.sample(index)?;
        }
        Ok(())
    }

    /// Index of the first sample of the next fragment: the boundary whose
    /// decode time is closest to `target_dts`. Candidates are the sync
    /// samples after the current one and the end of the track.
    pub(crate) fn end_sample_index(&self, target_dts: u64) -> Result<usize> {
        let count = self.samples.sample_count();
        let mut end = count;
        let mut smallest_diff = u64::MAX;
        for i in self.sample_index + 1..=count {
            let dts = if i < count {
                let sample = self.samples.sample(i)?;
                if !sample.is_sync && !self.sync_starved {
                    continue;
                }
                sample.dts
            } else {
                let last = self.samples.sample(i - 1)?;
                last.dts + last.duration as u64
            };
            let abs_diff = dts.abs_diff(target_dts);
            if abs_diff < smallest_diff {
                end = i;
                smallest_diff = abs_diff;
            }
            // Decode times only grow from here.
            if dts >= target_dts {
                break;
            }
        }
        Ok(end)
    }
}
