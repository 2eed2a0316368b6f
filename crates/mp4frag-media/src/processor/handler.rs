//! Per-track sample transforms plugged into the [`Processor`](super::Processor).

use crate::boxes::{Mp4Box, TrexBox};
use crate::movie::Track;
use crate::sample_table::{FragmentSampleTable, Sample};
use crate::stream::ReadSeek;
use crate::Result;
use std::ops::ControlFlow;

/// Transform applied to the samples of one track.
///
/// Only [`process_sample`](TrackHandler::process_sample) is required. The
/// other hooks default to leaving the track untouched.
pub trait TrackHandler {
    /// Called once per track in a non-fragmented file, after the new sample
    /// layout is known. May rewrite the sample descriptions.
    fn process_track(&mut self, _trak: &mut Mp4Box) -> Result<()> {
        Ok(())
    }

    /// Size `sample` will have once processed. Only the non-fragmented path
    /// asks, to lay out chunks before any byte is written.
    fn processed_sample_size(&mut self, sample: &Sample, _input: &mut dyn ReadSeek) -> Result<u32> {
        Ok(sample.size)
    }

    /// Sees every sample of a track fragment before any is processed.
    fn prepare_for_samples(&mut self, _samples: &FragmentSampleTable) -> Result<()> {
        Ok(())
    }

    fn process_sample(&mut self, sample: &Sample, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Called after all samples of a `traf` are written, with sample sizes
    /// and data offsets already updated.
    fn finish_fragment(&mut self, _traf: &mut Mp4Box) -> Result<()> {
        Ok(())
    }
}

/// Creates the handlers a [`Processor`](super::Processor) runs. Returning
/// `None` copies the track unchanged.
pub trait HandlerFactory {
    fn create_track_handler(&mut self, track: &Track) -> Result<Option<Box<dyn TrackHandler>>>;

    /// Handler for one `traf`. `track` is the `moov` track with the same id,
    /// if there is one. Defaults to [`create_track_handler`].
    ///
    /// [`create_track_handler`]: HandlerFactory::create_track_handler
    fn create_fragment_handler(
        &mut self,
        track: Option<&Track>,
        _trex: Option<&TrexBox>,
        _traf: &Mp4Box,
    ) -> Result<Option<Box<dyn TrackHandler>>> {
        match track {
            Some(track) => self.create_track_handler(track),
            None => Ok(None),
        }
    }
}

/// Factory that never transforms anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFactory;

impl HandlerFactory for IdentityFactory {
    fn create_track_handler(&mut self, _track: &Track) -> Result<Option<Box<dyn TrackHandler>>> {
        Ok(None)
    }
}

/// Progress callback, called with `(step, total)`. Returning
/// [`ControlFlow::Break`] cancels processing.
pub trait ProgressListener {
    fn on_progress(&mut self, step: usize, total: usize) -> ControlFlow<()>;
}

impl<F> ProgressListener for F
where
    F: FnMut(usize, usize) -> ControlFlow<()>,
{
    fn on_progress(&mut self, step: usize, total: usize) -> ControlFlow<()> {
        self(step, total)
    }
}
