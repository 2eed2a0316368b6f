//! Fragment duration detection and H.264 I-frame classification.

use super::cursor::SampleArray;
use crate::boxes::{BoxReader, BoxType, Mp4Box};
use crate::time::convert_time;
use crate::Result;
use std::io::{Read, Seek};
use tracing::{debug, warn};

/// Fragment duration implied by a regular sync-sample stride, in
/// milliseconds. Returns 0 when the first sample is not sync or no stride
/// covers every sync sample.
pub(crate) fn video_fragment_duration(samples: &SampleArray, media_timescale: u32) -> Result<u32> {
    let count = samples.sample_count();
    if count == 0 || media_timescale == 0 {
        return Ok(0);
    }
    if !samples.sample(0)?.is_sync {
        warn!("first sample is not an I frame, cannot detect fragment duration");
        return Ok(0);
    }

    for interval in 1..count {
        let mut regular = true;
        let mut sync_count = 0u64;
        let mut last_dts = 0u64;
        for i in (0..count).step_by(interval) {
            let sample = samples.sample(i)?;
            if !sample.is_sync {
                regular = false;
                break;
            }
            sync_count += 1;
            last_dts = sample.dts;
        }
        if !regular {
            continue;
        }
        if sync_count < 2 || last_dts == 0 {
            return Ok(0);
        }
        let seconds = last_dts as f64 / media_timescale as f64;
        let fps = (interval as u64 * (sync_count - 1)) as f64 / seconds;
        debug!(interval, fps, "found regular I-frame interval");
        return Ok((1000.0 * interval as f64 / fps) as u32);
    }
    Ok(0)
}

/// Average length of the existing fragments of an audio track, in
/// milliseconds. The last fragment is left out when there are several,
/// since it is usually short.
pub(crate) fn audio_fragment_duration<R: Read + Seek + ?Sized>(
    input: &mut R,
    track_id: u32,
    samples: &SampleArray,
    media_timescale: u32,
) -> Result<u32> {
    let mut fragment_count = 0u64;
    let mut last_fragment_size = 0usize;
    for item in BoxReader::new(input)? {
        let (_, parsed) = item?;
        if parsed.box_type() != BoxType::MOOF {
            continue;
        }
        let owns_track = parsed
            .find("traf/tfhd")
            .and_then(Mp4Box::as_tfhd)
            .is_some_and(|tfhd| tfhd.track_id == track_id);
        if owns_track {
            fragment_count += 1;
            if let Some(trun) = parsed.find("traf/trun").and_then(Mp4Box::as_trun) {
                last_fragment_size = trun.entries.len();
            }
        }
    }

    let count = samples.sample_count();
    if fragment_count == 0 || count == 0 {
        return Ok(0);
    }
    if fragment_count > 1 && last_fragment_size > 0 {
        fragment_count -= 1;
    }
    if fragment_count <= 1 || count < last_fragment_size {
        last_fragment_size = 0;
    }
    let mut total_duration = 0u64;
    for i in 0..count - last_fragment_size {
        total_duration += samples.sample(i)?.duration as u64;
    }
    Ok(convert_time(total_duration / fragment_count, media_timescale, 1000) as u32)
}

/// Bit reader for slice headers.
struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.byte_pos)?;
        let bit = (byte >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Some(bit as u32)
    }

    fn read_bits(&mut self, n: u8) -> Option<u32> {
        (0..n).try_fold(0u32, |acc, _| Some((acc << 1) | self.read_bit()?))
    }

    /// Unsigned Exp-Golomb value.
    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u8;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        if leading_zeros == 0 {
            return Some(0);
        }
        Some((1 << leading_zeros) - 1 + self.read_bits(leading_zeros)?)
    }
}

/// Whether a length-prefixed H.264 sample starts with an IDR or I slice.
///
/// Only the first slice NAL unit is examined.
pub(crate) fn is_i_frame(data: &[u8], nalu_length_size: u8) -> bool {
    let length_size = nalu_length_size as usize;
    if !matches!(length_size, 1 | 2 | 4) {
        return false;
    }
    let mut rest = data;
    while rest.len() >= length_size {
        let (prefix, tail) = rest.split_at(length_size);
        let nalu_length = prefix.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        let nalu = &tail[..nalu_length.min(tail.len())];
        match nalu.first().map(|b| b & 0x1F) {
            // non-IDR slice: first_mb_in_slice, then slice_type
            Some(1) => {
                let mut bits = BitReader::new(&nalu[1..]);
                let slice_type = bits.read_ue().and_then(|_| bits.read_ue());
                return matches!(slice_type, Some(2 | 7));
            }
            Some(5) => return true,
            _ => {}
        }
        rest = &tail[nalu.len()..];
    }
    false
}
