//! Sample encryption and decryption as a [`TrackHandler`].

use super::{
    CbcStreamCipher, CounterSize, CtrStreamCipher, Direction, Iv, Key, Padding, PatternStreamCipher, StreamCipher,
    AES_BLOCK_SIZE,
};
use crate::movie::Track;
use crate::processor::{HandlerFactory, TrackHandler};
use crate::sample_table::Sample;
use crate::stream::{read_at, ReadSeek};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// How samples are enciphered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum CipherMode {
    /// Whole sample, AES-CTR.
    Ctr,
    /// Whole sample, AES-CBC with PKCS#7 padding. Changes sample sizes.
    Cbc,
    /// AES-CTR over a crypt/skip block pattern.
    Cens,
    /// AES-CBC over a crypt/skip block pattern, no padding.
    Cbcs,
}

impl CipherMode {
    pub const ALL: [CipherMode; 4] = [Self::Ctr, Self::Cbc, Self::Cens, Self::Cbcs];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ctr => "ctr",
            Self::Cbc => "cbc",
            Self::Cens => "cens",
            Self::Cbcs => "cbcs",
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_parameters(format!("unknown cipher mode '{s}'")))
    }
}

/// Key material and mode shared by every handled track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub mode: CipherMode,
    pub direction: Direction,
    pub key: Key,
    pub iv: Iv,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

impl CipherParams {
    /// Parameters with the common 1:9 pattern.
    pub fn new(mode: CipherMode, direction: Direction, key: Key, iv: Iv) -> Self {
        Self {
            mode,
            direction,
            key,
            iv,
            crypt_byte_block: 1,
            skip_byte_block: 9,
        }
    }

    fn cipher(&self, iv: &Iv) -> Box<dyn StreamCipher> {
        let cbc = |padding| CbcStreamCipher::new(&self.key, iv, self.direction, padding);
        let ctr = || CtrStreamCipher::new(&self.key, iv, CounterSize::Bytes8);
        match self.mode {
            CipherMode::Ctr => Box::new(ctr()),
            CipherMode::Cbc => Box::new(cbc(Padding::Pkcs7)),
            CipherMode::Cens => Box::new(PatternStreamCipher::new(ctr(), self.crypt_byte_block, self.skip_byte_block)),
            CipherMode::Cbcs => Box::new(PatternStreamCipher::new(
                cbc(Padding::None),
                self.crypt_byte_block,
                self.skip_byte_block,
            )),
        }
    }
}

/// IV of the sample decoded at `dts`: the upper 8 bytes of `iv`, read as a
/// big-endian integer, plus `dts`.
pub fn sample_iv(iv: &Iv, dts: u64) -> Iv {
    let mut out = *iv;
    let mut upper = [0u8; 8];
    upper.copy_from_slice(&iv[..8]);
    let upper = u64::from_be_bytes(upper).wrapping_add(dts);
    out[..8].copy_from_slice(&upper.to_be_bytes());
    out
}

/// Enciphers every sample of one track with its own IV.
pub struct CipherTrackHandler {
    params: CipherParams,
}

impl CipherTrackHandler {
    pub fn new(params: CipherParams) -> Self {
        Self { params }
    }
}

impl TrackHandler for CipherTrackHandler {
    fn processed_sample_size(&mut self, sample: &Sample, input: &mut dyn ReadSeek) -> Result<u32> {
        if self.params.mode != CipherMode::Cbc {
            return Ok(sample.size);
        }
        let block = AES_BLOCK_SIZE as u32;
        match self.params.direction {
            Direction::Encrypt => Ok((sample.size / block + 1) * block),
            Direction::Decrypt => {
                if sample.size < block || sample.size % block != 0 {
                    return Err(Error::invalid_format(format!(
                        "cbc sample of {} bytes is not whole blocks",
                        sample.size
                    )));
                }
                // Decrypting the last block, chained on the one before it
                // (or the IV), reveals the padding.
                let sample_iv = sample_iv(&self.params.iv, sample.dts);
                let (chain, tail) = if sample.size == block {
                    (sample_iv, read_at(input, sample.offset, AES_BLOCK_SIZE)?)
                } else {
                    let bytes = read_at(input, sample.offset + (sample.size - 2 * block) as u64, 2 * AES_BLOCK_SIZE)?;
                    let mut chain = [0u8; 16];
                    chain.copy_from_slice(&bytes[..AES_BLOCK_SIZE]);
                    (chain, bytes[AES_BLOCK_SIZE..].to_vec())
                };
                let mut cipher =
                    CbcStreamCipher::new(&self.params.key, &chain, Direction::Decrypt, Padding::Pkcs7);
                let last = cipher.process(&tail, true)?;
                Ok(sample.size - block + last.len() as u32)
            }
        }
    }

    fn process_sample(&mut self, sample: &Sample, data: Vec<u8>) -> Result<Vec<u8>> {
        let iv = sample_iv(&self.params.iv, sample.dts);
        self.params.cipher(&iv).process(&data, true)
    }
}

/// Creates a [`CipherTrackHandler`] for the selected tracks.
#[derive(Debug, Clone)]
pub struct CipherFactory {
    params: CipherParams,
    /// Track ids to handle; empty selects every track.
    tracks: Vec<u32>,
}

impl CipherFactory {
    pub fn new(params: CipherParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(mut self, tracks: impl IntoIterator<Item = u32>) -> Self {
        self.tracks = tracks.into_iter().collect();
        self
    }
}

impl HandlerFactory for CipherFactory {
    fn create_track_handler(&mut self, track: &Track) -> Result<Option<Box<dyn TrackHandler>>> {
        if !self.tracks.is_empty() && !self.tracks.contains(&track.id) {
            return Ok(None);
        }
        debug!(
            track_id = track.id,
            mode = %self.params.mode,
            direction = ?self.params.direction,
            "cipher handler"
        );
        Ok(Some(Box::new(CipherTrackHandler::new(self.params.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_reader::{LinearReader, DEFAULT_MAX_BUFFER};
    use crate::movie::Mp4File;
    use crate::processor::Processor;
    use crate::testing::{Mp4Builder, TrackSpec};
    use std::io::Cursor;

    const KEY: Key = [0x11; 16];
    const IV: Iv = [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];

    fn av() -> Mp4Builder {
        Mp4Builder::new()
            .track(TrackSpec::video(1, 8, 100).timescale(1000))
            .track(TrackSpec::audio(2, 20, 40).timescale(1000))
    }

    fn process(input: &[u8], mode: CipherMode, direction: Direction, tracks: &[u32]) -> Vec<u8> {
        let mut factory =
            CipherFactory::new(CipherParams::new(mode, direction, KEY, IV)).with_tracks(tracks.iter().copied());
        let mut output = Cursor::new(Vec::new());
        Processor::new()
            .process(&mut Cursor::new(input.to_vec()), &mut output, &mut factory, None)
            .unwrap();
        output.into_inner()
    }

    fn payloads(data: &[u8], track_id: u32) -> Vec<Vec<u8>> {
        let file = Mp4File::parse(&mut Cursor::new(data.to_vec())).unwrap();
        let mut reader =
            LinearReader::new(file.require_movie().unwrap(), Cursor::new(data.to_vec()), DEFAULT_MAX_BUFFER).unwrap();
        reader.enable_track(track_id).unwrap();
        let mut out = Vec::new();
        while let Ok((_, _, bytes)) = reader.read_next_sample() {
            out.push(bytes);
        }
        out
    }

    #[test]
    fn test_sample_iv_adds_dts_to_upper_half() {
        let iv = sample_iv(&IV, 0x0102);
        assert_eq!(iv[..8], [0, 0, 0, 0, 0, 0, 0x01, 0x03]);
        assert_eq!(iv[8..], IV[8..]);

        let wrapped = sample_iv(&[0xFF; 16], 1);
        assert_eq!(wrapped[..8], [0; 8]);
    }

    #[test]
    fn test_mode_names() {
        for mode in CipherMode::ALL {
            assert_eq!(mode.to_string().parse::<CipherMode>().unwrap(), mode);
        }
        assert_eq!("CBCS".parse::<CipherMode>().unwrap(), CipherMode::Cbcs);
        assert!("cenc".parse::<CipherMode>().is_err());
    }

    #[test]
    fn test_round_trip_every_mode() {
        let input = av().samples_per_chunk(2).build();
        for mode in CipherMode::ALL {
            let encrypted = process(&input, mode, Direction::Encrypt, &[1]);
            let clear = payloads(&input, 1);
            let sealed = payloads(&encrypted, 1);
            assert_ne!(sealed, clear, "{mode}");
            assert_eq!(payloads(&encrypted, 2), payloads(&input, 2), "{mode}");
            if mode == CipherMode::Cbc {
                for (s, c) in sealed.iter().zip(&clear) {
                    assert_eq!(s.len(), (c.len() / 16 + 1) * 16);
                }
            } else {
                assert_eq!(encrypted.len(), input.len(), "{mode}");
            }

            let decrypted = process(&encrypted, mode, Direction::Decrypt, &[1]);
            assert_eq!(payloads(&decrypted, 1), clear, "{mode}");
            assert_eq!(payloads(&decrypted, 2), payloads(&input, 2), "{mode}");
        }
    }

    #[test]
    fn test_fragmented_round_trip() {
        let input = av().fragmented(3).with_sidx().build();
        let encrypted = process(&input, CipherMode::Cbc, Direction::Encrypt, &[]);
        assert_ne!(payloads(&encrypted, 2), payloads(&input, 2));
        let decrypted = process(&encrypted, CipherMode::Cbc, Direction::Decrypt, &[]);
        for track_id in [1, 2] {
            assert_eq!(payloads(&decrypted, track_id), payloads(&input, track_id));
        }
        assert_eq!(decrypted.len(), input.len());
    }
}
