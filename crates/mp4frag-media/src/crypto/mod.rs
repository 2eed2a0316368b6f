//! AES-128 stream ciphers with a buffer-at-a-time contract.
//!
//! Every cipher keeps its position, chaining block and partial input
//! between calls, so a sample may be fed in pieces of any size.

mod cbc;
mod ctr;
mod handler;
mod pattern;

pub use self::cbc::CbcStreamCipher;
pub use self::ctr::{CounterSize, CtrStreamCipher};
pub use handler::{sample_iv, CipherFactory, CipherMode, CipherParams, CipherTrackHandler};
pub use pattern::PatternStreamCipher;

use crate::{Error, Result};

pub const AES_BLOCK_SIZE: usize = 16;

pub type Key = [u8; 16];
pub type Iv = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Block padding of CBC ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    None,
    Pkcs7,
}

/// Streaming cipher over a byte stream.
pub trait StreamCipher {
    /// Process `input` into `output`, returning the bytes written.
    ///
    /// `output` must hold at least
    /// [`output_size`](StreamCipher::output_size) bytes, otherwise
    /// [`Error::BufferTooSmall`] reports the size needed and no state
    /// changes.
    fn process_buffer(&mut self, input: &[u8], output: &mut [u8], is_last: bool) -> Result<usize>;

    /// Output bytes the next [`process_buffer`](StreamCipher::process_buffer)
    /// call needs room for.
    fn output_size(&self, input_size: usize, is_last: bool) -> usize;

    fn set_stream_offset(&mut self, offset: u64) -> Result<()>;

    fn stream_offset(&self) -> u64;

    /// Replace the IV and restart at stream offset 0.
    fn set_iv(&mut self, iv: &[u8]) -> Result<()>;

    fn iv(&self) -> &Iv;

    /// Process `input` into a new buffer.
    fn process(&mut self, input: &[u8], is_last: bool) -> Result<Vec<u8>> {
        let mut output = vec![0; self.output_size(input.len(), is_last)];
        let written = self.process_buffer(input, &mut output, is_last)?;
        output.truncate(written);
        Ok(output)
    }
}

fn check_output(output: &[u8], required: usize) -> Result<()> {
    if output.len() < required {
        return Err(Error::BufferTooSmall { required });
    }
    Ok(())
}

fn parse_iv(iv: &[u8]) -> Result<Iv> {
    iv.try_into()
        .map_err(|_| Error::invalid_parameters(format!("IV must be 16 bytes, got {}", iv.len())))
}
