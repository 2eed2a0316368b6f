use super::process::{print_report, process_with};
use crate::config::ProcessorConfig;
use anyhow::{Context, Result};
use clap::Args;
use mp4frag_media::crypto::{CipherFactory, CipherMode, CipherParams, Direction, Iv, Key};
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct CryptArgs {
    /// Input MP4 file, or media segment when --init is given
    pub input: PathBuf,

    /// Output file
    pub output: PathBuf,

    /// AES-128 key as 32 hex digits
    #[arg(long)]
    pub key: String,

    /// Initialization vector as 16 or 32 hex digits
    #[arg(long)]
    pub iv: String,

    /// Cipher mode: ctr, cbc, cens or cbcs
    #[arg(long)]
    pub method: Option<CipherMode>,

    /// Only handle these track ids (repeatable; all tracks by default)
    #[arg(long = "track")]
    pub tracks: Vec<u32>,

    /// Init segment holding the moov of a media segment input
    #[arg(long)]
    pub init: Option<PathBuf>,

    /// Encrypted blocks per pattern period (cens, cbcs)
    #[arg(long)]
    pub crypt_byte_block: Option<u8>,

    /// Clear blocks per pattern period (cens, cbcs)
    #[arg(long)]
    pub skip_byte_block: Option<u8>,
}

impl CryptArgs {
    pub fn params(&self, direction: Direction, config: &ProcessorConfig) -> Result<CipherParams> {
        let mode = self.method.unwrap_or(config.cipher_mode);
        let mut params = CipherParams::new(mode, direction, parse_key(&self.key)?, parse_iv(&self.iv)?);
        params.crypt_byte_block = self.crypt_byte_block.unwrap_or(config.crypt_byte_block);
        params.skip_byte_block = self.skip_byte_block.unwrap_or(config.skip_byte_block);
        Ok(params)
    }
}

pub fn encrypt(args: &CryptArgs, config: &ProcessorConfig) -> Result<()> {
    run(args, Direction::Encrypt, config)
}

pub fn decrypt(args: &CryptArgs, config: &ProcessorConfig) -> Result<()> {
    run(args, Direction::Decrypt, config)
}

fn run(args: &CryptArgs, direction: Direction, config: &ProcessorConfig) -> Result<()> {
    let params = args.params(direction, config)?;
    tracing::info!("{:?} with {} on {:?}", direction, params.mode, args.input);
    let mut factory = CipherFactory::new(params).with_tracks(args.tracks.iter().copied());
    let report = process_with(&args.input, &args.output, args.init.as_deref(), &mut factory)?;
    if report.handled_tracks.is_empty() && report.fragments == 0 {
        tracing::warn!("No track matched, output is a plain copy");
    }
    print_report(&report, &args.output);
    Ok(())
}

/// Parse a 128-bit key.
pub fn parse_key(text: &str) -> Result<Key> {
    let bytes = hex::decode(text.trim()).context("Key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key must be 16 bytes, got {}", b.len()))
}

/// Parse an IV. An 8-byte IV fills the upper half and leaves the counter
/// half zero.
pub fn parse_iv(text: &str) -> Result<Iv> {
    let bytes = hex::decode(text.trim()).context("IV is not valid hex")?;
    let mut iv = [0u8; 16];
    match bytes.len() {
        8 => iv[..8].copy_from_slice(&bytes),
        16 => iv.copy_from_slice(&bytes),
        n => anyhow::bail!("IV must be 8 or 16 bytes, got {}", n),
    }
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key = parse_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[15], 0x0f);
        assert!(parse_key("0001").is_err());
        assert!(parse_key("zz").is_err());
    }

    #[test]
    fn test_parse_short_iv() {
        let iv = parse_iv("0102030405060708").unwrap();
        assert_eq!(iv[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(iv[8..], [0; 8]);
        assert!(parse_iv("01").is_err());
    }
}
