use mp4frag_media::crypto::CipherMode;
use mp4frag_media::fragmenter::{ForceSyncMode, FragmentOptions};
use mp4frag_media::linear_reader::DEFAULT_MAX_BUFFER;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub fragment: FragmentConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub reader: ReaderConfig,
}

/// Fragmenter defaults. Command-line flags take precedence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FragmentConfig {
    /// Target fragment duration in milliseconds (detected when unset)
    #[serde(default)]
    pub fragment_duration_ms: Option<u32>,

    /// Output media timescale
    #[serde(default)]
    pub timescale: Option<u32>,

    /// Write a segment index (sidx)
    #[serde(default)]
    pub create_segment_index: bool,

    #[serde(default)]
    pub trim: bool,

    #[serde(default)]
    pub no_tfdt: bool,

    /// Seconds added to every tfdt
    #[serde(default)]
    pub tfdt_start: f64,

    #[serde(default = "default_sequence_number_start")]
    pub sequence_number_start: u32,

    #[serde(default)]
    pub force_i_frame_sync: ForceSyncMode,

    #[serde(default)]
    pub copy_udta: bool,
}

fn default_sequence_number_start() -> u32 {
    1
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            fragment_duration_ms: None,
            timescale: None,
            create_segment_index: false,
            trim: false,
            no_tfdt: false,
            tfdt_start: 0.0,
            sequence_number_start: default_sequence_number_start(),
            force_i_frame_sync: ForceSyncMode::None,
            copy_udta: false,
        }
    }
}

impl FragmentConfig {
    pub fn to_options(&self) -> FragmentOptions {
        FragmentOptions {
            fragment_duration_ms: self.fragment_duration_ms,
            timescale: self.timescale,
            create_segment_index: self.create_segment_index,
            trim: self.trim,
            no_tfdt: self.no_tfdt,
            tfdt_start: self.tfdt_start,
            sequence_number_start: self.sequence_number_start,
            force_i_frame_sync: self.force_i_frame_sync,
            copy_udta: self.copy_udta,
            ..Default::default()
        }
    }
}

/// Defaults for `process`, `encrypt` and `decrypt`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Cipher mode when `--method` is not given (default: ctr)
    #[serde(default = "default_cipher_mode")]
    pub cipher_mode: CipherMode,

    /// Encrypted blocks per pattern period for cens/cbcs (default: 1)
    #[serde(default = "default_crypt_byte_block")]
    pub crypt_byte_block: u8,

    /// Clear blocks per pattern period for cens/cbcs (default: 9)
    #[serde(default = "default_skip_byte_block")]
    pub skip_byte_block: u8,
}

fn default_cipher_mode() -> CipherMode {
    CipherMode::Ctr
}

fn default_crypt_byte_block() -> u8 {
    1
}

fn default_skip_byte_block() -> u8 {
    9
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cipher_mode: default_cipher_mode(),
            crypt_byte_block: default_crypt_byte_block(),
            skip_byte_block: default_skip_byte_block(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaderConfig {
    /// Read-ahead limit of the sample reader in bytes (default: 16 MiB)
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}
