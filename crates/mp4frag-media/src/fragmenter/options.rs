//! Fragmenter configuration.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Fragment duration used when none is given and detection fails.
pub const DEFAULT_FRAGMENT_DURATION_MS: u32 = 2000;

/// Detected durations above this are rejected in favour of the default.
pub const MAX_AUTO_FRAGMENT_DURATION_MS: u32 = 40000;

/// Timescale of the output `mvhd`.
pub const OUTPUT_MOVIE_TIMESCALE: u32 = 1000;

/// Which tracks to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum TrackSelector {
    #[default]
    All,
    Id(u32),
    /// First audio track.
    Audio,
    /// First video track.
    Video,
    /// First subtitles track.
    Subtitles,
}

impl FromStr for TrackSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "subtitles" => Ok(Self::Subtitles),
            id => id
                .parse()
                .map(Self::Id)
                .map_err(|_| Error::invalid_parameters(format!("invalid track selector '{s}'"))),
        }
    }
}

impl fmt::Display for TrackSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Id(id) => write!(f, "{id}"),
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
            Self::Subtitles => f.write_str("subtitles"),
        }
    }
}

/// Marking of unflagged H.264 I frames as sync samples, for open-GOP
/// sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum ForceSyncMode {
    #[default]
    None,
    /// Only when no sample past the first is flagged as sync.
    Auto,
    All,
}

impl FromStr for ForceSyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "auto" => Ok(Self::Auto),
            "all" => Ok(Self::All),
            other => Err(Error::invalid_parameters(format!(
                "unknown force-sync mode '{other}'"
            ))),
        }
    }
}

/// Options for [`Fragmenter`](super::Fragmenter).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct FragmentOptions {
    /// Target fragment length. `None` detects it from the input.
    pub fragment_duration_ms: Option<u32>,
    /// Output media timescale; timestamps, durations and composition
    /// offsets are converted to it.
    pub timescale: Option<u32>,
    pub track: TrackSelector,
    /// Reserve a `sidx` after the `moov` and fill it in once every
    /// fragment is written.
    pub create_segment_index: bool,
    /// Stop when the anchor track ends instead of picking a new anchor.
    pub trim: bool,
    pub no_tfdt: bool,
    /// Seconds added to every `tfdt`.
    pub tfdt_start: f64,
    pub sequence_number_start: u32,
    pub force_i_frame_sync: ForceSyncMode,
    pub copy_udta: bool,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            fragment_duration_ms: None,
            timescale: None,
            track: TrackSelector::All,
            create_segment_index: false,
            trim: false,
            no_tfdt: false,
            tfdt_start: 0.0,
            sequence_number_start: 1,
            force_i_frame_sync: ForceSyncMode::None,
            copy_udta: false,
        }
    }
}

impl FragmentOptions {
    /// Reject values the fragmenter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.fragment_duration_ms == Some(0) {
            return Err(Error::invalid_parameters("fragment duration must be positive"));
        }
        if self.timescale == Some(0) {
            return Err(Error::invalid_parameters("timescale must be positive"));
        }
        if !self.tfdt_start.is_finite() || self.tfdt_start < 0.0 {
            return Err(Error::invalid_parameters("tfdt start must be a non-negative number"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_track_selector() {
        assert_eq!("video".parse::<TrackSelector>().unwrap(), TrackSelector::Video);
        assert_eq!("2".parse::<TrackSelector>().unwrap(), TrackSelector::Id(2));
        assert!("sound".parse::<TrackSelector>().is_err());
        assert_eq!(TrackSelector::Id(7).to_string(), "7");
    }

    #[test]
    fn test_parse_force_sync_mode() {
        assert_eq!("auto".parse::<ForceSyncMode>().unwrap(), ForceSyncMode::Auto);
        let err = "sometimes".parse::<ForceSyncMode>().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParameters);
    }

    #[test]
    fn test_validate() {
        assert!(FragmentOptions::default().validate().is_ok());
        let bad = FragmentOptions {
            fragment_duration_ms: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = FragmentOptions {
            tfdt_start: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
