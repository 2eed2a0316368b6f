use crate::config::FragmentConfig;
use anyhow::{Context, Result};
use clap::Args;
use mp4frag_media::fragmenter::{ForceSyncMode, FragmentOptions, Fragmenter, TrackSelector};
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct FragmentArgs {
    /// Input MP4 file
    pub input: PathBuf,

    /// Output fragmented MP4 file
    pub output: PathBuf,

    /// Target fragment duration in milliseconds (detected from the input when omitted)
    #[arg(long)]
    pub fragment_duration: Option<u32>,

    /// Output media timescale
    #[arg(long)]
    pub timescale: Option<u32>,

    /// Track to emit: all, audio, video, subtitles or a track id
    #[arg(long, default_value = "all")]
    pub track: TrackSelector,

    /// Write a segment index (sidx)
    #[arg(long)]
    pub index: bool,

    /// Stop when the anchor track ends
    #[arg(long)]
    pub trim: bool,

    /// Do not write tfdt boxes
    #[arg(long)]
    pub no_tfdt: bool,

    /// Seconds added to every tfdt
    #[arg(long)]
    pub tfdt_start: Option<f64>,

    /// First fragment sequence number
    #[arg(long)]
    pub sequence_number_start: Option<u32>,

    /// Mark unflagged I frames as sync samples: none, auto or all
    #[arg(long)]
    pub force_i_frame_sync: Option<ForceSyncMode>,

    /// Copy moov/udta into the output
    #[arg(long)]
    pub copy_udta: bool,

    /// Print the fragment report as JSON
    #[arg(long)]
    pub json: bool,
}

impl FragmentArgs {
    /// Merge the flags over the configured defaults.
    pub fn options(&self, config: &FragmentConfig) -> FragmentOptions {
        let defaults = config.to_options();
        FragmentOptions {
            fragment_duration_ms: self.fragment_duration.or(defaults.fragment_duration_ms),
            timescale: self.timescale.or(defaults.timescale),
            track: self.track,
            create_segment_index: self.index || defaults.create_segment_index,
            trim: self.trim || defaults.trim,
            no_tfdt: self.no_tfdt || defaults.no_tfdt,
            tfdt_start: self.tfdt_start.unwrap_or(defaults.tfdt_start),
            sequence_number_start: self.sequence_number_start.unwrap_or(defaults.sequence_number_start),
            force_i_frame_sync: self.force_i_frame_sync.unwrap_or(defaults.force_i_frame_sync),
            copy_udta: self.copy_udta || defaults.copy_udta,
        }
    }
}

pub fn run(args: &FragmentArgs, config: &FragmentConfig) -> Result<()> {
    super::require_file(&args.input)?;
    let options = args.options(config);
    tracing::debug!("Fragment options: {:?}", options);

    let report = Fragmenter::new(options)
        .fragment_file(&args.input, &args.output)
        .with_context(|| format!("Failed to fragment {:?}", args.input))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Output: {}", args.output.display());
    println!("Anchor track: {}", report.anchor_track_id);
    println!("Fragment duration: {} ms", report.fragment_duration_ms);
    println!("Fragments: {}", report.fragments.len());
    let mut track_ids: Vec<u32> = report.fragments.iter().map(|f| f.track_id).collect();
    track_ids.sort_unstable();
    track_ids.dedup();
    for track_id in track_ids {
        let (count, samples) = report
            .fragments_of(track_id)
            .fold((0, 0), |(n, s), f| (n + 1, s + f.sample_count));
        println!("  Track {}: {} fragments, {} samples", track_id, count, samples);
    }
    println!("Size: {} bytes", report.output_size);

    Ok(())
}
