use anyhow::{Context, Result};
use clap::Args;
use mp4frag_media::linear_reader::LinearReader;
use mp4frag_media::{Error, Mp4File};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct SamplesArgs {
    /// File to list
    pub file: PathBuf,

    /// Only list this track
    #[arg(long)]
    pub track: Option<u32>,
}

/// List samples in storage order.
pub fn run(args: &SamplesArgs, max_buffer: usize) -> Result<()> {
    super::require_file(&args.file)?;
    let file = Mp4File::open(&args.file).with_context(|| format!("Failed to parse {:?}", args.file))?;
    let movie = file.require_movie()?;
    let stream = BufReader::new(File::open(&args.file)?);
    let mut reader = LinearReader::new(movie, stream, max_buffer)?;

    let track_ids: Vec<u32> = match args.track {
        Some(id) => vec![id],
        None => movie.tracks().iter().map(|t| t.id).collect(),
    };
    for id in &track_ids {
        reader
            .enable_track(*id)
            .with_context(|| format!("No track with id {}", id))?;
    }

    println!("{:>5} {:>12} {:>12} {:>8} {:>12} sync", "track", "dts", "cts", "size", "offset");
    let mut count = 0usize;
    loop {
        let (track_id, sample) = match reader.next_sample() {
            Ok(next) => next,
            Err(Error::EndOfStream) => break,
            Err(e) => return Err(e).context("Failed to read samples"),
        };
        println!(
            "{:>5} {:>12} {:>12} {:>8} {:>12} {}",
            track_id,
            sample.dts,
            sample.cts(),
            sample.size,
            sample.offset,
            if sample.is_sync { "*" } else { "" }
        );
        count += 1;
    }
    println!("Samples: {}", count);
    Ok(())
}
