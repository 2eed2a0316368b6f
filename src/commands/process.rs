use anyhow::{Context, Result};
use clap::Args;
use mp4frag_media::processor::{HandlerFactory, IdentityFactory, ProcessReport, Processor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Args)]
pub struct ProcessArgs {
    /// Input MP4 file, or media segment when --init is given
    pub input: PathBuf,

    /// Output file
    pub output: PathBuf,

    /// Init segment holding the moov of a media segment input
    #[arg(long)]
    pub init: Option<PathBuf>,
}

/// Rewrite a file without transforming samples, refreshing sizes, offsets
/// and indexes.
pub fn run(args: &ProcessArgs) -> Result<()> {
    let report = process_with(&args.input, &args.output, args.init.as_deref(), &mut IdentityFactory)?;
    print_report(&report, &args.output);
    Ok(())
}

/// Run the processor with `factory` over `input` (plus `init` for decoupled
/// segments).
pub(crate) fn process_with(
    input: &Path,
    output: &Path,
    init: Option<&Path>,
    factory: &mut dyn HandlerFactory,
) -> Result<ProcessReport> {
    super::require_file(input)?;
    let mut reader = BufReader::new(File::open(input).with_context(|| format!("Failed to open {:?}", input))?);
    let mut writer =
        BufWriter::new(File::create(output).with_context(|| format!("Failed to create {:?}", output))?);
    let mut progress = super::log_progress("Processing");

    let processor = Processor::new();
    let report = match init {
        Some(init) => {
            super::require_file(init)?;
            let mut init_reader =
                BufReader::new(File::open(init).with_context(|| format!("Failed to open {:?}", init))?);
            processor.process_with_fragments(&mut init_reader, &mut reader, &mut writer, factory, Some(&mut progress))
        }
        None => processor.process(&mut reader, &mut writer, factory, Some(&mut progress)),
    }
    .with_context(|| format!("Failed to process {:?}", input))?;
    writer.flush()?;
    Ok(report)
}

pub(crate) fn print_report(report: &ProcessReport, output: &Path) {
    println!("Output: {}", output.display());
    if !report.handled_tracks.is_empty() {
        let ids: Vec<String> = report.handled_tracks.iter().map(|id| id.to_string()).collect();
        println!("Tracks: {}", ids.join(", "));
    }
    if report.samples > 0 {
        println!("Samples: {}", report.samples);
    }
    if report.fragments > 0 {
        println!("Fragments: {}", report.fragments);
    }
    if report.sidx_updated {
        println!("Updated segment index (sidx)");
    }
    if report.mfra_updated {
        println!("Updated random access index (mfra)");
    }
    println!("Size: {} bytes", report.output_size);
}
