use anyhow::{Context, Result};
use clap::Args;
use mp4frag_media::boxes::{BoxReader, Inspector, JsonInspector, TextInspector};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct DumpArgs {
    /// File to dump
    pub file: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Print the box tree of a file.
pub fn run(args: &DumpArgs) -> Result<()> {
    super::require_file(&args.file)?;
    let mut reader =
        BufReader::new(File::open(&args.file).with_context(|| format!("Failed to open {:?}", args.file))?);

    if args.json {
        let mut inspector = JsonInspector::new();
        inspect_all(&mut reader, &mut inspector)?;
        println!("{}", serde_json::to_string_pretty(&inspector.into_value())?);
    } else {
        let mut inspector = TextInspector::new();
        inspect_all(&mut reader, &mut inspector)?;
        print!("{}", inspector.into_string());
    }
    Ok(())
}

fn inspect_all(reader: &mut BufReader<File>, inspector: &mut dyn Inspector) -> Result<()> {
    for item in BoxReader::new(reader)? {
        let (_, parsed) = item.context("Failed to parse box")?;
        parsed.inspect(inspector);
    }
    Ok(())
}
