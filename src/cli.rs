use clap::{Parser, Subcommand};
use mp4frag::commands::{CryptArgs, DumpArgs, FragmentArgs, ProcessArgs, SamplesArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mp4frag")]
#[command(author, version, about = "MP4 fragmenter and fragment rewriter")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert an MP4 file into a fragmented MP4 file
    Fragment(FragmentArgs),

    /// Rewrite a file, refreshing sample offsets and fragment indexes
    Process(ProcessArgs),

    /// Encrypt the samples of an MP4 file
    Encrypt(CryptArgs),

    /// Decrypt the samples of an MP4 file
    Decrypt(CryptArgs),

    /// Print the box tree of a file
    Dump(DumpArgs),

    /// List the samples of a file in storage order
    Samples(SamplesArgs),

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
