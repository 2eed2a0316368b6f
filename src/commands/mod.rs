//! Command implementations behind the `mp4frag` subcommands.

pub mod crypt;
pub mod dump;
pub mod fragment;
pub mod process;
pub mod samples;

pub use crypt::CryptArgs;
pub use dump::DumpArgs;
pub use fragment::FragmentArgs;
pub use process::ProcessArgs;
pub use samples::SamplesArgs;

use anyhow::Result;
use std::ops::ControlFlow;
use std::path::Path;

fn require_file(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Input file does not exist: {:?}", path);
    }
    Ok(())
}

/// Progress listener that logs every tenth of the work.
fn log_progress(label: &'static str) -> impl FnMut(usize, usize) -> ControlFlow<()> {
    let mut last_decile = 0;
    move |step, total| {
        let decile = if total == 0 { 10 } else { step * 10 / total };
        if decile > last_decile {
            last_decile = decile;
            tracing::info!("{}: {}%", label, decile * 10);
        }
        ControlFlow::Continue(())
    }
}
