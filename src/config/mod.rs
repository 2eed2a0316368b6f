mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Longest fragment duration accepted from configuration, in milliseconds.
pub const MAX_FRAGMENT_DURATION_MS: u32 = 3_600_000;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = ["./mp4frag.toml", "~/.config/mp4frag/config.toml"];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if let Some(duration) = config.fragment.fragment_duration_ms {
        if duration == 0 || duration > MAX_FRAGMENT_DURATION_MS {
            anyhow::bail!(
                "Fragment duration must be between 1 and {} ms, got {}",
                MAX_FRAGMENT_DURATION_MS,
                duration
            );
        }
    }

    if config.fragment.timescale == Some(0) {
        anyhow::bail!("Timescale cannot be 0");
    }

    if config.reader.max_buffer_bytes == 0 {
        anyhow::bail!("Reader max buffer cannot be 0");
    }

    config
        .fragment
        .to_options()
        .validate()
        .context("Invalid fragment settings")?;

    Ok(())
}
