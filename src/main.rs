mod cli;

use mp4frag::{commands, config};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mp4frag=trace,mp4frag_media=trace".to_string()
        } else {
            "mp4frag=info,mp4frag_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mp4frag {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = config::load_config_or_default(cli.config.as_deref())?;
            match command {
                Commands::Fragment(args) => commands::fragment::run(&args, &config.fragment),
                Commands::Process(args) => commands::process::run(&args),
                Commands::Encrypt(args) => commands::crypt::encrypt(&args, &config.processor),
                Commands::Decrypt(args) => commands::crypt::decrypt(&args, &config.processor),
                Commands::Dump(args) => commands::dump::run(&args),
                Commands::Samples(args) => commands::samples::run(&args, config.reader.max_buffer_bytes),
                Commands::Validate { .. } | Commands::Version => Ok(()),
            }
        }
    }
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            match config.fragment.fragment_duration_ms {
                Some(ms) => println!("  Fragment duration: {} ms", ms),
                None => println!("  Fragment duration: auto"),
            }
            println!("  Segment index: {}", config.fragment.create_segment_index);
            println!("  Force I-frame sync: {:?}", config.fragment.force_i_frame_sync);
            println!("  Cipher mode: {}", config.processor.cipher_mode);
            println!("  Reader buffer: {} bytes", config.reader.max_buffer_bytes);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Fragment duration: auto");
            println!("  Cipher mode: {}", config.processor.cipher_mode);
        }
    }

    Ok(())
}
