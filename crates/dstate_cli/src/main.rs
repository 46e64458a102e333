//! Disconnected-state CLI
//!
//! Command-line tools for serialized operation logs.
//!
//! # Commands
//!
//! - `dump-log` - Print the records of a serialized log
//! - `verify-log` - Check a serialized log's framing, digest, and ordering

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tools for disconnected-state operation logs.
#[derive(Parser)]
#[command(name = "dstate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the records of a serialized log
    DumpLog {
        /// Path to the serialized log
        file: PathBuf,

        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify a serialized log
    VerifyLog {
        /// Path to the serialized log
        file: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::DumpLog {
            file,
            limit,
            format,
        } => {
            commands::dump_log::run(&file, limit, &format)?;
        }
        Commands::VerifyLog { file } => {
            commands::verify_log::run(&file)?;
        }
        Commands::Version => {
            println!("dstate CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Log format v{}", dstate_protocol::LOG_FORMAT_VERSION);
        }
    }

    Ok(())
}
