use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{ConfigCommand, NoteCommand, SyncCommand};
use config::Config;

#[derive(Parser)]
#[command(name = "scrawl")]
#[command(version)]
#[command(about = "Offline-first markdown notes with remote sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, list and edit notes
    Note(NoteCommand),

    /// Sync with the remote store
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    // Logs go to stderr so command output stays scriptable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config)?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match &cli.command {
        Some(Commands::Note(cmd)) => cmd.run(&config)?,
        Some(Commands::Sync(cmd)) => cmd.run(&config)?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => println!("Use --help to see available commands"),
    }
    Ok(())
}
