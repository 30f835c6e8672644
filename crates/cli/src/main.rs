//! Conclave CLI — the main entry point.
//!
//! Commands:
//! - `init`     — Write a starter config
//! - `sessions` — List the panels defined in the config
//! - `chat`     — Run a panel interactively

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "conclave",
    about = "Conclave — multi-agent conversation panels",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Where to write it (defaults to ~/.conclave/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List configured sessions
    Sessions,

    /// Chat with a panel of participants
    Chat {
        /// Which configured session to open (defaults to the first)
        #[arg(short, long)]
        session: Option<String>,

        /// Append every turn and tool call to this JSONL file
        #[arg(short, long)]
        transcript: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { path, force } => commands::init::run(path, force).await?,
        Commands::Sessions => commands::sessions::run().await?,
        Commands::Chat {
            session,
            transcript,
        } => commands::chat::run(session, transcript).await?,
    }

    Ok(())
}
