//! simian-recorder - record screen clips from the command line
//!
//! Subcommands:
//! - `simian-recorder record` - Record until Ctrl-C or `--seconds` elapse
//! - `simian-recorder displays` - List capturable displays
//! - `simian-recorder config` - Print the resolved configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simian_recorder::capture;
use simian_recorder::commands::{recording, RecorderState};
use simian_recorder::config::RecorderConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simian-recorder")]
#[command(about = "Screen clip recorder for the Simian assistant")]
#[command(version)]
struct Cli {
    /// JSON config file (defaults apply when it does not exist)
    #[arg(short, long, global = true, env = "SIMIAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a clip
    Record {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// List displays as JSON
    Displays,

    /// Print the resolved configuration as JSON
    Config,
}

async fn record(state: RecorderState, seconds: Option<u64>) -> Result<()> {
    let path = recording::start_recording(&state)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.message))?;
    eprintln!("Recording to {}", path.display());

    match seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            eprintln!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    let clip = recording::stop_recording(&state)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.message))?;

    match clip {
        Some(clip) => println!("{}", serde_json::to_string_pretty(&clip)?),
        None => anyhow::bail!("Recording ended before it could be stopped"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    simian_recorder::init_tracing();

    match cli.command {
        Commands::Record { seconds } => {
            let state = RecorderState::load(cli.config.as_deref())?;
            record(state, seconds).await?;
        }
        Commands::Displays => {
            let displays = capture::get_displays();
            println!("{}", serde_json::to_string_pretty(&displays)?);
        }
        Commands::Config => {
            let config = RecorderConfig::load(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
