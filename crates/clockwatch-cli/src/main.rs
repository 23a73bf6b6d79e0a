use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use clockwatch_adapters::{adapter_for_category, read_report_text};
use clockwatch_core::RecordCategory;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clockwatch")]
#[command(about = "Periodically sample chrony and system clock state into capped collections")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured interval until Ctrl-C or SIGTERM.
    Run,
    /// Run a single poll cycle and print its summary.
    Once,
    /// Parse a captured report and print the typed record.
    Parse {
        /// One of `tracking`, `client`, `time`.
        category: RecordCategory,
        path: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cycles = clockwatch_sync::run_from_env().await?;
            info!(cycles, "clockwatch stopped");
        }
        Commands::Once => {
            let summary = clockwatch_sync::run_once_from_env().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("encoding poll summary")?
            );
        }
        Commands::Parse { category, path } => {
            let text = read_report_text(&path)?;
            let record = adapter_for_category(category).assemble(&text, Utc::now());
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("encoding record")?
            );
        }
    }

    Ok(())
}
