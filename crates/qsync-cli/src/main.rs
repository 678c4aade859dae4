use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "qsync")]
#[command(about = "QUIK bridge adapter operator CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> local)
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge + validate layered config, print hash and canonical JSON
    ConfigCheck {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail on keys no option consumes (default: warn)
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// One-shot backfill of a single series
    History {
        /// CLASS.SEC or a bare ticker
        #[arg(long)]
        ticker: String,

        /// Timeframe (M1, M5, H1, D1, ...)
        #[arg(long, default_value = "M1")]
        tf: String,

        /// Bars to fetch (default: `count` from config)
        #[arg(long)]
        count: Option<usize>,

        /// Write cache CSV here instead of stdout
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Stream bars and feed statuses to the log until Ctrl-C
    Watch {
        #[arg(long)]
        ticker: String,

        #[arg(long, default_value = "M1")]
        tf: String,
    },

    /// Print cash, equity, positions and live orders
    Account,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev-time convenience; a missing file is fine.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigCheck { paths, strict } => commands::config::config_check(&paths, strict)?,

        Commands::History {
            ticker,
            tf,
            count,
            csv,
        } => commands::market::history(&cli.config_paths, &ticker, &tf, count, csv).await?,

        Commands::Watch { ticker, tf } => {
            commands::market::watch(&cli.config_paths, &ticker, &tf).await?
        }

        Commands::Account => commands::account::account(&cli.config_paths).await?,
    }

    Ok(())
}
