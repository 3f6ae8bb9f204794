//! Poisonlab CLI: drive the dataset poisoning exercise from a terminal.
//!
//! Session state lives in memory for the lifetime of one invocation; the
//! per-session dataset files persist under the configured datasets directory.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Poisonlab: dataset poisoning exercise engine
#[derive(Parser, Debug)]
#[command(name = "poisonlab", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Upload CSV files into a session dataset, in order
    Upload {
        /// Session identifier
        #[arg(short, long)]
        session: String,
        /// CSV files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Score every new row with this constant instead of calling the model
        #[arg(long, value_name = "SCORE")]
        dry_oracle: Option<f64>,
    },
    /// Restore a session dataset to the default baseline
    Reset {
        #[arg(short, long)]
        session: String,
    },
    /// Print a session dataset
    Show {
        #[arg(short, long)]
        session: String,
    },
    /// Ask the chat model a question about a session dataset
    Ask {
        #[arg(short, long)]
        session: String,
        /// Question about the dataset
        question: String,
    },
    /// Submit a flag
    Submit {
        #[arg(short, long)]
        session: String,
        /// Candidate flag
        flag: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for the audit trail
    let log_dir = directories::ProjectDirs::from("dev", "poisonlab", "poisonlab")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "poisonlab.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
