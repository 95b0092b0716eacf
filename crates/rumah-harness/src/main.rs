//! # Rumah Harness CLI (`rumah`)
//!
//! The `rumah` binary drives the listing ingestion pipeline and inspects
//! its store.
//!
//! ## Usage
//!
//! ```bash
//! rumah --config ./config/rumah.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rumah init` | Create the SQLite database and run schema migrations |
//! | `rumah sources` | List configured sources and their health |
//! | `rumah run <source\|all>` | Fetch, normalize, reconcile, and load listings |
//! | `rumah facilities` | Count OSM facilities for each listing district |
//! | `rumah get <id>` | Print a stored listing with history, lineage, and district facilities |
//! | `rumah stats` | Listing and raw-document counts per source |
//! | `rumah purge` | Delete raw documents past the retention window |
//!
//! ## Examples
//!
//! ```bash
//! rumah init
//! rumah run rumah123 --query dki-jakarta --query banten
//! rumah run all --since 2024-10-01 --json > summary.json
//! rumah facilities --district "Kebayoran Baru" --refresh
//! RUST_LOG=rumah_harness=debug rumah run partner
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use rumah_harness::progress::ProgressMode;
use rumah_harness::{config, facilities, get, migrate, retention, run_cmd, sources, stats};

/// Ingestion and normalization pipeline for Indonesian housing listings.
#[derive(Parser)]
#[command(name = "rumah", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rumah.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources and whether they look runnable.
    Sources,

    /// Run the pipeline for one source, or `all` concurrently.
    Run {
        /// Source name from `[sources.<name>]`, or `all`.
        source: String,

        /// Query to run (repeatable). Defaults to the source's queries.
        #[arg(long = "query")]
        queries: Vec<String>,

        /// Skip listings last updated before this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// Fetch OpenStreetMap facility counts for listing districts.
    Facilities {
        /// District to count (repeatable). Defaults to every stored district.
        #[arg(long = "district")]
        districts: Vec<String>,

        /// Refetch districts that already have counts.
        #[arg(long)]
        refresh: bool,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored listing as JSON.
    Get {
        /// Listing id.
        id: String,
    },

    /// Show database statistics.
    Stats,

    /// Delete raw documents older than the retention window.
    Purge {
        /// Override `retention.raw_document_days`.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rumah_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::print_sources(&cfg);
        }
        Commands::Run {
            source,
            queries,
            since,
            json,
            progress,
        } => {
            let mode = match progress {
                ProgressArg::Auto => ProgressMode::default_for_tty(),
                ProgressArg::Off => ProgressMode::Off,
                ProgressArg::Human => ProgressMode::Human,
                ProgressArg::Json => ProgressMode::Json,
            };
            run_cmd::run_cmd(&cfg, &source, &queries, since.as_deref(), json, mode).await?;
        }
        Commands::Facilities {
            districts,
            refresh,
            json,
        } => {
            facilities::run_facilities(&cfg, &districts, refresh, json).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Purge { older_than_days } => {
            retention::run_purge(&cfg, older_than_days).await?;
        }
    }

    Ok(())
}
