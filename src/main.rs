//! # snaplog CLI
//!
//! ## Usage
//!
//! ```bash
//! snaplog --config ./config/snaplog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snaplog head` | Print the node's current height and the default scan window |
//! | `snaplog scan` | Sample the chain at a fixed stride and write approximate changes |
//! | `snaplog refine` | Narrow every approximate change to its exact height |
//! | `snaplog run` | `scan` followed by `refine` |
//!
//! ## Examples
//!
//! ```bash
//! # Scan the last 60 days (the configured lookback) every 100 blocks
//! snaplog scan --config ./config/snaplog.toml
//!
//! # Scan a fixed window with four parallel queries
//! snaplog scan --end 4200000 --start 4000000 --concurrency 4
//!
//! # Refine, retrying failed probes twice
//! snaplog refine --policy retry:2
//! ```
//!
//! Logs go to stderr and are controlled with `RUST_LOG` or `-v`; summaries
//! go to stdout.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use snaplog::config;
use snaplog::models::Height;
use snaplog::pool::ConcurrencyLimit;
use snaplog::progress::ProgressMode;
use snaplog::refine::{self, FailurePolicy, RefineOverrides};
use snaplog::scan::{self, ScanOverrides};

/// snaplog: field-level change history from point-in-time chain snapshots.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/snaplog.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "snaplog",
    about = "Reconstruct subnet metadata change history from an archive node",
    version,
    long_about = "snaplog samples a chain's subnet registry at a fixed block stride, diffs \
    adjacent snapshots to find approximate changes, then binary-searches each stride window \
    for the exact block at which every change took effect."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/snaplog.toml")]
    config: PathBuf,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current chain height and the configured scan window.
    ///
    /// Useful for checking connectivity before a long scan.
    Head,

    /// Find approximate changes by diffing snapshots sampled every `stride` blocks.
    ///
    /// Writes the approximate table plus a `.meta.json` manifest next to it.
    Scan {
        /// Most recent height to sample. Defaults to the current head.
        #[arg(long)]
        end: Option<Height>,

        /// Oldest height of interest. Defaults to `end` minus the configured lookback.
        #[arg(long)]
        start: Option<Height>,

        /// Blocks between samples.
        #[arg(long)]
        stride: Option<u64>,

        /// Maximum concurrent snapshot queries.
        #[arg(long)]
        concurrency: Option<ConcurrencyLimit>,

        /// Approximate table to write.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Binary-search the exact height of every approximate change.
    Refine {
        /// Approximate table to read.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Exact table to write.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Stride the table was scanned with. Must match the manifest if one exists.
        #[arg(long)]
        stride: Option<u64>,

        /// Failed probe handling: `assume-old`, `assume-new`, `retry:N`, or `abort`.
        #[arg(long)]
        policy: Option<FailurePolicy>,

        /// Maximum changes refined at once.
        #[arg(long)]
        concurrency: Option<ConcurrencyLimit>,

        /// Skip the read-back at `h` and `h - 1` after each search.
        #[arg(long)]
        no_verify: bool,
    },

    /// Scan, then refine, using the configured paths.
    Run,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.reporter();

    match cli.command {
        Commands::Head => {
            scan::run_head(&cfg).await?;
        }
        Commands::Scan {
            end,
            start,
            stride,
            concurrency,
            output,
        } => {
            let overrides = ScanOverrides {
                end,
                start,
                stride,
                concurrency,
                output,
            };
            scan::run_scan(&cfg, &overrides, progress.as_ref()).await?;
        }
        Commands::Refine {
            input,
            output,
            stride,
            policy,
            concurrency,
            no_verify,
        } => {
            let overrides = RefineOverrides {
                input,
                output,
                stride,
                policy,
                concurrency,
                verify: no_verify.then_some(false),
            };
            refine::run_refine(&cfg, &overrides, progress.as_ref()).await?;
        }
        Commands::Run => {
            scan::run_scan(&cfg, &ScanOverrides::default(), progress.as_ref()).await?;
            refine::run_refine(&cfg, &RefineOverrides::default(), progress.as_ref()).await?;
        }
    }

    Ok(())
}
