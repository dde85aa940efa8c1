//! # Main — CLI Entry Point
//!
//! Routes CLI subcommands to the library. Handles shared concerns: config
//! loading, logging setup, the Rayon thread pool, and the run-time limit.
//!
//! ## Subcommands
//!
//! - `search`: one discovery session over the configured windows.
//! - `analyze`: pattern statistics and next-exponent predictions.
//! - `candidates`: generate and filter one window without testing.
//! - `test`: Lucas–Lehmer test of a single exponent.
//! - `submit`: append exponents to the external verifier's work file.
//! - `confirm`: fold new verifier results into the discovery log.
//! - `status`: saved search state and discovery log.
//!
//! ## Global Options
//!
//! - `--config` / `MERSENNE_CONFIG`: TOML search config (defaults otherwise).
//! - `--threads`: Rayon thread pool size (defaults to all logical cores).
//! - `--max-runtime-secs`: request a graceful stop after this long.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mersenne-hunter", about = "Search for new Mersenne prime exponents")]
struct Cli {
    /// Search config file (TOML). Built-in defaults are used when absent.
    #[arg(long, env = "MERSENNE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of rayon worker threads (defaults to all logical cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Request a graceful stop after this many seconds
    #[arg(long)]
    max_runtime_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one discovery session
    Search {
        /// Override the search window start (inclusive)
        #[arg(long, requires = "end")]
        start: Option<u64>,
        /// Override the search window end (exclusive)
        #[arg(long, requires = "start")]
        end: Option<u64>,
        /// Candidates to generate per window
        #[arg(long)]
        count: Option<usize>,
        /// Tester threads
        #[arg(long)]
        workers: Option<usize>,
        /// Per-candidate budget in seconds (0 = unlimited)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show pattern statistics of the known exponents
    Analyze {
        /// Only use exponents up to this frontier
        #[arg(long)]
        frontier: Option<u64>,
        /// Number of next-exponent predictions
        #[arg(long, default_value_t = 5)]
        predict: usize,
    },
    /// Generate and filter candidates for one window without testing
    Candidates {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        #[arg(long, default_value_t = 20)]
        count: usize,
        /// Only use exponents up to this frontier
        #[arg(long)]
        frontier: Option<u64>,
    },
    /// Lucas–Lehmer test of one exponent
    Test {
        exponent: u64,
        /// Budget in seconds (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,
    },
    /// Append exponents to the verifier work file
    Submit {
        #[arg(required = true)]
        exponents: Vec<u64>,
        /// ll, prp or tf (defaults to the configured mode)
        #[arg(long)]
        mode: Option<String>,
    },
    /// Read new verifier results and update the discovery log
    Confirm,
    /// Show saved state and discoveries
    Status,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    cli::configure_rayon(cli.threads);
    let config = cli::load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Search {
            start,
            end,
            count,
            workers,
            timeout_secs,
        } => {
            let overrides = cli::SearchOverrides {
                window: start.zip(*end),
                count: *count,
                workers: *workers,
                timeout_secs: *timeout_secs,
            };
            cli::run_search(config, overrides, cli.max_runtime_secs)
        }
        Commands::Analyze { frontier, predict } => cli::run_analyze(*frontier, *predict),
        Commands::Candidates {
            start,
            end,
            count,
            frontier,
        } => cli::run_candidates(&config, *start, *end, *count, *frontier),
        Commands::Test {
            exponent,
            timeout_secs,
        } => cli::run_test(*exponent, *timeout_secs, cli.max_runtime_secs),
        Commands::Submit { exponents, mode } => cli::run_submit(&config, exponents, mode.as_deref()),
        Commands::Confirm => cli::run_confirm(config),
        Commands::Status => cli::run_status(&config),
    }
}
