//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand: session runs, analysis, single
//! tests, verifier hand-off, status, and rayon configuration. Results go to
//! stdout as JSON; logs go to stderr.

use anyhow::{bail, Context, Result};
use mersenne_hunter::{
    analysis,
    bridge::{VerificationBridge, WorkMode},
    checkpoint::{JsonStateStore, StateStore},
    config::{SearchConfig, SearchWindow},
    discovery::{DiscoveryLog, TestResult},
    filter::FastFilter,
    generator::CandidateGenerator,
    lucas_lehmer::{LlProgress, LucasLehmer},
    orchestrator::Orchestrator,
    registry::Registry,
    store::FileAppendLog,
};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Command-line values that replace config fields for one run.
pub struct SearchOverrides {
    pub window: Option<(u64, u64)>,
    pub count: Option<usize>,
    pub workers: Option<usize>,
    pub timeout_secs: Option<u64>,
}

pub fn load_config(path: Option<&Path>) -> Result<SearchConfig> {
    match path {
        Some(p) => SearchConfig::load(p),
        None => Ok(SearchConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A stop flag that fires after `secs`, if given.
fn stop_after(secs: Option<u64>) -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    if let Some(secs) = secs {
        let flag = Arc::clone(&stop);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            info!(secs, "run-time limit reached, requesting stop");
            flag.store(true, Ordering::Relaxed);
        });
    }
    stop
}

fn registry_at(frontier: Option<u64>) -> Registry {
    frontier.map_or_else(Registry::known, Registry::truncated_at)
}

// ── Search ──────────────────────────────────────────────────────

pub fn run_search(
    mut config: SearchConfig,
    overrides: SearchOverrides,
    max_runtime_secs: Option<u64>,
) -> Result<()> {
    if let Some((start, end)) = overrides.window {
        config.windows = vec![SearchWindow { start, end }];
    }
    if let Some(count) = overrides.count {
        config.candidate_count = count;
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(secs) = overrides.timeout_secs {
        config.timeout_secs = secs;
    }

    let stop = stop_after(max_runtime_secs);
    let mut orchestrator = Orchestrator::from_config(Registry::known(), config)?;
    let summary = orchestrator.run(stop.as_ref())?;
    for p in &summary.primes {
        info!(exponent = p, "new Mersenne prime candidate recorded");
    }
    print_json(&summary)
}

// ── Analysis ────────────────────────────────────────────────────

pub fn run_analyze(frontier: Option<u64>, predict: usize) -> Result<()> {
    let registry = registry_at(frontier);
    let stats = analysis::analyze(&registry)?;
    let top = registry.frontier();
    print_json(&json!({
        "stats": stats,
        "predictions": stats.predictions(predict),
        "expected_primes_up_to_double_frontier": analysis::expected_mersenne_primes(top, top.saturating_mul(2)),
        "digits_at_frontier": mersenne_hunter::mersenne_digits(top),
    }))
}

pub fn run_candidates(
    config: &SearchConfig,
    start: u64,
    end: u64,
    count: usize,
    frontier: Option<u64>,
) -> Result<()> {
    let registry = registry_at(frontier);
    let generator = CandidateGenerator::new(&registry).with_seed(config.seed);
    let set = generator.generate(start, end, count)?;
    let report = FastFilter::new(&registry)
        .with_trial_factoring(config.trial_factor_bits)
        .filter_set(&set);
    print_json(&json!({
        "generated": set.len(),
        "quality": set.quality(generator.stats()),
        "admitted": report.admitted,
        "rejected": report.rejected,
    }))
}

// ── Single Test ─────────────────────────────────────────────────

pub fn run_test(exponent: u64, timeout_secs: u64, max_runtime_secs: Option<u64>) -> Result<()> {
    let budget = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
    let stop = stop_after(max_runtime_secs);
    let tester = LucasLehmer::new(budget).with_progress_step(0.1);
    let outcome = tester.run(exponent, stop.as_ref(), &mut |p: LlProgress| {
        debug!(
            exponent = p.exponent,
            iteration = p.iteration,
            pct = format_args!("{:.0}", p.fraction * 100.0),
            "LL progress"
        );
    });
    info!(exponent, verdict = %outcome.verdict, "test finished");
    let mut value = serde_json::to_value(TestResult::from(&outcome))?;
    if let Some(hex) = outcome.res64_hex() {
        value["res64"] = json!(hex);
    }
    print_json(&value)
}

// ── Verifier ────────────────────────────────────────────────────

pub fn run_submit(config: &SearchConfig, exponents: &[u64], mode: Option<&str>) -> Result<()> {
    let bridge = VerificationBridge::from_config(&config.verifier)?;
    let mode = match mode {
        Some(m) => m.parse::<WorkMode>()?,
        None => bridge.mode(),
    };
    let items = bridge.submit(exponents, mode)?;
    if items.len() < exponents.len() {
        warn!(
            skipped = exponents.len() - items.len(),
            "some exponents were already assigned"
        );
    }
    for item in &items {
        println!("{}", item);
    }
    Ok(())
}

pub fn run_confirm(mut config: SearchConfig) -> Result<()> {
    if !config.verifier.enabled {
        bail!("verifier is not enabled in the config ([verifier] enabled = true)");
    }
    config.verifier.auto_launch = false;
    let mut orchestrator = Orchestrator::from_config(Registry::known(), config)?;
    let batch = orchestrator.sync_confirmations()?;
    print_json(&batch)
}

// ── Status ──────────────────────────────────────────────────────

pub fn run_status(config: &SearchConfig) -> Result<()> {
    let state = JsonStateStore::new(&config.state_path)
        .load()
        .with_context(|| format!("loading state from {}", config.state_path.display()))?;
    let log = DiscoveryLog::new(Arc::new(FileAppendLog::new(&config.discovery_log_path)));
    let discoveries: Vec<_> = log
        .latest()?
        .into_values()
        .map(|d| json!({ "status": d.status(), "discovery": d }))
        .collect();
    print_json(&json!({
        "state": state,
        "discoveries": discoveries,
    }))
}

// ── Rayon Configuration ─────────────────────────────────────────

/// Size the rayon global pool used by the admissibility filter.
pub fn configure_rayon(threads: Option<usize>) {
    let Some(num_threads) = threads else {
        return;
    };
    match rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
    {
        Ok(()) => info!(threads = num_threads, "rayon thread pool configured"),
        Err(e) => warn!(error = %e, "could not configure rayon thread pool"),
    }
}
