//! Shared test helpers for integration tests.

#![allow(dead_code)]

use mersenne_hunter::checkpoint::{JsonStateStore, MemoryStateStore};
use mersenne_hunter::config::{SearchConfig, SearchWindow, VerifierConfig};
use mersenne_hunter::orchestrator::Orchestrator;
use mersenne_hunter::registry::Registry;
use mersenne_hunter::store::{FileAppendLog, MemoryAppendLog};
use std::path::Path;
use std::sync::Arc;

/// Trial division, the reference for every primality shortcut.
pub fn is_prime_naive(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Unlimited-budget config over one window, with files under `dir`.
pub fn config_in(dir: &Path, start: u64, end: u64, count: usize, workers: usize) -> SearchConfig {
    SearchConfig {
        windows: vec![SearchWindow { start, end }],
        candidate_count: count,
        workers,
        timeout_secs: 0,
        batch_size: 2,
        state_path: dir.join("state.json"),
        discovery_log_path: dir.join("discoveries.jsonl"),
        ..Default::default()
    }
}

pub fn verifier_in(dir: &Path) -> VerifierConfig {
    VerifierConfig {
        enabled: true,
        worktodo_path: dir.join("worktodo.txt"),
        results_path: dir.join("results.txt"),
        ..Default::default()
    }
}

/// File-backed orchestrator replaying the search at `frontier`.
pub fn file_orchestrator(frontier: u64, config: SearchConfig) -> Orchestrator {
    let store = Arc::new(JsonStateStore::new(&config.state_path));
    let log = Arc::new(FileAppendLog::new(&config.discovery_log_path));
    Orchestrator::new(Registry::truncated_at(frontier), config, store, log)
}

/// In-memory orchestrator over an arbitrary registry.
pub fn memory_orchestrator(registry: Registry, config: SearchConfig) -> Orchestrator {
    Orchestrator::new(
        registry,
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryAppendLog::new()),
    )
}
