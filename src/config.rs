//! Search configuration, as handed over by an external loader.
//!
//! Every field has a default so a partial TOML file is enough:
//!
//! ```toml
//! candidate_count = 50
//! workers = 8
//! timeout_secs = 600
//!
//! [[windows]]
//! start = 136279842
//! end = 140000000
//!
//! [verifier]
//! enabled = true
//! worktodo_path = "/opt/mprime/worktodo.txt"
//! results_path = "/opt/mprime/results.txt"
//! mode = "prp"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{WorkMode, DEFAULT_FACTOR_BITS};
use crate::error::SearchError;
use crate::filter::MAX_TRIAL_FACTOR_BITS;
use crate::registry::KNOWN_EXPONENTS;

/// How an internal PRIME verdict is counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryPolicy {
    /// Count it at once; external confirmation only upgrades the log entry.
    #[default]
    Immediate,
    /// Log it as pending; count it when the verifier confirms.
    AwaitExternal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub enabled: bool,
    pub worktodo_path: PathBuf,
    pub results_path: PathBuf,
    pub mode: WorkMode,
    pub factor_bits: u32,
    pub binary: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub auto_launch: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            enabled: false,
            worktodo_path: PathBuf::from("worktodo.txt"),
            results_path: PathBuf::from("results.txt"),
            mode: WorkMode::Ll,
            factor_bits: DEFAULT_FACTOR_BITS,
            binary: None,
            working_dir: None,
            auto_launch: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub windows: Vec<SearchWindow>,
    pub candidate_count: usize,
    pub workers: usize,
    /// Per-candidate Lucas–Lehmer budget; 0 means unlimited.
    pub timeout_secs: u64,
    /// Results between state saves.
    pub batch_size: usize,
    pub progress_interval_secs: u64,
    pub seed: u64,
    pub policy: DiscoveryPolicy,
    pub retry_timeouts: bool,
    /// Trial-factoring depth for 2^p − 1 in the filter; 0 disables.
    pub trial_factor_bits: u32,
    pub state_path: PathBuf,
    pub discovery_log_path: PathBuf,
    pub verifier: VerifierConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let frontier = KNOWN_EXPONENTS[KNOWN_EXPONENTS.len() - 1];
        SearchConfig {
            windows: vec![SearchWindow {
                start: frontier + 1,
                end: 140_000_000,
            }],
            candidate_count: 100,
            workers: 4,
            timeout_secs: 3600,
            batch_size: 10,
            progress_interval_secs: 30,
            seed: crate::generator::DEFAULT_SEED,
            policy: DiscoveryPolicy::Immediate,
            retry_timeouts: true,
            trial_factor_bits: 0,
            state_path: PathBuf::from("mersenne_state.json"),
            discovery_log_path: PathBuf::from("discoveries.jsonl"),
            verifier: VerifierConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SearchConfig = toml::from_str(content).context("parsing search config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject malformed windows and zero sizes before any work starts.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.windows.is_empty() {
            return Err(SearchError::Config("at least one search window is required".into()));
        }
        for w in &self.windows {
            if w.start >= w.end {
                return Err(SearchError::InvalidWindow {
                    start: w.start,
                    end: w.end,
                });
            }
        }
        if self.candidate_count == 0 {
            return Err(SearchError::InvalidCount);
        }
        if self.workers == 0 {
            return Err(SearchError::Config("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(SearchError::Config("batch_size must be at least 1".into()));
        }
        if self.trial_factor_bits > MAX_TRIAL_FACTOR_BITS {
            return Err(SearchError::Config(format!(
                "trial_factor_bits {} exceeds {}",
                self.trial_factor_bits, MAX_TRIAL_FACTOR_BITS
            )));
        }
        if self.verifier.auto_launch && self.verifier.binary.is_none() {
            return Err(SearchError::Config(
                "verifier.auto_launch requires verifier.binary".into(),
            ));
        }
        Ok(())
    }

    pub fn budget(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}
