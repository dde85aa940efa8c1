//! # Error — Failure Taxonomy for the Discovery Pipeline
//!
//! | Variant | Raised by | Effect |
//! |---------|-----------|--------|
//! | `InvalidWindow`, `InvalidCount` | generator, config | rejected before any work starts |
//! | `InsufficientData` | analysis | generator falls back to plain sampling |
//! | `ExternalTool` | bridge | logged; internal testing continues unverified |
//! | `WorkerFailure` | orchestrator | isolated to one candidate; pool continues |
//! | `Persistence` | checkpoint, discovery log | fatal for the session |
//! | `Config` | config | rejected at load time |
//!
//! A Lucas–Lehmer run that exceeds its budget is not an error: it is the
//! `Verdict::Timeout` outcome of the tester.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("malformed search window [{start}, {end}): start must be below end")]
    InvalidWindow { start: u64, end: u64 },

    #[error("candidate count must be positive")]
    InvalidCount,

    #[error("pattern analysis needs at least {need} known exponents, registry has {have}")]
    InsufficientData { have: usize, need: usize },

    #[error("external verifier: {context} ({path}): {source}")]
    ExternalTool {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {worker} failed on p={exponent}: {message}")]
    WorkerFailure {
        worker: usize,
        exponent: u64,
        message: String,
    },

    #[error("could not persist search state: {0:#}")]
    Persistence(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SearchError {
    /// Validation failures are raised before any candidate is generated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SearchError::InvalidWindow { .. } | SearchError::InvalidCount | SearchError::Config(_)
        )
    }

    pub(crate) fn external(
        context: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        SearchError::ExternalTool {
            context,
            path: path.into(),
            source,
        }
    }
}
