//! # Bridge — External Verification Tool Integration
//!
//! An independent verifier (Prime95/mprime or a compatible client) runs
//! beside the search. The bridge talks to it through two plain-text files:
//!
//! - **Work file** (`worktodo.txt`): one assignment per line, appended by
//!   [`VerificationBridge::submit`]. Exponents already present in any mode
//!   are not appended again, and the file is copied to
//!   `<path>.<YYYYmmdd-HHMMSS>.bak` before every append.
//! - **Result log** (`results.txt`): written by the verifier, read
//!   incrementally from a persisted byte offset by [`parse_confirmations`].
//!   Only complete lines are consumed; a trailing partial line is left for
//!   the next call.
//!
//! ## Work-File Formats
//!
//! | Mode | Line |
//! |------|------|
//! | Lucas–Lehmer | `Test=p` |
//! | Probable prime | `PRP=1,2,p,-1` |
//! | Trial factor | `Factor=p,0,bits` |
//!
//! Lines carrying an assignment id (`Test=AID,p,...`, `PRP=AID,1,2,p,-1`)
//! are recognised for deduplication.
//!
//! ## Result Phrases
//!
//! `M( p ) is prime!` or `M p is prime` confirms; `M( p ) is not prime`
//! refutes. Matching is case-insensitive.
//!
//! All I/O failures surface as `SearchError::ExternalTool`; callers degrade
//! to internal-only results instead of stopping.

use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::VerifierConfig;
use crate::error::SearchError;
use crate::store::{AppendLog, FileAppendLog};

/// Default trial-factoring target for `Factor=` lines.
pub const DEFAULT_FACTOR_BITS: u32 = 72;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkMode {
    #[serde(alias = "LL")]
    Ll,
    #[serde(alias = "PRP")]
    Prp,
    #[serde(alias = "tf", alias = "TF")]
    TrialFactor,
}

impl FromStr for WorkMode {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ll" | "test" => Ok(WorkMode::Ll),
            "prp" => Ok(WorkMode::Prp),
            "tf" | "trial-factor" | "factor" => Ok(WorkMode::TrialFactor),
            other => Err(SearchError::Config(format!("unknown verifier mode '{}'", other))),
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkMode::Ll => write!(f, "ll"),
            WorkMode::Prp => write!(f, "prp"),
            WorkMode::TrialFactor => write!(f, "trial-factor"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub exponent: u64,
    pub mode: WorkMode,
    pub factor_bits: u32,
}

impl WorkItem {
    pub fn new(exponent: u64, mode: WorkMode) -> Self {
        WorkItem {
            exponent,
            mode,
            factor_bits: DEFAULT_FACTOR_BITS,
        }
    }

    /// Parse a work-file line. Comments, blanks and unknown keys yield None.
    pub fn parse(line: &str) -> Option<WorkItem> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('[') {
            return None;
        }
        let (key, rest) = line.split_once('=')?;
        let mut fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        // Optional assignment id ("N/A" or a 32-hex key)
        if fields.first().is_some_and(|f| f.parse::<u64>().is_err()) {
            fields.remove(0);
        }
        let num = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok());

        match key.trim().to_ascii_lowercase().as_str() {
            "test" | "doublecheck" => Some(WorkItem::new(num(0)?, WorkMode::Ll)),
            "prp" | "prpdc" => {
                // k,b,n,c
                if fields.len() >= 4 {
                    Some(WorkItem::new(num(2)?, WorkMode::Prp))
                } else {
                    Some(WorkItem::new(num(0)?, WorkMode::Prp))
                }
            }
            "factor" | "pfactor" => {
                let mut item = WorkItem::new(num(0)?, WorkMode::TrialFactor);
                if let Some(bits) = num(2) {
                    item.factor_bits = bits as u32;
                }
                Some(item)
            }
            _ => None,
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            WorkMode::Ll => write!(f, "Test={}", self.exponent),
            WorkMode::Prp => write!(f, "PRP=1,2,{},-1", self.exponent),
            WorkMode::TrialFactor => write!(f, "Factor={},0,{}", self.exponent, self.factor_bits),
        }
    }
}

/// Exponents found in result-log bytes consumed by one parse.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmationBatch {
    pub confirmed: Vec<u64>,
    pub refuted: Vec<u64>,
    pub new_offset: u64,
}

impl ConfirmationBatch {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.refuted.is_empty()
    }
}

struct ResultPatterns {
    prime: Regex,
    not_prime: Regex,
}

impl ResultPatterns {
    fn compile() -> Result<Self, SearchError> {
        let build = |re: &str| Regex::new(re).map_err(|e| SearchError::Config(e.to_string()));
        Ok(ResultPatterns {
            prime: build(r"(?i)\bM\(?\s*(\d+)\s*\)?\s+is\s+prime\b")?,
            not_prime: build(r"(?i)\bM\(?\s*(\d+)\s*\)?\s+is\s+not\s+prime\b")?,
        })
    }

    fn scan(&self, text: &str, batch: &mut ConfirmationBatch) {
        for line in text.lines() {
            if let Some(p) = capture_exponent(&self.not_prime, line) {
                if !batch.refuted.contains(&p) {
                    batch.refuted.push(p);
                }
            } else if let Some(p) = capture_exponent(&self.prime, line) {
                if !batch.confirmed.contains(&p) {
                    batch.confirmed.push(p);
                }
            }
        }
    }
}

fn capture_exponent(re: &Regex, line: &str) -> Option<u64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Read the result log at `log_path` from `since` and collect verdicts.
pub fn parse_confirmations(log_path: &Path, since: u64) -> Result<ConfirmationBatch, SearchError> {
    parse_confirmations_from(&FileAppendLog::new(log_path), since)
        .map_err(|e| relabel(e, log_path))
}

/// Like [`parse_confirmations`], over any append log.
pub fn parse_confirmations_from(
    log: &dyn AppendLog,
    since: u64,
) -> Result<ConfirmationBatch, SearchError> {
    let patterns = ResultPatterns::compile()?;
    scan_log(&patterns, log, since)
}

fn scan_log(
    patterns: &ResultPatterns,
    log: &dyn AppendLog,
    since: u64,
) -> Result<ConfirmationBatch, SearchError> {
    let (bytes, _) = log.read_since(since).map_err(|e| {
        SearchError::external(
            "read result log",
            PathBuf::new(),
            std::io::Error::other(format!("{:#}", e)),
        )
    })?;

    let consumed = match bytes.iter().rposition(|&b| b == b'\n') {
        Some(i) => i + 1,
        None => 0,
    };
    let mut batch = ConfirmationBatch {
        new_offset: since + consumed as u64,
        ..Default::default()
    };
    patterns.scan(&String::from_utf8_lossy(&bytes[..consumed]), &mut batch);
    Ok(batch)
}

fn relabel(err: SearchError, path: &Path) -> SearchError {
    match err {
        SearchError::ExternalTool { context, source, .. } => SearchError::external(context, path, source),
        other => other,
    }
}

/// Work-file writer, result-log reader and optional verifier launcher.
pub struct VerificationBridge {
    worktodo: PathBuf,
    results_path: PathBuf,
    results: Box<dyn AppendLog>,
    mode: WorkMode,
    factor_bits: u32,
    binary: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    auto_launch: bool,
    patterns: ResultPatterns,
}

impl VerificationBridge {
    pub fn from_config(config: &VerifierConfig) -> Result<Self, SearchError> {
        Ok(VerificationBridge {
            worktodo: config.worktodo_path.clone(),
            results_path: config.results_path.clone(),
            results: Box::new(FileAppendLog::new(&config.results_path)),
            mode: config.mode,
            factor_bits: config.factor_bits,
            binary: config.binary.clone(),
            working_dir: config.working_dir.clone(),
            auto_launch: config.auto_launch,
            patterns: ResultPatterns::compile()?,
        })
    }

    /// Read results from another backend (tests, remote mirrors).
    pub fn with_result_log(mut self, log: Box<dyn AppendLog>) -> Self {
        self.results = log;
        self
    }

    pub fn mode(&self) -> WorkMode {
        self.mode
    }

    pub fn worktodo_path(&self) -> &Path {
        &self.worktodo
    }

    /// Exponents already assigned in the work file, any mode.
    pub fn pending_assignments(&self) -> Result<BTreeSet<u64>, SearchError> {
        match fs::read_to_string(&self.worktodo) {
            Ok(text) => Ok(text.lines().filter_map(WorkItem::parse).map(|w| w.exponent).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(SearchError::external("read work file", &self.worktodo, e)),
        }
    }

    /// Append one assignment per new exponent. Returns the items written.
    pub fn submit(&self, exponents: &[u64], mode: WorkMode) -> Result<Vec<WorkItem>, SearchError> {
        let mut seen = self.pending_assignments()?;
        let items: Vec<WorkItem> = exponents
            .iter()
            .filter(|&&p| seen.insert(p))
            .map(|&p| WorkItem {
                exponent: p,
                mode,
                factor_bits: self.factor_bits,
            })
            .collect();
        if items.is_empty() {
            return Ok(items);
        }

        if self.worktodo.exists() {
            let backup = backup_path(&self.worktodo);
            fs::copy(&self.worktodo, &backup)
                .map_err(|e| SearchError::external("back up work file", &backup, e))?;
        } else if let Some(dir) = self.worktodo.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| SearchError::external("create work-file directory", dir, e))?;
        }

        let mut text = String::new();
        for item in &items {
            text.push_str(&item.to_string());
            text.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.worktodo)
            .map_err(|e| SearchError::external("open work file", &self.worktodo, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| SearchError::external("append work file", &self.worktodo, e))?;

        info!(
            count = items.len(),
            %mode,
            path = %self.worktodo.display(),
            "submitted exponents to external verifier"
        );
        Ok(items)
    }

    /// Submit in the configured mode.
    pub fn submit_default(&self, exponents: &[u64]) -> Result<Vec<WorkItem>, SearchError> {
        self.submit(exponents, self.mode)
    }

    pub fn parse_confirmations(&self, since: u64) -> Result<ConfirmationBatch, SearchError> {
        scan_log(&self.patterns, self.results.as_ref(), since)
            .map_err(|e| relabel(e, &self.results_path))
    }

    /// Start the verifier if auto-launch is on. Ok(None) when disabled.
    pub fn launch_if_configured(&self) -> Result<Option<VerifierProcess>, SearchError> {
        if !self.auto_launch {
            return Ok(None);
        }
        let Some(binary) = &self.binary else {
            warn!("verifier auto-launch enabled but no binary configured");
            return Ok(None);
        };
        launch_verifier(binary, self.working_dir.as_deref()).map(Some)
    }
}

/// Spawn the verifier detached from our stdio, in `working_dir` if given.
pub fn launch_verifier(binary: &Path, working_dir: Option<&Path>) -> Result<VerifierProcess, SearchError> {
    let mut cmd = Command::new(binary);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|e| SearchError::external("launch verifier", binary, e))?;
    info!(pid = child.id(), binary = %binary.display(), "external verifier launched");
    Ok(VerifierProcess {
        child: Some(child),
        binary: binary.to_path_buf(),
    })
}

/// A verifier we launched. Always reaped: by [`VerifierProcess::shutdown`]
/// or, failing that, on drop.
#[derive(Debug)]
pub struct VerifierProcess {
    child: Option<Child>,
    binary: PathBuf,
}

impl VerifierProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Exit status if the verifier has already exited, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, SearchError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        child
            .try_wait()
            .map_err(|e| SearchError::external("poll verifier", &self.binary, e))
    }

    /// Reap the verifier, killing it first if it is still running.
    pub fn shutdown(mut self) -> Result<ExitStatus, SearchError> {
        self.reap()
    }

    fn reap(&mut self) -> Result<ExitStatus, SearchError> {
        let Some(mut child) = self.child.take() else {
            return Err(SearchError::external(
                "reap verifier",
                &self.binary,
                std::io::Error::new(std::io::ErrorKind::NotFound, "already reaped"),
            ));
        };
        let pid = child.id();
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => {
                info!(pid, "stopping external verifier");
                let _ = child.kill();
                child
                    .wait()
                    .map_err(|e| SearchError::external("wait for verifier", &self.binary, e))?
            }
            Err(e) => return Err(SearchError::external("poll verifier", &self.binary, e)),
        };
        if status.success() {
            info!(pid, %status, "external verifier exited");
        } else {
            warn!(pid, %status, binary = %self.binary.display(), "external verifier exited abnormally");
        }
        Ok(status)
    }
}

impl Drop for VerifierProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            let _ = self.reap();
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(format!(".{}.bak", Local::now().format("%Y%m%d-%H%M%S")));
    PathBuf::from(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAppendLog;

    fn bridge_in(dir: &Path) -> VerificationBridge {
        let config = VerifierConfig {
            enabled: true,
            worktodo_path: dir.join("worktodo.txt"),
            results_path: dir.join("results.txt"),
            ..Default::default()
        };
        VerificationBridge::from_config(&config).unwrap()
    }

    #[test]
    fn work_item_formats_by_mode() {
        assert_eq!(WorkItem::new(21701, WorkMode::Ll).to_string(), "Test=21701");
        assert_eq!(WorkItem::new(21701, WorkMode::Prp).to_string(), "PRP=1,2,21701,-1");
        assert_eq!(
            WorkItem::new(21701, WorkMode::TrialFactor).to_string(),
            "Factor=21701,0,72"
        );
    }

    #[test]
    fn work_item_parses_own_and_assigned_lines() {
        for mode in [WorkMode::Ll, WorkMode::Prp, WorkMode::TrialFactor] {
            let item = WorkItem::new(86243, mode);
            assert_eq!(WorkItem::parse(&item.to_string()), Some(item));
        }
        let aid = WorkItem::parse("Test=0123456789ABCDEF0123456789ABCDEF,110503,74,1").unwrap();
        assert_eq!((aid.exponent, aid.mode), (110503, WorkMode::Ll));
        let prp = WorkItem::parse("PRP=N/A,1,2,132049,-1").unwrap();
        assert_eq!((prp.exponent, prp.mode), (132049, WorkMode::Prp));
        assert_eq!(WorkItem::parse("; comment"), None);
        assert_eq!(WorkItem::parse("[Worker #1]"), None);
        assert_eq!(WorkItem::parse("ECM2=1,2,5,-1"), None);
    }

    #[test]
    fn mode_from_str() {
        assert_eq!("LL".parse::<WorkMode>().unwrap(), WorkMode::Ll);
        assert_eq!("prp".parse::<WorkMode>().unwrap(), WorkMode::Prp);
        assert_eq!("tf".parse::<WorkMode>().unwrap(), WorkMode::TrialFactor);
        assert!("ecm".parse::<WorkMode>().is_err());
    }

    #[test]
    fn submit_dedupes_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge_in(dir.path());

        let first = bridge.submit(&[21701, 23209, 21701], WorkMode::Ll).unwrap();
        assert_eq!(first.len(), 2);
        // no backup for a fresh file
        let backups = |d: &Path| {
            fs::read_dir(d)
                .unwrap()
                .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".bak"))
                .count()
        };
        assert_eq!(backups(dir.path()), 0);

        let second = bridge.submit(&[23209, 44497], WorkMode::Prp).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].exponent, 44497);
        assert_eq!(backups(dir.path()), 1);

        let text = fs::read_to_string(dir.path().join("worktodo.txt")).unwrap();
        assert_eq!(text, "Test=21701\nTest=23209\nPRP=1,2,44497,-1\n");

        // nothing new: no append, no backup
        assert!(bridge.submit(&[21701], WorkMode::Ll).unwrap().is_empty());
        assert_eq!(backups(dir.path()), 1);
    }

    #[test]
    fn backup_name_is_timestamped() {
        let p = backup_path(Path::new("/tmp/worktodo.txt"));
        let name = p.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("worktodo.txt."), "{name}");
        assert!(name.ends_with(".bak"), "{name}");
        // worktodo.txt. + YYYYmmdd-HHMMSS + .bak
        assert_eq!(name.len(), "worktodo.txt.".len() + 15 + 4);
    }

    #[test]
    fn parse_confirmations_matches_phrases() {
        let log = MemoryAppendLog::new();
        log.append(
            b"[Mon Oct 12 08:00:00 2024]\n\
              M( 21701 ) is prime! Wh8: 00000000,00000000\n\
              M23209 is prime!\n\
              M( 19991 ) is not prime. RES64: 1A2B3C4D5E6F7081\n\
              m(44497) IS PRIME\n\
              M( 21701 ) is prime! duplicate\n",
        )
        .unwrap();
        let batch = parse_confirmations_from(&log, 0).unwrap();
        assert_eq!(batch.confirmed, vec![21701, 23209, 44497]);
        assert_eq!(batch.refuted, vec![19991]);
        assert_eq!(batch.new_offset, log.len().unwrap());
    }

    #[test]
    fn offsets_are_monotonic_and_reparse_nothing() {
        let log = MemoryAppendLog::new();
        log.append(b"M( 86243 ) is prime!\n").unwrap();
        let first = parse_confirmations_from(&log, 0).unwrap();
        assert_eq!(first.confirmed, vec![86243]);
        let second = parse_confirmations_from(&log, first.new_offset).unwrap();
        assert!(second.is_empty());
        assert_eq!(second.new_offset, first.new_offset);
    }

    #[test]
    fn partial_trailing_line_is_left_for_later() {
        let log = MemoryAppendLog::new();
        log.append(b"M( 110503 ) is prime!\nM( 1320").unwrap();
        let first = parse_confirmations_from(&log, 0).unwrap();
        assert_eq!(first.confirmed, vec![110503]);
        assert_eq!(first.new_offset, 22);

        log.append(b"49 ) is prime!\n").unwrap();
        let second = parse_confirmations_from(&log, first.new_offset).unwrap();
        assert_eq!(second.confirmed, vec![132049]);
    }

    #[test]
    fn missing_result_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let batch = parse_confirmations(&dir.path().join("nope.txt"), 7).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.new_offset, 7);
    }

    #[test]
    fn bridge_reads_from_injected_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryAppendLog::new();
        log.append(b"M( 216091 ) is prime!\n").unwrap();
        let bridge = bridge_in(dir.path()).with_result_log(Box::new(log));
        assert_eq!(bridge.parse_confirmations(0).unwrap().confirmed, vec![216091]);
    }

    #[test]
    #[cfg(unix)]
    fn launched_verifier_is_reaped_with_its_status() {
        let mut done = launch_verifier(Path::new("true"), None).unwrap();
        assert!(done.id().is_some());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while done.try_status().unwrap().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(done.shutdown().unwrap().success());

        assert!(!launch_verifier(Path::new("false"), None)
            .unwrap()
            .shutdown()
            .unwrap()
            .success());

        // still running at shutdown: killed, then reaped
        let running = launch_verifier(Path::new("yes"), None).unwrap();
        assert!(!running.shutdown().unwrap().success());
    }

    #[test]
    fn launch_failure_is_external_tool_error() {
        let err = launch_verifier(Path::new("/definitely/not/a/verifier"), None).unwrap_err();
        assert!(matches!(err, SearchError::ExternalTool { .. }));
    }

    #[test]
    fn unwritable_work_file_is_external_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        let config = VerifierConfig {
            enabled: true,
            worktodo_path: dir.path().to_path_buf(),
            results_path: dir.path().join("results.txt"),
            ..Default::default()
        };
        let bridge = VerificationBridge::from_config(&config).unwrap();
        let err = bridge.submit(&[21701], WorkMode::Ll).unwrap_err();
        assert!(matches!(err, SearchError::ExternalTool { .. }), "{err}");
    }
}
