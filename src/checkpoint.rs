//! # Checkpoint — Resumable Search State
//!
//! [`SearchState`] is the only state carried between sessions: the
//! high-water mark of tested exponents, the byte offset into the external
//! verifier's result log, running totals, and the exponents deferred for a
//! retest (timeouts and candidates left unstarted at shutdown).
//!
//! ## Monotonicity
//!
//! `last_exponent_tested` and `verification_log_offset` never decrease. The
//! in-memory setters take the max, and [`JsonStateStore::save`] merges with
//! whatever is already on disk, so a stale writer cannot roll them back.
//!
//! ## Atomic Writes
//!
//! State files are written to a `.tmp` sibling and renamed into place, so a
//! crash mid-write leaves the previous file intact.
//!
//! ## Integrity
//!
//! A SHA-256 hash of the JSON payload is stored alongside it. On load the
//! hash is verified; a corrupted file is skipped in favour of the newest
//! valid generation (3 generations kept). A bare, envelope-less state file
//! from older tooling is still accepted.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Number of backup generations to keep.
const GENERATIONS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub last_exponent_tested: u64,
    #[serde(alias = "prime95_results_offset")]
    pub verification_log_offset: u64,
    pub total_candidates_tested: u64,
    pub total_primes_found: u64,
    #[serde(alias = "timestamp", default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub deferred_exponents: BTreeSet<u64>,
}

impl Default for SearchState {
    fn default() -> Self {
        SearchState {
            last_exponent_tested: 0,
            verification_log_offset: 0,
            total_candidates_tested: 0,
            total_primes_found: 0,
            last_updated: Utc::now(),
            deferred_exponents: BTreeSet::new(),
        }
    }
}

impl SearchState {
    /// Record an attempted exponent. The high-water mark only moves up.
    pub fn record_tested(&mut self, p: u64) {
        self.last_exponent_tested = self.last_exponent_tested.max(p);
        self.total_candidates_tested += 1;
    }

    pub fn advance_offset(&mut self, offset: u64) {
        self.verification_log_offset = self.verification_log_offset.max(offset);
    }

    pub fn defer(&mut self, p: u64) {
        self.deferred_exponents.insert(p);
    }

    /// Remove `p` from the retry set; true if it was deferred.
    pub fn clear_deferred(&mut self, p: u64) -> bool {
        self.deferred_exponents.remove(&p)
    }

    pub fn is_deferred(&self, p: u64) -> bool {
        self.deferred_exponents.contains(&p)
    }

    /// Combine with another snapshot of the same search without regressing
    /// any monotonic field. Totals take the larger count.
    pub fn merge(&mut self, other: &SearchState) {
        self.last_exponent_tested = self.last_exponent_tested.max(other.last_exponent_tested);
        self.verification_log_offset = self
            .verification_log_offset
            .max(other.verification_log_offset);
        self.total_candidates_tested = self
            .total_candidates_tested
            .max(other.total_candidates_tested);
        self.total_primes_found = self.total_primes_found.max(other.total_primes_found);
        self.last_updated = self.last_updated.max(other.last_updated);
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Persistence seam for [`SearchState`].
pub trait StateStore: Send + Sync {
    /// The saved state, or defaults on first run.
    fn load(&self) -> Result<SearchState>;
    fn save(&self, state: &SearchState) -> Result<()>;
}

/// Wrapper that includes a SHA-256 checksum for integrity verification.
#[derive(Serialize, Deserialize)]
struct StateEnvelope {
    checksum: String,
    data: serde_json::Value,
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return the path for generation `gen` (0 = current, 1 = .1, 2 = .2, ...).
fn generation_path(base: &Path, gen: usize) -> PathBuf {
    if gen == 0 {
        base.to_path_buf()
    } else {
        let mut p = base.as_os_str().to_os_string();
        p.push(format!(".{}", gen));
        PathBuf::from(p)
    }
}

#[derive(Clone, Debug)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Newest valid generation, or None when nothing has been saved yet.
    fn load_existing(&self) -> Result<Option<SearchState>> {
        let mut found_any = false;
        for gen in 0..GENERATIONS {
            let p = generation_path(&self.path, gen);
            if !p.exists() {
                continue;
            }
            found_any = true;
            if let Some(state) = load_single(&p) {
                if gen > 0 {
                    warn!(generation = gen, path = %p.display(), "recovered search state from backup");
                }
                return Ok(Some(state));
            }
        }
        if !found_any {
            return Ok(None);
        }

        // Bare state file without the checksum envelope
        if let Ok(raw) = fs::read_to_string(&self.path) {
            if let Ok(state) = serde_json::from_str::<SearchState>(&raw) {
                warn!(path = %self.path.display(), "loaded search state without checksum");
                return Ok(Some(state));
            }
        }
        bail!(
            "no valid search state in {} or its backups",
            self.path.display()
        )
    }

    /// Remove the state file and all generations.
    pub fn clear(&self) {
        for gen in 0..GENERATIONS {
            let _ = fs::remove_file(generation_path(&self.path, gen));
        }
        let _ = fs::remove_file(self.path.with_extension("tmp"));
    }
}

fn load_single(path: &Path) -> Option<SearchState> {
    let raw = fs::read_to_string(path).ok()?;
    let envelope: StateEnvelope = serde_json::from_str(&raw).ok()?;

    let data_str = serde_json::to_string_pretty(&envelope.data).ok()?;
    let expected = sha256_hex(&data_str);
    if expected != envelope.checksum {
        warn!(
            path = %path.display(),
            expected = &expected[..12],
            got = &envelope.checksum[..12.min(envelope.checksum.len())],
            "search state integrity check failed"
        );
        return None;
    }

    serde_json::from_value(envelope.data).ok()
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<SearchState> {
        Ok(self.load_existing()?.unwrap_or_default())
    }

    /// Rotation: current → .1 → .2 (oldest .2 is discarded). The merged
    /// state is written atomically via a .tmp file.
    fn save(&self, state: &SearchState) -> Result<()> {
        let mut merged = state.clone();
        if let Ok(Some(on_disk)) = self.load_existing() {
            merged.merge(&on_disk);
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating state directory {}", dir.display()))?;
        }

        let data = serde_json::to_value(&merged)?;
        let data_str = serde_json::to_string_pretty(&data)?;
        let envelope = StateEnvelope {
            checksum: sha256_hex(&data_str),
            data,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        for gen in (1..GENERATIONS).rev() {
            let src = generation_path(&self.path, gen - 1);
            let dst = generation_path(&self.path, gen);
            if src.exists() {
                let _ = fs::rename(&src, &dst);
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<SearchState>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SearchState) -> Self {
        MemoryStateStore {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<SearchState> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone().unwrap_or_default())
    }

    fn save(&self, state: &SearchState) -> Result<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged = state.clone();
        if let Some(prev) = guard.as_ref() {
            merged.merge(prev);
        }
        *guard = Some(merged);
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn state(last: u64, offset: u64) -> SearchState {
        SearchState {
            last_exponent_tested: last,
            verification_log_offset: offset,
            total_candidates_tested: last / 2,
            ..Default::default()
        }
    }

    #[test]
    fn first_run_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        let s = store.load().unwrap();
        assert_eq!(s.last_exponent_tested, 0);
        assert_eq!(s.verification_log_offset, 0);
        assert!(s.deferred_exponents.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        let mut s = state(21701, 128);
        s.defer(23209);
        s.total_primes_found = 1;
        store.save(&s).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.last_exponent_tested, 21701);
        assert_eq!(loaded.verification_log_offset, 128);
        assert_eq!(loaded.total_primes_found, 1);
        assert!(loaded.is_deferred(23209));
    }

    #[test]
    fn save_never_regresses_high_water_marks() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        store.save(&state(30000, 500)).unwrap();
        store.save(&state(20000, 100)).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.last_exponent_tested, 30000);
        assert_eq!(loaded.verification_log_offset, 500);
    }

    #[test]
    fn rotation_keeps_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonStateStore::new(&path);
        for n in 1..=3u64 {
            store.save(&state(n * 10, 0)).unwrap();
        }
        assert!(generation_path(&path, 1).exists());
        assert!(generation_path(&path, 2).exists());
        assert_eq!(load_single(&path).unwrap().last_exponent_tested, 30);
        assert_eq!(
            load_single(&generation_path(&path, 1)).unwrap().last_exponent_tested,
            20
        );
        assert_eq!(
            load_single(&generation_path(&path, 2)).unwrap().last_exponent_tested,
            10
        );
    }

    #[test]
    fn fallback_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonStateStore::new(&path);
        store.save(&state(100, 0)).unwrap();
        store.save(&state(200, 0)).unwrap();
        {
            let mut f = fs::File::create(&path).unwrap();
            f.write_all(b"corrupted data!!!").unwrap();
        }
        assert_eq!(store.load().unwrap().last_exponent_tested, 100);
    }

    #[test]
    fn unreadable_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonStateStore::new(&path).load().is_err());
    }

    #[test]
    fn bare_legacy_state_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let legacy = r#"{
            "last_exponent_tested": 82589933,
            "prime95_results_offset": 4096,
            "total_candidates_tested": 17,
            "total_primes_found": 0,
            "timestamp": "2024-10-12T08:00:00Z"
        }"#;
        fs::write(&path, legacy).unwrap();
        let s = JsonStateStore::new(&path).load().unwrap();
        assert_eq!(s.last_exponent_tested, 82_589_933);
        assert_eq!(s.verification_log_offset, 4096);
        assert!(s.deferred_exponents.is_empty());
    }

    #[test]
    fn memory_store_merges_like_file_store() {
        let store = MemoryStateStore::new();
        store.save(&state(50, 10)).unwrap();
        store.save(&state(40, 5)).unwrap();
        let s = store.load().unwrap();
        assert_eq!((s.last_exponent_tested, s.verification_log_offset), (50, 10));
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn deferred_set_round_trips_through_setters() {
        let mut s = SearchState::default();
        s.defer(101);
        assert!(s.is_deferred(101));
        assert!(s.clear_deferred(101));
        assert!(!s.clear_deferred(101));
    }

    #[test]
    fn clear_removes_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonStateStore::new(&path);
        store.save(&state(1, 0)).unwrap();
        store.save(&state(2, 0)).unwrap();
        store.clear();
        assert!(!path.exists());
        assert!(!generation_path(&path, 1).exists());
    }
}
