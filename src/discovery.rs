//! Test results, discoveries, and the permanent discovery log.
//!
//! The log is JSON lines over an [`AppendLog`]. Entries are never rewritten:
//! an external confirmation (or refutation) of a pending discovery is a new
//! entry for the same exponent, and the latest entry wins when the log is
//! folded into per-exponent status.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::lucas_lehmer::{LlOutcome, Verdict};
use crate::mersenne_digits;
use crate::store::AppendLog;

pub const LL_METHOD: &str = "lucas-lehmer";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub exponent: u64,
    pub verdict: Verdict,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residue64: Option<u64>,
}

impl From<&LlOutcome> for TestResult {
    fn from(out: &LlOutcome) -> Self {
        TestResult {
            exponent: out.exponent,
            verdict: out.verdict,
            duration: out.elapsed,
            method: LL_METHOD.to_string(),
            timestamp: out.finished_at,
            residue64: out.residue64,
        }
    }
}

/// One line of the discovery log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub exponent: u64,
    pub digit_count: u64,
    pub discovery_time: DateTime<Utc>,
    pub test_duration_seconds: f64,
    pub method: String,
    pub verified_externally: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refuted: bool,
    /// When the external verifier's confirmation or refutation was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Discovery {
    /// A discovery from a PRIME result; None for any other verdict.
    pub fn from_result(result: &TestResult) -> Option<Self> {
        if result.verdict != Verdict::Prime {
            return None;
        }
        Some(Discovery {
            exponent: result.exponent,
            digit_count: mersenne_digits(result.exponent),
            discovery_time: result.timestamp,
            test_duration_seconds: result.duration.as_secs_f64(),
            method: result.method.clone(),
            verified_externally: false,
            refuted: false,
            verified_at: None,
        })
    }

    pub fn status(&self) -> DiscoveryStatus {
        if self.refuted {
            DiscoveryStatus::Refuted
        } else if self.verified_externally {
            DiscoveryStatus::Confirmed
        } else {
            DiscoveryStatus::Pending
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Pending,
    Confirmed,
    Refuted,
}

#[derive(Clone)]
pub struct DiscoveryLog {
    log: Arc<dyn AppendLog>,
}

impl DiscoveryLog {
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        DiscoveryLog { log }
    }

    pub fn append(&self, discovery: &Discovery) -> Result<()> {
        let mut line = serde_json::to_vec(discovery).context("serializing discovery")?;
        line.push(b'\n');
        self.log
            .append(&line)
            .with_context(|| format!("appending discovery p={}", discovery.exponent))?;
        Ok(())
    }

    /// All well-formed entries in log order. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<Discovery>> {
        let (bytes, _) = self.log.read_since(0).context("reading discovery log")?;
        let text = String::from_utf8_lossy(&bytes);
        let mut out = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Discovery>(line) {
                Ok(d) => out.push(d),
                Err(e) => warn!(line = i + 1, error = %e, "skipping malformed discovery entry"),
            }
        }
        Ok(out)
    }

    /// Latest entry per exponent.
    pub fn latest(&self) -> Result<BTreeMap<u64, Discovery>> {
        let mut map = BTreeMap::new();
        for d in self.entries()? {
            map.insert(d.exponent, d);
        }
        Ok(map)
    }

    pub fn contains(&self, p: u64) -> Result<bool> {
        Ok(self.entries()?.iter().any(|d| d.exponent == p))
    }

    /// Record an external confirmation. Returns false when `p` has no
    /// entry or is already confirmed.
    pub fn confirm(&self, p: u64) -> Result<bool> {
        self.resolve(p, true)
    }

    /// Record an external refutation. Returns false when `p` has no entry
    /// or is already refuted.
    pub fn refute(&self, p: u64) -> Result<bool> {
        self.resolve(p, false)
    }

    fn resolve(&self, p: u64, confirmed: bool) -> Result<bool> {
        let Some(mut entry) = self.latest()?.remove(&p) else {
            return Ok(false);
        };
        let target = if confirmed {
            DiscoveryStatus::Confirmed
        } else {
            DiscoveryStatus::Refuted
        };
        if entry.status() == target {
            return Ok(false);
        }
        entry.verified_externally = confirmed;
        entry.refuted = !confirmed;
        entry.verified_at = Some(Utc::now());
        self.append(&entry)?;
        Ok(true)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAppendLog;

    fn prime_result(p: u64) -> TestResult {
        TestResult {
            exponent: p,
            verdict: Verdict::Prime,
            duration: Duration::from_millis(1500),
            method: LL_METHOD.into(),
            timestamp: Utc::now(),
            residue64: Some(0),
        }
    }

    #[test]
    fn only_prime_results_become_discoveries() {
        assert!(Discovery::from_result(&prime_result(21701)).is_some());
        let mut r = prime_result(21701);
        r.verdict = Verdict::Composite;
        assert!(Discovery::from_result(&r).is_none());
        r.verdict = Verdict::Timeout;
        assert!(Discovery::from_result(&r).is_none());
    }

    #[test]
    fn discovery_entry_has_external_shape() {
        let d = Discovery::from_result(&prime_result(21701)).unwrap();
        assert_eq!(d.digit_count, 6533);
        let v: serde_json::Value = serde_json::to_value(&d).unwrap();
        for key in [
            "exponent",
            "digit_count",
            "discovery_time",
            "test_duration_seconds",
            "method",
            "verified_externally",
        ] {
            assert!(v.get(key).is_some(), "missing {}", key);
        }
        assert!(v.get("refuted").is_none());
        assert!(v.get("verified_at").is_none());
        assert_eq!(v["test_duration_seconds"], 1.5);
    }

    #[test]
    fn log_is_append_only_and_latest_wins() {
        let mem = Arc::new(MemoryAppendLog::new());
        let log = DiscoveryLog::new(mem.clone());
        let d = Discovery::from_result(&prime_result(23209)).unwrap();
        log.append(&d).unwrap();
        let before = mem.contents();

        assert!(log.confirm(23209).unwrap());
        assert!(!log.confirm(23209).unwrap());
        assert!(!log.confirm(44497).unwrap());

        let after = mem.contents();
        assert!(after.starts_with(&before));
        assert_eq!(log.entries().unwrap().len(), 2);
        assert_eq!(log.latest().unwrap()[&23209].status(), DiscoveryStatus::Confirmed);
        assert!(log.contains(23209).unwrap());
    }

    #[test]
    fn confirmation_keeps_discovery_time() {
        let log = DiscoveryLog::new(Arc::new(MemoryAppendLog::new()));
        let mut result = prime_result(44497);
        result.timestamp = Utc::now() - chrono::Duration::days(3);
        log.append(&Discovery::from_result(&result).unwrap()).unwrap();

        assert!(log.confirm(44497).unwrap());
        let latest = &log.latest().unwrap()[&44497];
        assert_eq!(latest.discovery_time, result.timestamp);
        let verified_at = latest.verified_at.unwrap();
        assert!(verified_at > result.timestamp);

        assert!(log.refute(44497).unwrap());
        assert_eq!(log.latest().unwrap()[&44497].discovery_time, result.timestamp);
    }

    #[test]
    fn refutation_marks_entry() {
        let log = DiscoveryLog::new(Arc::new(MemoryAppendLog::new()));
        log.append(&Discovery::from_result(&prime_result(19991)).unwrap())
            .unwrap();
        assert!(log.refute(19991).unwrap());
        assert_eq!(log.latest().unwrap()[&19991].status(), DiscoveryStatus::Refuted);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mem = Arc::new(MemoryAppendLog::new());
        mem.append(b"{not json}\n").unwrap();
        let log = DiscoveryLog::new(mem);
        log.append(&Discovery::from_result(&prime_result(86243)).unwrap())
            .unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_result_duration_serializes_as_seconds() {
        let json = serde_json::to_value(prime_result(3)).unwrap();
        assert_eq!(json["duration"], 1.5);
        assert_eq!(json["verdict"], "PRIME");
        let back: TestResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }
}
