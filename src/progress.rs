//! # Progress — Atomic Session Counters
//!
//! Thread-safe progress tracking shared between the orchestrator and the
//! background status reporter. Workers never touch these directly: the
//! orchestrator's consumer loop updates them as results arrive, and the
//! reporter only reads.
//!
//! ## Background Reporter
//!
//! A dedicated thread logs a `search progress` line at a configurable
//! interval: tested, primes found, timeouts, worker failures, rate, and the
//! most recent Lucas–Lehmer progress. It polls the shutdown flag every
//! 100 ms so `stop()` takes effect promptly.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const POLL: Duration = Duration::from_millis(100);

pub struct Progress {
    pub tested: AtomicU64,
    pub found: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
    pub current: Mutex<String>,
    start: Instant,
    shutdown: AtomicBool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub tested: u64,
    pub found: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub current: String,
    pub elapsed_secs: f64,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Progress {
            tested: AtomicU64::new(0),
            found: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            current: Mutex::new(String::new()),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn start_reporter(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let progress = Arc::clone(self);
        thread::spawn(move || {
            let mut last = Instant::now();
            while !progress.shutdown.load(Ordering::Relaxed) {
                thread::sleep(POLL.min(interval));
                if last.elapsed() >= interval {
                    progress.print_status();
                    last = Instant::now();
                }
            }
        })
    }

    pub fn set_current(&self, text: impl Into<String>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = text.into();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            tested: self.tested.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            current: self.current.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            elapsed_secs: self.start.elapsed().as_secs_f64(),
        }
    }

    pub fn print_status(&self) {
        let snap = self.snapshot();
        let elapsed = self.start.elapsed();
        let rate = if elapsed.as_secs() > 0 {
            snap.tested as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let h = elapsed.as_secs() / 3600;
        let m = (elapsed.as_secs() % 3600) / 60;
        let s = elapsed.as_secs() % 60;
        info!(
            current = %snap.current,
            tested = snap.tested,
            found = snap.found,
            timeouts = snap.timeouts,
            failures = snap.failures,
            rate = format_args!("{:.3}", rate),
            elapsed = format_args!("{:02}:{:02}:{:02}", h, m, s),
            "search progress"
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
