//! # Events — Structured Session Events
//!
//! A bounded, thread-safe event log for what the orchestrator does, decoupled
//! from any presentation layer. Every event is logged through `tracing`,
//! kept in a bounded recent-events buffer, and sent to any subscribers.
//!
//! | Variant | Emitted When |
//! |---------|-------------|
//! | `SessionStarted` | `run` begins, after state is loaded |
//! | `CandidatesReady` | a window has been generated and filtered |
//! | `TestFinished` | one Lucas–Lehmer test returns a verdict |
//! | `PrimeFound` | a PRIME verdict is appended to the discovery log |
//! | `Confirmation` | the external verifier confirms or refutes an exponent |
//! | `Warning` | non-fatal trouble (verifier I/O, worker failure) |
//! | `SessionCompleted` | the session reaches `Done` |
//!
//! Subscribers receive over `std::sync::mpsc`; a dropped receiver is pruned
//! on the next emit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::lucas_lehmer::Verdict;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    SessionStarted {
        session_id: String,
        last_exponent_tested: u64,
        deferred: usize,
    },
    CandidatesReady {
        start: u64,
        end: u64,
        generated: usize,
        admitted: usize,
    },
    TestFinished {
        exponent: u64,
        verdict: Verdict,
        seconds: f64,
    },
    PrimeFound {
        exponent: u64,
        digits: u64,
        verified_externally: bool,
    },
    Confirmation {
        exponent: u64,
        confirmed: bool,
    },
    Warning {
        context: String,
        message: String,
    },
    SessionCompleted {
        tested: u64,
        found: u64,
        timeouts: u64,
        elapsed_secs: f64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub event: Event,
}

const RECENT_EVENTS_CAP: usize = 200;

pub struct EventBus {
    inner: Mutex<BusInner>,
    cap: usize,
}

struct BusInner {
    recent: VecDeque<EventRecord>,
    subscribers: Vec<Sender<EventRecord>>,
    next_id: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(RECENT_EVENTS_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        EventBus {
            inner: Mutex::new(BusInner {
                recent: VecDeque::with_capacity(cap),
                subscribers: Vec::new(),
                next_id: 1,
            }),
            cap: cap.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        log_event(&event);
        let mut inner = self.lock();
        let record = EventRecord {
            id: inner.next_id,
            at: Utc::now(),
            event,
        };
        inner.next_id += 1;
        inner.subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        if inner.recent.len() >= self.cap {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let inner = self.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_event(event: &Event) {
    match event {
        Event::SessionStarted {
            session_id,
            last_exponent_tested,
            deferred,
        } => info!(%session_id, last_exponent_tested, deferred, "session started"),
        Event::CandidatesReady {
            start,
            end,
            generated,
            admitted,
        } => info!(start, end, generated, admitted, "candidates ready"),
        Event::TestFinished {
            exponent,
            verdict,
            seconds,
        } => info!(exponent, %verdict, seconds, "test finished"),
        Event::PrimeFound {
            exponent,
            digits,
            verified_externally,
        } => info!(exponent, digits, verified_externally, "MERSENNE PRIME"),
        Event::Confirmation {
            exponent,
            confirmed,
        } => info!(exponent, confirmed, "external verifier result"),
        Event::Warning { context, message } => warn!(%context, %message, "warning"),
        Event::SessionCompleted {
            tested,
            found,
            timeouts,
            elapsed_secs,
        } => info!(
            tested,
            found,
            timeouts,
            elapsed = format_args!("{:.1}s", elapsed_secs),
            "session completed"
        ),
    }
}
