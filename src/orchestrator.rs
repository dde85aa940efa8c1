//! # Orchestrator — Resumable Concurrent Discovery Sessions
//!
//! Drives one search session end to end:
//!
//! ```text
//! Idle ─▶ Generating ─▶ Filtering ─▶ Testing ─▶ Draining ─▶ Done
//!             ▲             │           │           ▲
//!             └── next window           ▼           │
//!                                     Paused ───────┘   (stop signal)
//! ```
//!
//! ## Session Flow
//!
//! 1. Load [`SearchState`]; fold in new external confirmations from the
//!    verifier's result log.
//! 2. Queue deferred exponents (timeouts and unstarted work from the last
//!    session) first, then generate and filter each configured window with
//!    the generator floored at `last_exponent_tested`.
//! 3. Test on a fixed pool of `min(workers, available_parallelism)` scoped
//!    threads pulling from one `Mutex<VecDeque<u64>>`. Each exponent is
//!    popped by exactly one worker.
//! 4. Workers send results over one `mpsc` channel. This thread is the only
//!    writer of the state and the discovery log: it records the high-water
//!    mark, appends discoveries, forwards them to the verifier, and saves the
//!    state every `batch_size` results and at the end.
//!
//! ## Cancellation
//!
//! The stop signal is polled by workers between candidates and by the tester
//! at its checkpoints. Once seen, the session goes Testing → Paused →
//! Draining: the queue is emptied into `deferred_exponents`, in-flight tests
//! end (a stopped test reports TIMEOUT and is deferred too), state is saved.
//!
//! ## Failure Model
//!
//! A panic while testing one exponent is caught in the worker, reported as a
//! `WorkerFailure`, and the exponent counts as tested without a verdict. The
//! verifier is best effort: its errors become warnings. Failing to persist
//! state or a discovery is fatal for the session; the pool is told to stop
//! and the error is returned once the workers have exited.
//!
//! ## Timeouts
//!
//! TIMEOUT is not COMPOSITE. With `retry_timeouts` on (the default) a timed
//! out exponent goes into `deferred_exponents` and is queued first next
//! session even though it lies below the high-water mark. With it off, the
//! timeout is logged and the exponent is not retried.

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::bridge::{ConfirmationBatch, VerificationBridge, VerifierProcess};
use crate::checkpoint::{JsonStateStore, SearchState, StateStore};
use crate::config::SearchConfig;
pub use crate::config::DiscoveryPolicy;
use crate::discovery::{Discovery, DiscoveryLog, TestResult};
use crate::error::SearchError;
use crate::events::{Event, EventBus};
use crate::filter::FastFilter;
use crate::generator::CandidateGenerator;
use crate::lucas_lehmer::{LlOutcome, LlProgress, LucasLehmer, Verdict};
use crate::progress::Progress;
use crate::registry::Registry;
use crate::store::{AppendLog, FileAppendLog};
use crate::StopSignal;

const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Idle,
    Generating,
    Filtering,
    Testing,
    Paused,
    Draining,
    Done,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Generating)
                | (Idle, Testing)
                | (Generating, Filtering)
                | (Filtering, Generating)
                | (Filtering, Testing)
                | (Testing, Paused)
                | (Testing, Draining)
                | (Paused, Draining)
                | (Draining, Done)
                | (Idle | Generating | Filtering, Done)
                | (Done, Idle)
        )
    }
}

/// Anything that can decide 2^p − 1. The pool only needs this seam.
pub trait ExponentTester: Send + Sync {
    fn test(
        &self,
        p: u64,
        stop: &dyn StopSignal,
        on_progress: &mut dyn FnMut(LlProgress),
    ) -> LlOutcome;
}

impl ExponentTester for LucasLehmer {
    fn test(
        &self,
        p: u64,
        stop: &dyn StopSignal,
        on_progress: &mut dyn FnMut(LlProgress),
    ) -> LlOutcome {
        self.run(p, stop, on_progress)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tested: u64,
    pub primes: Vec<u64>,
    pub composites: u64,
    pub timeouts: Vec<u64>,
    pub failures: Vec<(u64, String)>,
    pub skipped_known: Vec<u64>,
    pub deferred: Vec<u64>,
    pub stopped: bool,
    pub elapsed_secs: f64,
    #[serde(skip)]
    pub results: Vec<TestResult>,
}

enum WorkerMsg {
    Progress(LlProgress),
    Finished(LlOutcome),
    Failed {
        worker: usize,
        exponent: u64,
        message: String,
    },
}

/// Outer stop signal or an internal abort after a fatal error.
struct PoolStop<'a> {
    outer: &'a dyn StopSignal,
    abort: &'a AtomicBool,
}

impl StopSignal for PoolStop<'_> {
    fn is_stop_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed) || self.outer.is_stop_requested()
    }
}

pub struct Orchestrator {
    registry: Registry,
    config: SearchConfig,
    store: Arc<dyn StateStore>,
    discoveries: DiscoveryLog,
    bridge: Option<VerificationBridge>,
    verifier: Option<VerifierProcess>,
    tester: Arc<dyn ExponentTester>,
    events: Arc<EventBus>,
    progress: Arc<Progress>,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        config: SearchConfig,
        store: Arc<dyn StateStore>,
        discovery_log: Arc<dyn AppendLog>,
    ) -> Self {
        let tester = Arc::new(LucasLehmer::new(config.budget()));
        Orchestrator {
            registry,
            config,
            store,
            discoveries: DiscoveryLog::new(discovery_log),
            bridge: None,
            verifier: None,
            tester,
            events: Arc::new(EventBus::new()),
            progress: Progress::new(),
            phase: Phase::Idle,
        }
    }

    /// File-backed state and discovery log, plus the verifier bridge when
    /// enabled.
    pub fn from_config(registry: Registry, config: SearchConfig) -> Result<Self, SearchError> {
        config.validate()?;
        let store = Arc::new(JsonStateStore::new(&config.state_path));
        let log = Arc::new(FileAppendLog::new(&config.discovery_log_path));
        let bridge = if config.verifier.enabled {
            Some(VerificationBridge::from_config(&config.verifier)?)
        } else {
            None
        };
        let mut orch = Orchestrator::new(registry, config, store, log);
        orch.bridge = bridge;
        Ok(orch)
    }

    pub fn with_bridge(mut self, bridge: VerificationBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_tester(mut self, tester: Arc<dyn ExponentTester>) -> Self {
        self.tester = tester;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    pub fn discoveries(&self) -> &DiscoveryLog {
        &self.discoveries
    }

    fn transition(&mut self, next: Phase) {
        if !self.phase.can_transition_to(next) {
            warn!(from = ?self.phase, to = ?next, "unexpected phase transition");
        }
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    fn begin(&mut self) {
        if self.phase == Phase::Done {
            self.transition(Phase::Idle);
        }
        self.progress = Progress::new();
    }

    fn load_state(&self) -> Result<SearchState, SearchError> {
        self.store.load().map_err(SearchError::Persistence)
    }

    fn persist(&self, state: &mut SearchState) -> Result<(), SearchError> {
        state.touch();
        self.store.save(state).map_err(SearchError::Persistence)
    }

    /// Mid-session save. Queued and in-flight exponents below the high-water
    /// mark go out as deferred so a resume from this snapshot retests them.
    fn checkpoint(&self, state: &SearchState, unfinished: &BTreeSet<u64>) -> Result<(), SearchError> {
        let mut snapshot = state.clone();
        for &p in unfinished.range(..snapshot.last_exponent_tested) {
            snapshot.defer(p);
        }
        self.persist(&mut snapshot)
    }

    /// Full session: sync confirmations, generate, filter, test.
    pub fn run(&mut self, stop: &dyn StopSignal) -> Result<SessionSummary, SearchError> {
        self.config.validate()?;
        self.begin();
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("session", id = %session_id);
        let _enter = span.enter();

        let mut state = self.load_state()?;
        self.events.emit(Event::SessionStarted {
            session_id: session_id.clone(),
            last_exponent_tested: state.last_exponent_tested,
            deferred: state.deferred_exponents.len(),
        });
        self.apply_confirmations(&mut state)?;
        if let Some(bridge) = &self.bridge {
            match bridge.launch_if_configured() {
                Ok(process) => self.verifier = process,
                Err(e) => self.warn("verifier", &e),
            }
        }

        let mut queue: Vec<u64> = if self.config.retry_timeouts {
            state.deferred_exponents.iter().copied().collect()
        } else {
            Vec::new()
        };

        let filter = FastFilter::new(&self.registry).with_trial_factoring(self.config.trial_factor_bits);
        let generator = CandidateGenerator::new(&self.registry)
            .with_seed(self.config.seed)
            .with_floor(state.last_exponent_tested);
        for window in self.config.windows.clone() {
            self.transition(Phase::Generating);
            let set = generator.generate(window.start, window.end, self.config.candidate_count)?;
            self.transition(Phase::Filtering);
            let report = filter.filter_set(&set);
            debug!(rejected = ?report.rejected, "filter rejections");
            self.events.emit(Event::CandidatesReady {
                start: window.start,
                end: window.end,
                generated: set.len(),
                admitted: report.admitted.len(),
            });
            queue.extend(report.admitted.iter().map(|c| c.exponent));
        }

        let summary = self.test_session(session_id, state, queue, stop);
        self.stop_verifier();
        summary
    }

    /// Test exactly `candidates` (after skipping known and already tested
    /// exponents), without generation.
    pub fn execute(
        &mut self,
        candidates: &[u64],
        stop: &dyn StopSignal,
    ) -> Result<SessionSummary, SearchError> {
        self.begin();
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("session", id = %session_id);
        let _enter = span.enter();
        let state = self.load_state()?;
        self.test_session(session_id, state, candidates.to_vec(), stop)
    }

    /// Fold new verifier results into the discovery log and state.
    pub fn sync_confirmations(&mut self) -> Result<ConfirmationBatch, SearchError> {
        let mut state = self.load_state()?;
        let batch = self.apply_confirmations(&mut state)?;
        self.persist(&mut state)?;
        Ok(batch)
    }

    fn apply_confirmations(&self, state: &mut SearchState) -> Result<ConfirmationBatch, SearchError> {
        let Some(bridge) = &self.bridge else {
            return Ok(ConfirmationBatch {
                new_offset: state.verification_log_offset,
                ..Default::default()
            });
        };
        let batch = match bridge.parse_confirmations(state.verification_log_offset) {
            Ok(b) => b,
            Err(e) => {
                self.warn("verifier", &e);
                return Ok(ConfirmationBatch {
                    new_offset: state.verification_log_offset,
                    ..Default::default()
                });
            }
        };

        for &p in &batch.confirmed {
            let was_pending = self
                .discoveries
                .latest()
                .map_err(SearchError::Persistence)?
                .get(&p)
                .is_some_and(|d| !d.verified_externally);
            if !self.discoveries.confirm(p).map_err(SearchError::Persistence)? {
                continue;
            }
            if was_pending && self.config.policy == DiscoveryPolicy::AwaitExternal {
                state.total_primes_found += 1;
            }
            self.events.emit(Event::Confirmation {
                exponent: p,
                confirmed: true,
            });
        }
        for &p in &batch.refuted {
            if self.discoveries.refute(p).map_err(SearchError::Persistence)? {
                self.events.emit(Event::Confirmation {
                    exponent: p,
                    confirmed: false,
                });
            }
        }
        state.advance_offset(batch.new_offset);
        Ok(batch)
    }

    /// Reap the verifier launched for this session. An exit before we
    /// stopped it is reported.
    fn stop_verifier(&mut self) {
        let Some(mut process) = self.verifier.take() else {
            return;
        };
        if let Ok(Some(status)) = process.try_status() {
            if !status.success() {
                self.events.emit(Event::Warning {
                    context: "verifier".to_string(),
                    message: format!("external verifier exited early: {status}"),
                });
            }
        }
        if let Err(e) = process.shutdown() {
            self.warn("verifier", &e);
        }
    }

    fn warn(&self, context: &str, err: &SearchError) {
        self.events.emit(Event::Warning {
            context: context.to_string(),
            message: err.to_string(),
        });
    }

    fn test_session(
        &mut self,
        session_id: String,
        mut state: SearchState,
        candidates: Vec<u64>,
        stop: &dyn StopSignal,
    ) -> Result<SessionSummary, SearchError> {
        let started = Instant::now();
        let mut summary = SessionSummary {
            session_id,
            ..Default::default()
        };

        let mut seen = BTreeSet::new();
        let mut work = VecDeque::new();
        for p in candidates {
            if !seen.insert(p) {
                continue;
            }
            if self.registry.contains(p) {
                summary.skipped_known.push(p);
                state.clear_deferred(p);
                continue;
            }
            if p <= state.last_exponent_tested && !state.is_deferred(p) {
                debug!(exponent = p, "already tested, skipping");
                continue;
            }
            work.push_back(p);
        }

        self.transition(Phase::Testing);
        let reporter = self.progress.start_reporter(self.config.progress_interval());
        let result = self.run_pool(work, &mut state, &mut summary, stop);
        self.progress.stop();
        let _ = reporter.join();
        result?;

        if self.phase == Phase::Testing {
            self.transition(Phase::Draining);
        }
        self.persist(&mut state)?;
        self.transition(Phase::Done);

        summary.deferred = state.deferred_exponents.iter().copied().collect();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        self.events.emit(Event::SessionCompleted {
            tested: summary.tested,
            found: summary.primes.len() as u64,
            timeouts: summary.timeouts.len() as u64,
            elapsed_secs: summary.elapsed_secs,
        });
        Ok(summary)
    }

    fn pool_size(&self, jobs: usize) -> usize {
        let host = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        self.config.workers.min(host).min(jobs).max(1)
    }

    fn run_pool(
        &mut self,
        work: VecDeque<u64>,
        state: &mut SearchState,
        summary: &mut SessionSummary,
        stop: &dyn StopSignal,
    ) -> Result<(), SearchError> {
        if work.is_empty() {
            return Ok(());
        }
        let n_workers = self.pool_size(work.len());
        info!(candidates = work.len(), workers = n_workers, "testing");

        let mut unfinished: BTreeSet<u64> = work.iter().copied().collect();
        let queue = Mutex::new(work);
        let abort = AtomicBool::new(false);
        let pool_stop = PoolStop {
            outer: stop,
            abort: &abort,
        };
        let tester = Arc::clone(&self.tester);
        let (tx, rx) = mpsc::channel::<WorkerMsg>();

        let outcome = thread::scope(|s| {
            for worker in 0..n_workers {
                let tx = tx.clone();
                let queue = &queue;
                let pool_stop = &pool_stop;
                let tester = &*tester;
                s.spawn(move || worker_loop(worker, queue, tester, pool_stop, tx));
            }
            drop(tx);
            self.consume(&rx, &queue, &mut unfinished, state, summary, &abort, stop)
        });

        // Anything still queued was never started.
        let leftover: Vec<u64> = lock_queue(&queue).drain(..).collect();
        for p in leftover {
            state.defer(p);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn consume(
        &mut self,
        rx: &Receiver<WorkerMsg>,
        queue: &Mutex<VecDeque<u64>>,
        unfinished: &mut BTreeSet<u64>,
        state: &mut SearchState,
        summary: &mut SessionSummary,
        abort: &AtomicBool,
        stop: &dyn StopSignal,
    ) -> Result<(), SearchError> {
        let mut fatal: Option<SearchError> = None;
        let mut since_save = 0usize;

        loop {
            if fatal.is_none() && stop.is_stop_requested() && self.phase == Phase::Testing {
                self.drain(queue, state, summary);
            }

            let msg = match rx.recv_timeout(RECV_POLL) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if fatal.is_some() {
                continue;
            }

            let handled = match msg {
                WorkerMsg::Progress(p) => {
                    self.progress.set_current(format!(
                        "M{} {:.0}% ({}/{})",
                        p.exponent,
                        p.fraction * 100.0,
                        p.iteration,
                        p.total
                    ));
                    Ok(false)
                }
                WorkerMsg::Finished(outcome) => {
                    unfinished.remove(&outcome.exponent);
                    self.record_outcome(&outcome, state, summary).map(|_| true)
                }
                WorkerMsg::Failed {
                    worker,
                    exponent,
                    message,
                } => {
                    let err = SearchError::WorkerFailure {
                        worker,
                        exponent,
                        message: message.clone(),
                    };
                    warn!(error = %err, "candidate failed");
                    unfinished.remove(&exponent);
                    self.warn("worker", &err);
                    state.record_tested(exponent);
                    state.clear_deferred(exponent);
                    self.progress.failures.fetch_add(1, Ordering::Relaxed);
                    summary.tested += 1;
                    summary.failures.push((exponent, message));
                    Ok(true)
                }
            };

            match handled {
                Ok(true) => {
                    since_save += 1;
                    if since_save >= self.config.batch_size {
                        since_save = 0;
                        if let Err(e) = self.checkpoint(state, unfinished) {
                            abort.store(true, Ordering::Relaxed);
                            fatal = Some(e);
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    abort.store(true, Ordering::Relaxed);
                    fatal = Some(e);
                }
            }
        }

        // a stop raised while waiting on the last result
        if fatal.is_none() && stop.is_stop_requested() && self.phase == Phase::Testing {
            self.drain(queue, state, summary);
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn drain(&mut self, queue: &Mutex<VecDeque<u64>>, state: &mut SearchState, summary: &mut SessionSummary) {
        self.transition(Phase::Paused);
        self.transition(Phase::Draining);
        summary.stopped = true;
        let unstarted: Vec<u64> = lock_queue(queue).drain(..).collect();
        info!(unstarted = unstarted.len(), "stop requested, draining");
        for p in unstarted {
            state.defer(p);
        }
    }

    fn record_outcome(
        &self,
        outcome: &LlOutcome,
        state: &mut SearchState,
        summary: &mut SessionSummary,
    ) -> Result<(), SearchError> {
        let p = outcome.exponent;
        let result = TestResult::from(outcome);
        state.record_tested(p);
        summary.tested += 1;
        self.progress.tested.fetch_add(1, Ordering::Relaxed);
        self.events.emit(Event::TestFinished {
            exponent: p,
            verdict: outcome.verdict,
            seconds: outcome.elapsed.as_secs_f64(),
        });

        match outcome.verdict {
            Verdict::Timeout => {
                self.progress.timeouts.fetch_add(1, Ordering::Relaxed);
                summary.timeouts.push(p);
                if self.config.retry_timeouts {
                    state.defer(p);
                } else {
                    info!(exponent = p, "timed out, not retrying");
                    state.clear_deferred(p);
                }
            }
            Verdict::Composite => {
                state.clear_deferred(p);
                summary.composites += 1;
            }
            Verdict::Prime => {
                state.clear_deferred(p);
                self.record_prime(&result, state)?;
                summary.primes.push(p);
            }
        }
        summary.results.push(result);
        Ok(())
    }

    fn record_prime(&self, result: &TestResult, state: &mut SearchState) -> Result<(), SearchError> {
        let p = result.exponent;
        if self.registry.contains(p) {
            return Ok(());
        }
        if self.discoveries.contains(p).map_err(SearchError::Persistence)? {
            info!(exponent = p, "already in discovery log");
            return Ok(());
        }
        let Some(discovery) = Discovery::from_result(result) else {
            return Ok(());
        };
        self.discoveries
            .append(&discovery)
            .map_err(SearchError::Persistence)?;
        if self.config.policy == DiscoveryPolicy::Immediate {
            state.total_primes_found += 1;
            self.progress.found.fetch_add(1, Ordering::Relaxed);
        }
        self.events.emit(Event::PrimeFound {
            exponent: p,
            digits: discovery.digit_count,
            verified_externally: false,
        });

        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.submit_default(&[p]) {
                warn!(exponent = p, error = %e, "could not forward discovery to verifier");
                self.warn("verifier", &e);
            }
        }
        Ok(())
    }
}

fn lock_queue(queue: &Mutex<VecDeque<u64>>) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn worker_loop(
    worker: usize,
    queue: &Mutex<VecDeque<u64>>,
    tester: &dyn ExponentTester,
    stop: &dyn StopSignal,
    tx: Sender<WorkerMsg>,
) {
    loop {
        if stop.is_stop_requested() {
            break;
        }
        let Some(p) = lock_queue(queue).pop_front() else {
            break;
        };
        debug!(worker, exponent = p, "testing");
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            tester.test(p, stop, &mut |prog: LlProgress| {
                let _ = tx.send(WorkerMsg::Progress(prog));
            })
        }));
        let msg = match outcome {
            Ok(out) => WorkerMsg::Finished(out),
            Err(panic) => WorkerMsg::Failed {
                worker,
                exponent: p,
                message: panic_message(panic.as_ref()),
            },
        };
        if tx.send(msg).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStateStore;
    use crate::config::{SearchWindow, VerifierConfig};
    use crate::store::MemoryAppendLog;
    use crate::NeverStop;
    use chrono::Utc;

    fn toy_config(workers: usize) -> SearchConfig {
        SearchConfig {
            windows: vec![SearchWindow { start: 20, end: 200 }],
            // every odd exponent in the window
            candidate_count: 90,
            workers,
            timeout_secs: 0,
            batch_size: 3,
            ..Default::default()
        }
    }

    fn toy(workers: usize) -> (Orchestrator, Arc<MemoryStateStore>, Arc<MemoryAppendLog>) {
        let store = Arc::new(MemoryStateStore::new());
        let log = Arc::new(MemoryAppendLog::new());
        let orch = Orchestrator::new(
            Registry::truncated_at(19),
            toy_config(workers),
            store.clone(),
            log.clone(),
        );
        (orch, store, log)
    }

    /// Panics on one exponent, defers to LL otherwise.
    struct Flaky {
        bad: u64,
    }

    impl ExponentTester for Flaky {
        fn test(
            &self,
            p: u64,
            stop: &dyn StopSignal,
            on_progress: &mut dyn FnMut(LlProgress),
        ) -> LlOutcome {
            if p == self.bad {
                panic!("injected failure on {}", p);
            }
            LucasLehmer::default().run(p, stop, on_progress)
        }
    }

    /// Reports every exponent as PRIME without testing.
    struct AlwaysPrime;

    impl ExponentTester for AlwaysPrime {
        fn test(&self, p: u64, _: &dyn StopSignal, _: &mut dyn FnMut(LlProgress)) -> LlOutcome {
            LlOutcome {
                exponent: p,
                verdict: Verdict::Prime,
                iterations: 0,
                elapsed: Duration::ZERO,
                residue64: Some(0),
                finished_at: Utc::now(),
            }
        }
    }

    fn composite(p: u64) -> LlOutcome {
        LlOutcome {
            exponent: p,
            verdict: Verdict::Composite,
            iterations: 0,
            elapsed: Duration::ZERO,
            residue64: Some(1),
            finished_at: Utc::now(),
        }
    }

    /// Keeps every snapshot saved while `held` is true.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStateStore,
        held: AtomicBool,
        snapshots: Mutex<Vec<SearchState>>,
    }

    impl RecordingStore {
        fn held_snapshots(&self) -> Vec<SearchState> {
            self.snapshots.lock().unwrap().clone()
        }
    }

    impl StateStore for RecordingStore {
        fn load(&self) -> anyhow::Result<SearchState> {
            self.inner.load()
        }
        fn save(&self, state: &SearchState) -> anyhow::Result<()> {
            if self.held.load(Ordering::SeqCst) {
                self.snapshots.lock().unwrap().push(state.clone());
            }
            self.inner.save(state)
        }
    }

    /// Holds one exponent until a few saves have happened (or two seconds).
    struct HoldOne {
        held: u64,
        store: Arc<RecordingStore>,
    }

    impl ExponentTester for HoldOne {
        fn test(&self, p: u64, _: &dyn StopSignal, _: &mut dyn FnMut(LlProgress)) -> LlOutcome {
            if p == self.held {
                self.store.held.store(true, Ordering::SeqCst);
                let deadline = Instant::now() + Duration::from_secs(2);
                while self.store.inner.save_count() < 3 && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                self.store.held.store(false, Ordering::SeqCst);
            }
            composite(p)
        }
    }

    /// Raises the stop flag from inside the test of the last exponent.
    struct StopsDuring {
        flag: Arc<AtomicBool>,
    }

    impl ExponentTester for StopsDuring {
        fn test(&self, p: u64, _: &dyn StopSignal, _: &mut dyn FnMut(LlProgress)) -> LlOutcome {
            self.flag.store(true, Ordering::SeqCst);
            composite(p)
        }
    }

    #[test]
    fn phase_transitions() {
        use Phase::*;
        assert!(Idle.can_transition_to(Generating));
        assert!(Testing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Done));
        assert!(!Done.can_transition_to(Testing));
        assert!(!Paused.can_transition_to(Testing));
        assert!(!Idle.can_transition_to(Draining));
    }

    #[test]
    fn run_finds_small_mersenne_exponents() {
        let (mut orch, store, _) = toy(2);
        let summary = orch.run(&NeverStop).unwrap();
        assert_eq!(orch.phase(), Phase::Done);
        for p in [31, 61, 89, 107, 127] {
            assert!(summary.primes.contains(&p), "missing {} in {:?}", p, summary.primes);
        }
        assert!(summary.primes.iter().all(|p| [31, 61, 89, 107, 127].contains(p)));
        let state = store.load().unwrap();
        assert_eq!(state.total_primes_found, summary.primes.len() as u64);
        assert_eq!(state.last_exponent_tested, *summary.results.iter().map(|r| &r.exponent).max().unwrap());
        assert!(store.save_count() >= 2);
    }

    #[test]
    fn known_and_tested_exponents_are_skipped() {
        let store = Arc::new(MemoryStateStore::with_state(SearchState {
            last_exponent_tested: 50,
            ..Default::default()
        }));
        let mut orch = Orchestrator::new(
            Registry::truncated_at(31),
            toy_config(1),
            store,
            Arc::new(MemoryAppendLog::new()),
        );
        let summary = orch.execute(&[31, 41, 53, 53, 59], &NeverStop).unwrap();
        assert_eq!(summary.skipped_known, vec![31]);
        let tested: Vec<u64> = summary.results.iter().map(|r| r.exponent).collect();
        assert_eq!(tested.len(), 2);
        assert!(tested.contains(&53) && tested.contains(&59));
    }

    #[test]
    fn worker_panic_is_isolated() {
        let (orch, store, _) = toy(2);
        let mut orch = orch.with_tester(Arc::new(Flaky { bad: 41 }));
        let summary = orch.execute(&[37, 41, 43, 61], &NeverStop).unwrap();
        assert_eq!(summary.tested, 4);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, 41);
        assert!(summary.failures[0].1.contains("injected failure"));
        assert_eq!(summary.primes, vec![61]);
        assert_eq!(store.load().unwrap().last_exponent_tested, 61);
    }

    #[test]
    fn stop_before_start_defers_everything() {
        let (mut orch, store, _) = toy(2);
        let stop = AtomicBool::new(true);
        let summary = orch.execute(&[23, 29, 31], &stop).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.tested, 0);
        assert_eq!(summary.deferred, vec![23, 29, 31]);
        let state = store.load().unwrap();
        assert_eq!(state.last_exponent_tested, 0);
        assert_eq!(state.deferred_exponents.len(), 3);
    }

    #[test]
    fn timeouts_are_deferred_and_retried() {
        let store = Arc::new(MemoryStateStore::new());
        let config = toy_config(1);
        let mut orch = Orchestrator::new(
            Registry::truncated_at(19),
            config.clone(),
            store.clone(),
            Arc::new(MemoryAppendLog::new()),
        )
        .with_tester(Arc::new(LucasLehmer::new(Some(Duration::ZERO))));
        let first = orch.execute(&[4423], &NeverStop).unwrap();
        assert_eq!(first.timeouts, vec![4423]);
        assert_eq!(store.load().unwrap().deferred_exponents.len(), 1);

        // retried below the high-water mark, then cleared
        let mut orch = Orchestrator::new(
            Registry::truncated_at(19),
            config,
            store.clone(),
            Arc::new(MemoryAppendLog::new()),
        );
        let second = orch.execute(&[4423], &NeverStop).unwrap();
        assert_eq!(second.primes, vec![4423]);
        assert!(store.load().unwrap().deferred_exponents.is_empty());
    }

    #[test]
    fn duplicate_primes_are_logged_once() {
        let (orch, _, log) = toy(1);
        let mut orch = orch.with_tester(Arc::new(AlwaysPrime));
        orch.execute(&[101], &NeverStop).unwrap();
        let discoveries = DiscoveryLog::new(log.clone());
        assert_eq!(discoveries.entries().unwrap().len(), 1);
        // same exponent again via a fresh state
        let mut again = Orchestrator::new(
            Registry::truncated_at(19),
            toy_config(1),
            Arc::new(MemoryStateStore::new()),
            log.clone(),
        )
        .with_tester(Arc::new(AlwaysPrime));
        again.execute(&[101], &NeverStop).unwrap();
        assert_eq!(discoveries.entries().unwrap().len(), 1);
    }

    #[test]
    fn await_external_counts_on_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = VerifierConfig {
            enabled: true,
            worktodo_path: dir.path().join("worktodo.txt"),
            results_path: dir.path().join("results.txt"),
            ..Default::default()
        };
        let mut config = toy_config(1);
        config.policy = DiscoveryPolicy::AwaitExternal;
        let store = Arc::new(MemoryStateStore::new());
        let log = Arc::new(MemoryAppendLog::new());
        let mut orch = Orchestrator::new(Registry::truncated_at(19), config, store.clone(), log.clone())
            .with_bridge(VerificationBridge::from_config(&verifier).unwrap());

        let summary = orch.execute(&[31], &NeverStop).unwrap();
        assert_eq!(summary.primes, vec![31]);
        assert_eq!(store.load().unwrap().total_primes_found, 0);
        let work = std::fs::read_to_string(&verifier.worktodo_path).unwrap();
        assert_eq!(work, "Test=31\n");

        std::fs::write(&verifier.results_path, "M( 31 ) is prime!\n").unwrap();
        let batch = orch.sync_confirmations().unwrap();
        assert_eq!(batch.confirmed, vec![31]);
        let state = store.load().unwrap();
        assert_eq!(state.total_primes_found, 1);
        assert_eq!(state.verification_log_offset, 18);
        let latest = DiscoveryLog::new(log).latest().unwrap();
        assert!(latest[&31].verified_externally);

        // nothing new on a second sync
        assert!(orch.sync_confirmations().unwrap().is_empty());
        assert_eq!(store.load().unwrap().total_primes_found, 1);
    }

    #[test]
    fn broken_verifier_degrades_to_internal_only() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = VerifierConfig {
            enabled: true,
            // a directory cannot be appended to
            worktodo_path: dir.path().to_path_buf(),
            results_path: dir.path().join("results.txt"),
            ..Default::default()
        };
        let (orch, store, _) = toy(1);
        let mut orch = orch.with_bridge(VerificationBridge::from_config(&verifier).unwrap());
        let rx = orch.events().subscribe();
        let summary = orch.execute(&[61], &NeverStop).unwrap();
        assert_eq!(summary.primes, vec![61]);
        assert_eq!(store.load().unwrap().total_primes_found, 1);
        let warned = rx
            .try_iter()
            .any(|r| matches!(r.event, Event::Warning { ref context, .. } if context == "verifier"));
        assert!(warned);
    }

    #[test]
    fn persistence_failure_is_fatal() {
        struct BrokenStore;
        impl StateStore for BrokenStore {
            fn load(&self) -> anyhow::Result<SearchState> {
                Ok(SearchState::default())
            }
            fn save(&self, _: &SearchState) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }
        let mut orch = Orchestrator::new(
            Registry::truncated_at(19),
            toy_config(2),
            Arc::new(BrokenStore),
            Arc::new(MemoryAppendLog::new()),
        );
        let err = orch.execute(&[23, 29, 31, 37, 41, 43, 47], &NeverStop).unwrap_err();
        assert!(matches!(err, SearchError::Persistence(_)), "{err}");
    }

    #[test]
    fn batch_saves_defer_exponents_still_in_flight() {
        let store = Arc::new(RecordingStore::default());
        let mut config = toy_config(2);
        config.batch_size = 1;
        let mut orch = Orchestrator::new(
            Registry::truncated_at(19),
            config.clone(),
            store.clone(),
            Arc::new(MemoryAppendLog::new()),
        )
        .with_tester(Arc::new(HoldOne {
            held: 101,
            store: store.clone(),
        }));
        let summary = orch.execute(&[101, 103, 107, 109], &NeverStop).unwrap();
        assert_eq!(summary.tested, 4);

        for snap in store.held_snapshots() {
            assert!(
                snap.last_exponent_tested <= 101 || snap.is_deferred(101),
                "101 still running but saved as done: {:?}",
                snap
            );
            // resuming from that snapshot retests 101
            let resumed_store = Arc::new(MemoryStateStore::with_state(snap));
            let mut resumed = Orchestrator::new(
                Registry::truncated_at(19),
                config.clone(),
                resumed_store,
                Arc::new(MemoryAppendLog::new()),
            )
            .with_tester(Arc::new(AlwaysPrime));
            let again = resumed.execute(&[101, 103, 107, 109], &NeverStop).unwrap();
            assert!(again.results.iter().any(|r| r.exponent == 101));
        }

        let state = store.load().unwrap();
        assert_eq!(state.last_exponent_tested, 109);
        assert!(state.deferred_exponents.is_empty());
    }

    #[test]
    fn stop_during_last_test_is_reported() {
        let flag = Arc::new(AtomicBool::new(false));
        let (orch, _, _) = toy(1);
        let mut orch = orch.with_tester(Arc::new(StopsDuring { flag: flag.clone() }));
        let summary = orch.execute(&[23], &*flag).unwrap();
        assert_eq!(summary.tested, 1);
        assert!(summary.stopped);
        assert_eq!(orch.phase(), Phase::Done);
    }

    #[test]
    #[cfg(unix)]
    fn launched_verifier_is_reaped_at_session_end() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = VerifierConfig {
            enabled: true,
            worktodo_path: dir.path().join("worktodo.txt"),
            results_path: dir.path().join("results.txt"),
            binary: Some("true".into()),
            auto_launch: true,
            ..Default::default()
        };
        let (orch, _, _) = toy(1);
        let mut orch = orch.with_bridge(VerificationBridge::from_config(&verifier).unwrap());
        // nothing above the toy frontier, so the session only launches and reaps
        orch.config.windows = vec![SearchWindow { start: 3, end: 10 }];
        let rx = orch.events().subscribe();
        orch.run(&NeverStop).unwrap();
        assert!(orch.verifier.is_none());
        assert!(!rx
            .try_iter()
            .any(|r| matches!(r.event, Event::Warning { ref context, .. } if context == "verifier")));
    }

    #[test]
    fn invalid_window_is_rejected_before_work() {
        let (mut orch, store, _) = toy(1);
        orch.config.windows = vec![SearchWindow { start: 50, end: 40 }];
        let err = orch.run(&NeverStop).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.save_count(), 0);
    }
}
