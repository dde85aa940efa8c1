//! # Lucas–Lehmer — Deterministic Primality Proof for 2^p − 1
//!
//! For an odd prime p, M = 2^p − 1 is prime iff s_{p−2} ≡ 0 (mod M), where
//! s_0 = 4 and s_{k+1} = s_k² − 2. The test is a proof, not a probable-prime
//! screen: if the loop completes, the verdict is exact.
//!
//! ## Mersenne Reduction
//!
//! Because 2^p ≡ 1 (mod M), any x reduces as x ≡ (x mod 2^p) + ⌊x / 2^p⌋,
//! i.e. one mask and one shift instead of a full division. At most two folds
//! bring a square back below 2^p; a final compare maps M itself to 0.
//!
//! ## Budget and Cancellation
//!
//! Elapsed time and the stop signal are checked at a checkpoint: every
//! iteration for p < 10,000; above that every 10^7 / p iterations, at most
//! 1,000 apart, so exponents past 10 million are checked every iteration.
//! Exceeding the budget or seeing a stop yields `Verdict::Timeout`, which
//! asserts nothing about M. A run can only be abandoned between checkpoints.
//!
//! ## Complexity
//!
//! p − 2 squarings of p-bit integers, O(p · M(p)) with GMP's FFT multiply.
//! Exponents in the tens of millions take days here; those are delegated to
//! the external verifier.
//!
//! ## References
//!
//! - D. H. Lehmer, "An Extended Theory of Lucas' Functions", Annals of
//!   Mathematics, 31(3), 1930.
//! - R. Crandall, C. Pomerance, "Prime Numbers: A Computational Perspective",
//!   2nd ed., §4.2.1.

use chrono::{DateTime, Utc};
use rug::{Assign, Integer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{NeverStop, StopSignal};

/// Exponents below this check the clock every iteration.
pub const SMALL_EXPONENT: u64 = 10_000;
/// Upper bound on iterations between checkpoints.
pub const CHECK_INTERVAL: u64 = 1_000;
/// Large p checkpoint every `CHECK_WORK_BITS / p` iterations, clamped to
/// `1..=CHECK_INTERVAL`.
const CHECK_WORK_BITS: u64 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Prime,
    Composite,
    Timeout,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Prime => write!(f, "PRIME"),
            Verdict::Composite => write!(f, "COMPOSITE"),
            Verdict::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlOutcome {
    pub exponent: u64,
    pub verdict: Verdict,
    pub iterations: u64,
    pub elapsed: Duration,
    /// Low 64 bits of the final residue; 0 for a prime. None on timeout.
    pub residue64: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

impl LlOutcome {
    /// RES64 as printed by GIMPS clients.
    pub fn res64_hex(&self) -> Option<String> {
        self.residue64.map(|r| format!("{:016X}", r))
    }
}

/// Coarse progress report, emitted at fixed fractions of the run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LlProgress {
    pub exponent: u64,
    pub iteration: u64,
    pub total: u64,
    pub fraction: f64,
}

#[derive(Clone, Debug)]
pub struct LucasLehmer {
    budget: Option<Duration>,
    progress_step: f64,
}

impl Default for LucasLehmer {
    fn default() -> Self {
        LucasLehmer {
            budget: None,
            progress_step: 0.05,
        }
    }
}

/// Run the test with a wall-clock budget and no cancellation.
pub fn test(p: u64, budget: Option<Duration>) -> Verdict {
    LucasLehmer::new(budget)
        .run(p, &NeverStop, &mut |_| {})
        .verdict
}

impl LucasLehmer {
    pub fn new(budget: Option<Duration>) -> Self {
        LucasLehmer {
            budget,
            ..Default::default()
        }
    }

    /// Fraction of the run between progress callbacks (clamped to (0, 1]).
    pub fn with_progress_step(mut self, step: f64) -> Self {
        self.progress_step = if step.is_finite() && step > 0.0 {
            step.min(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    pub fn run(
        &self,
        p: u64,
        stop: &dyn StopSignal,
        on_progress: &mut dyn FnMut(LlProgress),
    ) -> LlOutcome {
        let start = Instant::now();
        let done = |verdict: Verdict, iterations: u64, residue64: Option<u64>| LlOutcome {
            exponent: p,
            verdict,
            iterations,
            elapsed: start.elapsed(),
            residue64,
            finished_at: Utc::now(),
        };

        if p < 2 {
            return done(Verdict::Composite, 0, None);
        }
        if p == 2 {
            return done(Verdict::Prime, 0, Some(0));
        }
        let bits = match u32::try_from(p) {
            Ok(b) => b,
            Err(_) => {
                warn!(exponent = p, "exponent exceeds in-process LL range, deferring");
                return done(Verdict::Timeout, 0, None);
            }
        };

        let modulus = (Integer::from(1) << bits) - 1u32;
        let total = p - 2;
        let check_every = if p < SMALL_EXPONENT {
            1
        } else {
            (CHECK_WORK_BITS / p).clamp(1, CHECK_INTERVAL)
        };
        let progress_every = ((total as f64 * self.progress_step).ceil() as u64).max(1);

        let mut s = Integer::from(4);
        let mut hi = Integer::new();

        for i in 1..=total {
            s.square_mut();
            s -= 2u32;
            reduce(&mut s, bits, &modulus, &mut hi);

            if i % check_every == 0 && i < total {
                if let Some(budget) = self.budget {
                    if start.elapsed() >= budget {
                        debug!(exponent = p, iteration = i, "LL budget exceeded");
                        return done(Verdict::Timeout, i, None);
                    }
                }
                if stop.is_stop_requested() {
                    debug!(exponent = p, iteration = i, "LL stopped at checkpoint");
                    return done(Verdict::Timeout, i, None);
                }
            }
            if i % progress_every == 0 || i == total {
                on_progress(LlProgress {
                    exponent: p,
                    iteration: i,
                    total,
                    fraction: i as f64 / total as f64,
                });
            }
        }

        let residue64 = s.to_u64_wrapping();
        let verdict = if s == 0 {
            Verdict::Prime
        } else {
            Verdict::Composite
        };
        done(verdict, total, Some(residue64))
    }
}

/// Reduce s into [0, M) using 2^p ≡ 1 (mod M).
fn reduce(s: &mut Integer, bits: u32, modulus: &Integer, hi: &mut Integer) {
    if *s < 0 {
        *s += modulus;
    }
    while s.significant_bits() > bits {
        hi.assign(&*s >> bits);
        s.keep_bits_mut(bits);
        *s += &*hi;
    }
    if *s == *modulus {
        s.assign(0);
    }
}
