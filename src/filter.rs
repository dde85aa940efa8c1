//! # Filter — Cheap Admissibility Checks on Exponents
//!
//! 2^p − 1 can only be prime when p itself is prime, so every exponent gets a
//! short-circuit sequence of rejections before the Lucas–Lehmer test:
//!
//! 1. odd
//! 2. strictly above the frontier
//! 3. p mod 4 ∈ {1, 3}
//! 4. p mod 6 ∈ {1, 5} (p > 3)
//! 5. last decimal digit ∈ {1, 3, 7, 9} (p > 5)
//! 6. Miller–Rabin on p
//! 7. optional trial factoring of 2^p − 1
//!
//! ## Miller–Rabin Witness Sets
//!
//! | Bound | Witnesses | Status |
//! |-------|-----------|--------|
//! | p < 1,373,653 | {2, 3} | deterministic |
//! | p < 9,080,191 | {31, 73} | deterministic |
//! | p < 4,759,123,141 | {2, 7, 61} | deterministic |
//! | above | GMP, 25 rounds | probabilistic |
//!
//! A failed round proves p composite, and then 2^p − 1 is composite too, so
//! a Miller–Rabin failure is a hard rejection. Passing is a screen only: the
//! Lucas–Lehmer test is the proof.
//!
//! ## Trial Factoring
//!
//! Any prime factor q of 2^p − 1 (p an odd prime) has the form q = 2kp + 1 and
//! satisfies q ≡ ±1 (mod 8). Candidates q are walked in k order up to
//! 2^bits, skipping those with a small prime factor, and 2^p mod q is checked.

use rayon::prelude::*;
use rug::Integer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::generator::{Candidate, CandidateSet};
use crate::registry::Registry;
use crate::sieve::{mul_mod, pow_mod};

/// Rounds for the GMP test above the deterministic bounds.
pub const PROBABILISTIC_ROUNDS: u32 = 25;

/// Trial-factoring depth is capped so q stays in u64 arithmetic.
pub const MAX_TRIAL_FACTOR_BITS: u32 = 63;

const SMALL_PRIMES: [u64; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// Why an exponent was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Rejection {
    Even,
    AtOrBelowFrontier,
    Mod4,
    Mod6,
    LastDigit,
    CompositeExponent,
    KnownFactor { factor: u64 },
}

impl Rejection {
    /// Stable key, the same as the serialized `reason` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Even => "even",
            Rejection::AtOrBelowFrontier => "at_or_below_frontier",
            Rejection::Mod4 => "mod4",
            Rejection::Mod6 => "mod6",
            Rejection::LastDigit => "last_digit",
            Rejection::CompositeExponent => "composite_exponent",
            Rejection::KnownFactor { .. } => "known_factor",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Even => write!(f, "even"),
            Rejection::AtOrBelowFrontier => write!(f, "at or below frontier"),
            Rejection::Mod4 => write!(f, "p mod 4 not in {{1,3}}"),
            Rejection::Mod6 => write!(f, "p mod 6 not in {{1,5}}"),
            Rejection::LastDigit => write!(f, "last digit not in {{1,3,7,9}}"),
            Rejection::CompositeExponent => write!(f, "exponent is composite"),
            Rejection::KnownFactor { factor } => write!(f, "2^p-1 has factor {}", factor),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FastFilter {
    frontier: u64,
    trial_factor_bits: u32,
}

/// Admitted candidates plus per-reason rejection counts.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FilterReport {
    pub admitted: Vec<Candidate>,
    pub rejected: BTreeMap<String, usize>,
}

impl FastFilter {
    pub fn new(registry: &Registry) -> Self {
        FastFilter {
            frontier: registry.frontier(),
            trial_factor_bits: 0,
        }
    }

    /// Enable trial factoring of 2^p − 1 up to `bits` (0 disables).
    pub fn with_trial_factoring(mut self, bits: u32) -> Self {
        self.trial_factor_bits = bits.min(MAX_TRIAL_FACTOR_BITS);
        self
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn is_admissible(&self, p: u64) -> bool {
        self.check(p).is_ok()
    }

    /// Run the checks in order, stopping at the first rejection.
    pub fn check(&self, p: u64) -> Result<(), Rejection> {
        if p % 2 == 0 {
            return Err(Rejection::Even);
        }
        if p <= self.frontier {
            return Err(Rejection::AtOrBelowFrontier);
        }
        if !matches!(p % 4, 1 | 3) {
            return Err(Rejection::Mod4);
        }
        if p > 3 && !matches!(p % 6, 1 | 5) {
            return Err(Rejection::Mod6);
        }
        if p > 5 && !matches!(p % 10, 1 | 3 | 7 | 9) {
            return Err(Rejection::LastDigit);
        }
        if !is_probable_prime(p) {
            return Err(Rejection::CompositeExponent);
        }
        if self.trial_factor_bits > 0 {
            if let Some(factor) = trial_factor(p, self.trial_factor_bits) {
                return Err(Rejection::KnownFactor { factor });
            }
        }
        Ok(())
    }

    /// Filter a whole candidate set in parallel, preserving order.
    pub fn filter_set(&self, set: &CandidateSet) -> FilterReport {
        let verdicts: Vec<(Candidate, Result<(), Rejection>)> = set
            .candidates()
            .par_iter()
            .map(|c| (*c, self.check(c.exponent)))
            .collect();

        let mut report = FilterReport::default();
        for (c, verdict) in verdicts {
            match verdict {
                Ok(()) => report.admitted.push(c),
                Err(r) => *report.rejected.entry(r.as_str().to_string()).or_default() += 1,
            }
        }
        report
    }
}

/// Miller–Rabin on p with the witness set for its size.
pub fn is_probable_prime(p: u64) -> bool {
    match p {
        0 | 1 => false,
        2 | 3 => true,
        _ if p % 2 == 0 => false,
        _ if p < 1_373_653 => miller_rabin(p, &[2, 3]),
        _ if p < 9_080_191 => miller_rabin(p, &[31, 73]),
        _ if p < 4_759_123_141 => miller_rabin(p, &[2, 7, 61]),
        _ => crate::mr_screened_test(&Integer::from(p), PROBABILISTIC_ROUNDS)
            != rug::integer::IsPrime::No,
    }
}

/// Strong probable-prime test of odd n > 3 to each witness.
fn miller_rabin(n: u64, witnesses: &[u64]) -> bool {
    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for &a in witnesses {
        let a = a % n;
        if a == 0 {
            continue;
        }
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Smallest factor q = 2kp + 1 < 2^bits of 2^p − 1, if any. `p` must be an
/// odd prime for the factor form to hold.
pub fn trial_factor(p: u64, bits: u32) -> Option<u64> {
    let bits = bits.min(MAX_TRIAL_FACTOR_BITS);
    let mut limit = 1u64 << bits;
    // 2^p − 1 itself has the factor form; only proper factors count
    if p < 64 {
        limit = limit.min((1u64 << p) - 1);
    }
    let step = p.checked_mul(2)?;
    let mut q = step.checked_add(1)?;
    while q < limit {
        if matches!(q % 8, 1 | 7)
            && !SMALL_PRIMES.iter().any(|&s| q % s == 0 && q != s)
            && pow_mod(2, p, q) == 1
        {
            return Some(q);
        }
        q = q.checked_add(step)?;
    }
    None
}
