pub mod analysis;
pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod filter;
pub mod generator;
pub mod lucas_lehmer;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod sieve;
pub mod store;

pub use error::SearchError;

use rug::Integer;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation. Workers poll this between units of work and at
/// Lucas–Lehmer checkpoints; nothing is interrupted mid-iteration.
pub trait StopSignal: Send + Sync {
    fn is_stop_requested(&self) -> bool;
}

impl StopSignal for AtomicBool {
    fn is_stop_requested(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// A signal that never fires.
pub struct NeverStop;

impl StopSignal for NeverStop {
    fn is_stop_requested(&self) -> bool {
        false
    }
}

/// Miller-Rabin with a cheap 2-round pre-screen before the full test.
pub fn mr_screened_test(candidate: &Integer, mr_rounds: u32) -> rug::integer::IsPrime {
    use rug::integer::IsPrime;
    if mr_rounds > 2 && candidate.is_probably_prime(2) == IsPrime::No {
        return IsPrime::No;
    }
    candidate.is_probably_prime(mr_rounds)
}

/// Decimal digits of 2^p − 1: ⌊p·log10 2⌋ + 1. No power of two ends in 0,
/// so subtracting one never drops a digit.
pub fn mersenne_digits(p: u64) -> u64 {
    if p == 0 {
        return 1;
    }
    (p as f64 * std::f64::consts::LOG10_2).floor() as u64 + 1
}

/// Exact decimal digit count (expensive for very large numbers).
pub fn exact_digits(n: &Integer) -> u64 {
    n.to_string_radix(10).len() as u64
}
