//! # Registry — Confirmed Mersenne Prime Exponents
//!
//! An immutable, ascending list of exponents p for which 2^p − 1 is a
//! confirmed Mersenne prime. The largest entry is the search *frontier*:
//! nothing at or below it is ever a candidate.
//!
//! The registry is a plain value. Analysis, generation and filtering all take
//! it by reference at call time; there is no process-wide copy.
//!
//! ## References
//!
//! - OEIS: [A000043](https://oeis.org/A000043) — Mersenne exponents.
//! - GIMPS milestones: <https://www.mersenne.org/primes/>

use std::sync::Arc;

/// All 52 confirmed Mersenne prime exponents, ascending.
pub const KNOWN_EXPONENTS: [u64; 52] = [
    2, 3, 5, 7, 13, 17, 19, 31, 61, 89, 107, 127, 521, 607, 1279, 2203, 2281, 3217, 4253, 4423,
    9689, 9941, 11213, 19937, 21701, 23209, 44497, 86243, 110503, 132049, 216091, 756839, 859433,
    1257787, 1398269, 2976221, 3021377, 6972593, 13466917, 20996011, 24036583, 25964951, 30402457,
    32582657, 37156667, 42643801, 43112609, 57885161, 74207281, 77232917, 82589933, 136279841,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    exponents: Arc<[u64]>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::known()
    }
}

impl Registry {
    /// The registry of all confirmed exponents.
    pub fn known() -> Self {
        Registry {
            exponents: Arc::from(&KNOWN_EXPONENTS[..]),
        }
    }

    /// Build a registry from arbitrary exponents. Input is sorted and
    /// deduplicated; zero and one are dropped (2^0−1 and 2^1−1 are not prime).
    pub fn from_exponents(exponents: impl IntoIterator<Item = u64>) -> Self {
        let mut v: Vec<u64> = exponents.into_iter().filter(|&p| p >= 2).collect();
        v.sort_unstable();
        v.dedup();
        Registry {
            exponents: Arc::from(v),
        }
    }

    /// The known registry cut off at `frontier` (inclusive). Used to replay
    /// the search as it stood when `frontier` was the largest known exponent.
    pub fn truncated_at(frontier: u64) -> Self {
        Self::from_exponents(KNOWN_EXPONENTS.iter().copied().filter(|&p| p <= frontier))
    }

    /// Largest confirmed exponent, or 0 for an empty registry.
    pub fn frontier(&self) -> u64 {
        self.exponents.last().copied().unwrap_or(0)
    }

    pub fn contains(&self, p: u64) -> bool {
        self.exponents.binary_search(&p).is_ok()
    }

    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.exponents
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.exponents.iter().copied()
    }
}
