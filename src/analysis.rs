//! # Analysis — Statistics of the Known Exponents
//!
//! Pure function of a [`Registry`]. Produces the numbers the candidate
//! generator steers by:
//!
//! - **Gap statistics** between consecutive exponents (mean, population
//!   standard deviation, min, max, median).
//! - **Log-linear growth fit**: least squares of ln(p_i) against the 1-based
//!   index i. Mersenne exponents grow roughly geometrically, so the slope is
//!   the per-index growth rate and `predict(n + k)` extrapolates.
//! - **Residue tables** modulo the primorials 6, 30 and 210.
//! - **Digit growth** of the exponents' decimal length over the ten most
//!   recent entries.
//! - **Density per decade** and the **twin rate** (consecutive exponents two
//!   apart).
//!
//! Fewer than [`MIN_EXPONENTS`] entries is reported as
//! `SearchError::InsufficientData` rather than producing degenerate statistics.
//!
//! ## Heuristics
//!
//! Wagstaff's conjecture puts the expected number of Mersenne primes with
//! exponent in [a, b) at (e^γ / ln 2) · ln(b / a) ≈ 2.5695 · ln(b / a). The
//! prime-number-theorem and Cramér estimates are included for ranking only.
//!
//! ## References
//!
//! - S. S. Wagstaff Jr., "Divisors of Mersenne Numbers", Math. Comp. 40, 1983.
//! - H. Cramér, "On the order of magnitude of the difference between
//!   consecutive prime numbers", Acta Arith. 2, 1936.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::SearchError;
use crate::registry::Registry;
use crate::sieve;

/// Minimum registry size for meaningful statistics.
pub const MIN_EXPONENTS: usize = 5;

/// Number of most recent exponents used for digit growth.
const RECENT_WINDOW: usize = 10;

/// Euler–Mascheroni constant.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Clone, Debug, Serialize)]
pub struct GapStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: u64,
    pub max: u64,
    pub median: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct GrowthFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Mean of ln(p_i) − ln(p_{i−1}).
    pub mean_step: f64,
}

impl GrowthFit {
    /// Fitted exponent at 1-based `index`.
    pub fn predict(&self, index: usize) -> f64 {
        (self.intercept + self.slope * index as f64).exp()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ResidueTables {
    pub mod_6: BTreeMap<u64, usize>,
    pub mod_30: BTreeMap<u64, usize>,
    pub mod_210: BTreeMap<u64, usize>,
}

impl ResidueTables {
    pub fn table(&self, modulus: u64) -> Option<&BTreeMap<u64, usize>> {
        match modulus {
            6 => Some(&self.mod_6),
            30 => Some(&self.mod_30),
            210 => Some(&self.mod_210),
            _ => None,
        }
    }

    /// Most frequent residue; ties go to the smallest residue.
    pub fn preferred(&self, modulus: u64) -> Option<u64> {
        most_frequent(self.table(modulus)?.iter())
    }

    /// Most frequent residue coprime to the modulus. Residues sharing a
    /// factor with the modulus (from the tiny exponents 2, 3, 5, 7) can never
    /// hold another prime, so they are skipped.
    pub fn preferred_coprime(&self, modulus: u64) -> Option<u64> {
        most_frequent(
            self.table(modulus)?
                .iter()
                .filter(|(&r, _)| sieve::gcd(r, modulus) == 1),
        )
    }
}

fn most_frequent<'a>(entries: impl Iterator<Item = (&'a u64, &'a usize)>) -> Option<u64> {
    entries
        .fold(None, |best: Option<(u64, usize)>, (&r, &n)| match best {
            Some((_, bn)) if bn >= n => best,
            _ => Some((r, n)),
        })
        .map(|(r, _)| r)
}

#[derive(Clone, Debug, Serialize)]
pub struct DensityBin {
    pub start: u64,
    pub end: u64,
    pub count: usize,
    pub density: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PatternStats {
    pub count: usize,
    pub frontier: u64,
    pub gaps: GapStats,
    pub growth: GrowthFit,
    pub residues: ResidueTables,
    pub digit_growth_rate: f64,
    pub density: Vec<DensityBin>,
    pub twin_rate: f64,
}

impl PatternStats {
    /// Historical density of the decade containing `v`; 0 beyond the data.
    pub fn density_at(&self, v: u64) -> f64 {
        self.density
            .iter()
            .find(|b| b.start <= v && v < b.end)
            .map_or(0.0, |b| b.density)
    }

    pub fn max_density(&self) -> f64 {
        self.density.iter().map(|b| b.density).fold(0.0, f64::max)
    }

    /// Extrapolate the next `k` exponents from the growth fit.
    pub fn predictions(&self, k: usize) -> Vec<u64> {
        (1..=k)
            .map(|i| self.growth.predict(self.count + i).round() as u64)
            .collect()
    }
}

/// Compute all statistics for `registry`.
pub fn analyze(registry: &Registry) -> Result<PatternStats, SearchError> {
    let exps = registry.as_slice();
    if exps.len() < MIN_EXPONENTS {
        return Err(SearchError::InsufficientData {
            have: exps.len(),
            need: MIN_EXPONENTS,
        });
    }

    Ok(PatternStats {
        count: exps.len(),
        frontier: registry.frontier(),
        gaps: gap_stats(exps),
        growth: growth_fit(exps),
        residues: residue_tables(exps),
        digit_growth_rate: digit_growth_rate(exps),
        density: density_bins(exps),
        twin_rate: twin_rate(exps),
    })
}

fn gap_stats(exps: &[u64]) -> GapStats {
    let mut gaps: Vec<u64> = exps.windows(2).map(|w| w[1] - w[0]).collect();
    let n = gaps.len() as f64;
    let mean = gaps.iter().map(|&g| g as f64).sum::<f64>() / n;
    let var = gaps.iter().map(|&g| (g as f64 - mean).powi(2)).sum::<f64>() / n;
    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) as f64 / 2.0
    } else {
        gaps[mid] as f64
    };
    GapStats {
        mean,
        std_dev: var.sqrt(),
        min: gaps[0],
        max: gaps[gaps.len() - 1],
        median,
    }
}

fn growth_fit(exps: &[u64]) -> GrowthFit {
    let n = exps.len() as f64;
    let ys: Vec<f64> = exps.iter().map(|&p| (p as f64).ln()).collect();
    let xs: Vec<f64> = (1..=exps.len()).map(|i| i as f64).collect();

    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
    let sum_x2: f64 = xs.iter().map(|x| x * x).sum();

    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_x2 - sum_x * sum_x);
    let intercept = (sum_y - slope * sum_x) / n;

    let mean_y = sum_y / n;
    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    let mean_step = ys.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / (n - 1.0);

    GrowthFit {
        slope,
        intercept,
        r_squared,
        mean_step,
    }
}

fn residue_tables(exps: &[u64]) -> ResidueTables {
    let mut t = ResidueTables::default();
    for &p in exps {
        *t.mod_6.entry(p % 6).or_default() += 1;
        *t.mod_30.entry(p % 30).or_default() += 1;
        *t.mod_210.entry(p % 210).or_default() += 1;
    }
    t
}

fn decimal_len(p: u64) -> usize {
    p.checked_ilog10().map_or(1, |d| d as usize + 1)
}

fn digit_growth_rate(exps: &[u64]) -> f64 {
    let recent = &exps[exps.len().saturating_sub(RECENT_WINDOW)..];
    let first = decimal_len(recent[0]) as f64;
    let last = decimal_len(recent[recent.len() - 1]) as f64;
    (last - first) / recent.len() as f64
}

fn density_bins(exps: &[u64]) -> Vec<DensityBin> {
    let top = exps[exps.len() - 1];
    let mut bins = Vec::new();
    let mut start = 1u64;
    while start <= top {
        let end = start.saturating_mul(10);
        let count = exps.iter().filter(|&&p| start <= p && p < end).count();
        bins.push(DensityBin {
            start,
            end,
            count,
            density: count as f64 / (end - start) as f64,
        });
        start = end;
    }
    bins
}

fn twin_rate(exps: &[u64]) -> f64 {
    let twins = exps.windows(2).filter(|w| w[1] - w[0] == 2).count();
    twins as f64 / (exps.len() - 1) as f64
}

/// π(x) ≈ x / ln x.
pub fn pnt_estimate(x: f64) -> f64 {
    if x < 3.0 {
        return 0.0;
    }
    x / x.ln()
}

/// Expected prime gap near x under Cramér's model, (ln x)².
pub fn cramer_gap(x: f64) -> f64 {
    if x < 3.0 {
        return 1.0;
    }
    x.ln().powi(2)
}

/// Expected number of Mersenne primes with exponent in [a, b).
pub fn expected_mersenne_primes(a: u64, b: u64) -> f64 {
    if a < 2 || b <= a {
        return 0.0;
    }
    EULER_GAMMA.exp() / std::f64::consts::LN_2 * (b as f64 / a as f64).ln()
}
