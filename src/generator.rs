//! # Generator — Multi-Strategy Candidate Exponents
//!
//! Produces a [`CandidateSet`] of odd exponents in a window [start, end),
//! always strictly above the registry frontier and above an optional resume
//! floor (the persisted high-water mark), so a resumed session never sees an
//! exponent it already attempted.
//!
//! ## Strategies
//!
//! Each strategy fills a quota of ⌈count · weight⌉ new values:
//!
//! | Strategy | Weight | Source |
//! |----------|--------|--------|
//! | Exponential | 30% | growth-fit predictions, then a geometric ladder from the window start |
//! | Gap | 25% | frontier + k · mean gap |
//! | Residue | 20% | step 210 from the most frequent coprime residue class |
//! | Density | 15% | seeded sampling accepted in proportion to historical density |
//! | Twin | 10% | known exponents ± 2 |
//!
//! If the strategies under-produce, a seeded uniform backfill tops the set
//! up; windows holding few odd numbers are enumerated instead. The result is
//! deduplicated, sorted and truncated to `count`.
//!
//! With fewer than five known exponents the analysis is unavailable and only
//! the backfill runs.
//!
//! ## Determinism
//!
//! All randomness comes from `StdRng::seed_from_u64`, so identical inputs
//! (window, count, registry, seed, floor) yield identical sets.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::analysis::{self, PatternStats};
use crate::error::SearchError;
use crate::registry::Registry;

pub const DEFAULT_SEED: u64 = 42;

/// Primorial used by the residue strategy and the quality summary.
pub const RESIDUE_MODULUS: u64 = 210;

/// Windows with at most this many odd values per wanted candidate are
/// enumerated rather than sampled.
const ENUMERATE_FACTOR: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Exponential,
    Gap,
    Residue,
    Density,
    Twin,
    Backfill,
    Supplied,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Exponential => "exponential",
            Strategy::Gap => "gap",
            Strategy::Residue => "residue",
            Strategy::Density => "density",
            Strategy::Twin => "twin",
            Strategy::Backfill => "backfill",
            Strategy::Supplied => "supplied",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub exponent: u64,
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StrategyWeights {
    pub exponential: f64,
    pub gap: f64,
    pub residue: f64,
    pub density: f64,
    pub twin: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        StrategyWeights {
            exponential: 0.30,
            gap: 0.25,
            residue: 0.20,
            density: 0.15,
            twin: 0.10,
        }
    }
}

impl StrategyWeights {
    fn ordered(&self) -> [(Strategy, f64); 5] {
        [
            (Strategy::Exponential, self.exponential),
            (Strategy::Gap, self.gap),
            (Strategy::Residue, self.residue),
            (Strategy::Density, self.density),
            (Strategy::Twin, self.twin),
        ]
    }
}

/// Ascending, duplicate-free exponents in [start, end).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CandidateSet {
    start: u64,
    end: u64,
    candidates: Vec<Candidate>,
}

/// Residue-210 profile of a candidate set.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QualitySummary {
    pub size: usize,
    pub residue_210: BTreeMap<u64, usize>,
    pub preferred_residue: Option<u64>,
    pub preferred_share: f64,
    pub by_strategy: BTreeMap<Strategy, usize>,
}

impl CandidateSet {
    fn from_map(start: u64, end: u64, picked: BTreeMap<u64, Strategy>, count: usize) -> Self {
        let candidates = picked
            .into_iter()
            .take(count)
            .map(|(exponent, strategy)| Candidate { exponent, strategy })
            .collect();
        CandidateSet {
            start,
            end,
            candidates,
        }
    }

    /// Wrap externally chosen exponents, keeping only odd values in window.
    pub fn from_exponents(start: u64, end: u64, exponents: impl IntoIterator<Item = u64>) -> Self {
        let picked: BTreeMap<u64, Strategy> = exponents
            .into_iter()
            .filter(|&p| p % 2 == 1 && p >= start && p < end)
            .map(|p| (p, Strategy::Supplied))
            .collect();
        let n = picked.len();
        Self::from_map(start, end, picked, n)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn exponents(&self) -> Vec<u64> {
        self.candidates.iter().map(|c| c.exponent).collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Residue distribution against the registry's preferred class mod 210.
    pub fn quality(&self, stats: Option<&PatternStats>) -> QualitySummary {
        let mut summary = QualitySummary {
            size: self.candidates.len(),
            ..Default::default()
        };
        for c in &self.candidates {
            *summary
                .residue_210
                .entry(c.exponent % RESIDUE_MODULUS)
                .or_default() += 1;
            *summary.by_strategy.entry(c.strategy).or_default() += 1;
        }
        summary.preferred_residue =
            stats.and_then(|s| s.residues.preferred_coprime(RESIDUE_MODULUS));
        if let (Some(r), false) = (summary.preferred_residue, self.candidates.is_empty()) {
            let hits = summary.residue_210.get(&r).copied().unwrap_or(0);
            summary.preferred_share = hits as f64 / self.candidates.len() as f64;
        }
        summary
    }
}

#[derive(Clone, Debug)]
pub struct CandidateGenerator {
    registry: Registry,
    stats: Option<PatternStats>,
    weights: StrategyWeights,
    seed: u64,
    floor: u64,
}

impl CandidateGenerator {
    pub fn new(registry: &Registry) -> Self {
        let stats = match analysis::analyze(registry) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(error = %e, "pattern analysis unavailable, using backfill only");
                None
            }
        };
        CandidateGenerator {
            registry: registry.clone(),
            stats,
            weights: StrategyWeights::default(),
            seed: DEFAULT_SEED,
            floor: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_weights(mut self, weights: StrategyWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Never return exponents at or below `last_tested`.
    pub fn with_floor(mut self, last_tested: u64) -> Self {
        self.floor = last_tested;
        self
    }

    pub fn stats(&self) -> Option<&PatternStats> {
        self.stats.as_ref()
    }

    pub fn generate(&self, start: u64, end: u64, count: usize) -> Result<CandidateSet, SearchError> {
        if count == 0 {
            return Err(SearchError::InvalidCount);
        }
        if start >= end {
            return Err(SearchError::InvalidWindow { start, end });
        }

        let floor = self.registry.frontier().max(self.floor);
        let eff_start = start.max(floor.saturating_add(1));
        if eff_start >= end {
            return Ok(CandidateSet {
                start,
                end,
                candidates: Vec::new(),
            });
        }

        // never plan for more candidates than the window has odd values
        let room = odd_count(eff_start, end);
        let count = count.min(usize::try_from(room).unwrap_or(usize::MAX));

        let mut picker = Picker {
            lo: eff_start,
            hi: end,
            picked: BTreeMap::new(),
        };

        if let Some(stats) = &self.stats {
            for (strategy, weight) in self.weights.ordered() {
                let quota = (count as f64 * weight.max(0.0)).ceil() as usize;
                if quota == 0 {
                    continue;
                }
                let added = match strategy {
                    Strategy::Exponential => picker.take(exponential(stats, eff_start, end), quota, strategy),
                    Strategy::Gap => picker.take(gap_steps(stats, eff_start, end), quota, strategy),
                    Strategy::Residue => picker.take(residue_steps(stats, eff_start, end), quota, strategy),
                    Strategy::Density => {
                        let samples = self.density_samples(stats, eff_start, end, quota);
                        picker.take(samples, quota, strategy)
                    }
                    Strategy::Twin => picker.take(twins(&self.registry), quota, strategy),
                    Strategy::Backfill | Strategy::Supplied => 0,
                };
                debug!(%strategy, quota, added, "strategy pass");
            }
        }

        if picker.picked.len() < count {
            let needed = count - picker.picked.len();
            let added = self.backfill(&mut picker, needed);
            debug!(needed, added, "backfill pass");
        }

        Ok(CandidateSet::from_map(start, end, picker.picked, count))
    }

    /// Lazy rejection sampling weighted by decade density; the picker stops
    /// pulling once its quota is filled.
    fn density_samples<'s>(
        &self,
        stats: &'s PatternStats,
        lo: u64,
        hi: u64,
        quota: usize,
    ) -> impl Iterator<Item = u64> + 's {
        let max = stats.max_density();
        let mut rng = StdRng::seed_from_u64(self.seed ^ 0x5DEE_CE66);
        (0..quota.saturating_mul(32)).filter_map(move |_| {
            let v = rng.gen_range(lo..hi);
            let weight = if max > 0.0 {
                (stats.density_at(v) / max).max(0.1)
            } else {
                0.1
            };
            (rng.gen::<f64>() < weight).then_some(v)
        })
    }

    fn backfill(&self, picker: &mut Picker, needed: usize) -> usize {
        let (lo, hi) = (picker.lo, picker.hi);
        if odd_count(lo, hi) <= (needed as u64).saturating_mul(ENUMERATE_FACTOR) {
            let odds = ((lo | 1)..hi).step_by(2);
            return picker.take(odds, needed, Strategy::Backfill);
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let samples = (0..needed.saturating_mul(64)).map(move |_| rng.gen_range(lo..hi));
        picker.take(samples, needed, Strategy::Backfill)
    }
}

/// Accumulates odd, in-window, unseen values.
struct Picker {
    lo: u64,
    hi: u64,
    picked: BTreeMap<u64, Strategy>,
}

impl Picker {
    fn take(&mut self, raw: impl IntoIterator<Item = u64>, quota: usize, strategy: Strategy) -> usize {
        let mut added = 0;
        for v in raw {
            if added >= quota {
                break;
            }
            let v = v | 1;
            if v < self.lo || v >= self.hi || self.picked.contains_key(&v) {
                continue;
            }
            self.picked.insert(v, strategy);
            added += 1;
        }
        added
    }
}

/// Growth-fit predictions in window, then a geometric ladder from `lo`.
fn exponential(stats: &PatternStats, lo: u64, hi: u64) -> Vec<u64> {
    let mut out: Vec<u64> = stats
        .predictions(16)
        .into_iter()
        .filter(|&v| v >= lo && v < hi)
        .collect();
    let ratio = 1.0 + (stats.growth.slope / 10.0).clamp(1e-4, 0.5);
    let mut v = lo as f64;
    while v < hi as f64 && out.len() < 4096 {
        out.push(v as u64);
        v = (v * ratio).max(v + 2.0);
    }
    out
}

fn gap_steps(stats: &PatternStats, lo: u64, hi: u64) -> impl Iterator<Item = u64> {
    let frontier = stats.frontier;
    let gap = stats.gaps.mean.max(2.0);
    let k0 = ((lo.saturating_sub(frontier)) as f64 / gap).ceil().max(1.0) as u64;
    (k0..)
        .map(move |k| frontier + (k as f64 * gap).round() as u64)
        .take_while(move |&v| v < hi)
}

fn residue_steps(stats: &PatternStats, lo: u64, hi: u64) -> impl Iterator<Item = u64> {
    let first = stats
        .residues
        .preferred_coprime(RESIDUE_MODULUS)
        .map(|r| lo + (r + RESIDUE_MODULUS - lo % RESIDUE_MODULUS) % RESIDUE_MODULUS);
    first
        .into_iter()
        .flat_map(move |f| (f..hi).step_by(RESIDUE_MODULUS as usize))
}

/// Odd integers in `[lo, hi)`.
fn odd_count(lo: u64, hi: u64) -> u64 {
    (hi.saturating_sub(lo) + (lo % 2)) / 2
}

fn twins(registry: &Registry) -> Vec<u64> {
    registry
        .iter()
        .flat_map(|p| [p.saturating_sub(2), p + 2])
        .collect()
}
