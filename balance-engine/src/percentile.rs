//! Percentile engine: expectations and order statistics over exact or
//! simulated outcome distributions.
//!
//! Simulated batches use the nearest-rank convention with no interpolation:
//! percentile `q` over `N` sorted trials is the value at 1-indexed rank
//! `ceil(q * N)`. A small slack ([`RANK_EPSILON`]) is subtracted from `q * N`
//! before the ceiling so that floating products such as `0.07 * 100` resolve
//! to rank 7 rather than 8. Exact distributions report the smallest outcome
//! `k` with `P(X <= k) >= q`, which is the same convention in the limit.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{CDF_EPSILON, RANK_EPSILON};
use crate::error::{BalanceError, Result};
use crate::numbers::{ceil_f64_to_u64, ceil_rank, u64_to_f64, usize_to_f64};
use crate::rng::{TrialRng, derive_stream_seed, trial_rng};

/// Label for a percentile, e.g. `0.9 -> "p90"`, `0.995 -> "p99.5"`.
///
/// Percent values keep up to three decimals, so nearby requests stay distinct.
#[must_use]
pub fn percentile_label(q: f64) -> String {
    let percent = format!("{:.3}", (q * 100_000.0).round() / 1_000.0);
    let trimmed = percent.trim_end_matches('0').trim_end_matches('.');
    format!("p{trimmed}")
}

/// Percent value encoded in a label produced by [`percentile_label`].
#[must_use]
pub fn label_rank(label: &str) -> Option<f64> {
    label.strip_prefix('p')?.parse().ok()
}

/// Labels ordered by the percentile they name rather than as text, so `p100`
/// sorts after `p50`.
pub fn ordered_labels<'a, I>(labels: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut ordered: Vec<&str> = labels.into_iter().map(String::as_str).collect();
    ordered.sort_by(|a, b| {
        label_rank(a)
            .unwrap_or(f64::INFINITY)
            .total_cmp(&label_rank(b).unwrap_or(f64::INFINITY))
            .then_with(|| a.cmp(b))
    });
    ordered
}

/// Check a requested percentile list.
///
/// # Errors
///
/// Returns `BalanceError::Config` if the list is empty, any entry is outside
/// `(0, 1]`, or two entries share a label.
pub fn validate_percentiles(field: &str, percentiles: &[f64]) -> Result<()> {
    if percentiles.is_empty() {
        return Err(BalanceError::config(field, "at least one percentile is required"));
    }
    if let Some(idx) = percentiles.iter().position(|q| !(*q > 0.0 && *q <= 1.0)) {
        return Err(BalanceError::config(
            format!("{field}[{idx}]"),
            "percentiles must lie in (0, 1]",
        ));
    }
    let mut seen = BTreeMap::new();
    for (idx, q) in percentiles.iter().enumerate() {
        if let Some(first) = seen.insert(percentile_label(*q), idx) {
            return Err(BalanceError::config(
                format!("{field}[{idx}]"),
                format!("duplicates {field}[{first}] as {}", percentile_label(*q)),
            ));
        }
    }
    Ok(())
}

/// Nearest-rank percentile over an ascending slice.
///
/// # Errors
///
/// Returns `BalanceError::Domain` for an empty slice or `q` outside `(0, 1]`.
pub fn nearest_rank(sorted: &[f64], q: f64) -> Result<f64> {
    if sorted.is_empty() {
        return Err(BalanceError::domain("percentile", "batch is empty"));
    }
    if !(q > 0.0 && q <= 1.0) {
        return Err(BalanceError::domain(
            "percentile",
            format!("q {q} must lie in (0, 1]"),
        ));
    }
    let rank = ceil_rank(q * usize_to_f64(sorted.len()) - RANK_EPSILON, sorted.len());
    Ok(sorted[rank - 1])
}

/// Expectation and order statistics for one distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: BTreeMap<String, f64>,
}

/// A batch of simulated outcomes, kept sorted ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialBatch {
    samples: Vec<f64>,
}

impl TrialBatch {
    /// Sort and wrap a batch of outcomes.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` if the batch is empty or holds non-finite values.
    pub fn from_samples(mut samples: Vec<f64>) -> Result<Self> {
        if samples.is_empty() {
            return Err(BalanceError::domain("trial batch", "batch is empty"));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(BalanceError::domain(
                "trial batch",
                "batch contains non-finite outcomes",
            ));
        }
        samples.sort_by(f64::total_cmp);
        Ok(Self { samples })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.samples.iter().sum::<f64>() / usize_to_f64(self.samples.len())
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.samples.first().copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn max(&self) -> f64 {
        self.samples.last().copied().unwrap_or(0.0)
    }

    /// Nearest-rank percentile.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` if `q` is outside `(0, 1]`.
    pub fn percentile(&self, q: f64) -> Result<f64> {
        nearest_rank(&self.samples, q)
    }

    /// Mean, extremes and the requested percentiles keyed by label.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` if any `q` is outside `(0, 1]`.
    pub fn summary(&self, percentiles: &[f64]) -> Result<DistributionSummary> {
        let mut labelled = BTreeMap::new();
        for q in percentiles {
            labelled.insert(percentile_label(*q), self.percentile(*q)?);
        }
        Ok(DistributionSummary {
            count: self.len(),
            mean: self.mean(),
            min: self.min(),
            max: self.max(),
            percentiles: labelled,
        })
    }
}

/// Expected trials to first success for a constant probability: `1 / p`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` unless `0 < p <= 1`.
pub fn geometric_expectation(p: f64) -> Result<f64> {
    if !(p > 0.0 && p <= 1.0) {
        return Err(BalanceError::domain(
            "geometric expectation",
            format!("probability {p} must lie in (0, 1]"),
        ));
    }
    Ok(1.0 / p)
}

/// Smallest `k` with `1 - (1 - p)^k >= q` for a constant probability `p`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` unless `0 < p <= 1` and `0 < q < 1`
/// (`q = 1` is only reachable when `p = 1`).
pub fn geometric_percentile(p: f64, q: f64) -> Result<u64> {
    geometric_expectation(p)?;
    if p >= 1.0 {
        return Ok(1);
    }
    if !(q > 0.0 && q < 1.0) {
        return Err(BalanceError::domain(
            "geometric percentile",
            format!("target {q} must lie in (0, 1) when p < 1"),
        ));
    }
    let raw = (1.0 - q).ln() / (1.0 - p).ln();
    let mut k = ceil_f64_to_u64(raw - RANK_EPSILON).max(1);
    // Guard the float estimate against landing one below the true bound.
    while 1.0 - (1.0 - p).powf(u64_to_f64(k)) < q - CDF_EPSILON {
        k += 1;
    }
    Ok(k)
}

/// Absorbing Markov chain over transient states.
///
/// Each state lists its transitions to other transient states and the
/// probability that a step taken from it absorbs. Absorption mass is stored
/// explicitly rather than derived as `1 - sum(transitions)`, so a state that
/// succeeds with probability `p` leaves with exactly `p`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkovChain {
    transitions: Vec<Vec<(usize, f64)>>,
    absorb: Vec<f64>,
}

impl MarkovChain {
    #[must_use]
    pub fn new(states: usize) -> Self {
        Self {
            transitions: vec![Vec::new(); states],
            absorb: vec![0.0; states],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Add transient transition mass `from -> to`.
    pub fn add_transition(&mut self, from: usize, to: usize, probability: f64) {
        if probability <= 0.0 || from >= self.len() || to >= self.len() {
            return;
        }
        let row = &mut self.transitions[from];
        if let Some(entry) = row.iter_mut().find(|(target, _)| *target == to) {
            entry.1 += probability;
        } else {
            row.push((to, probability));
        }
    }

    /// Add absorption mass for a step taken from `state`.
    pub fn add_absorption(&mut self, state: usize, probability: f64) {
        if probability > 0.0 && state < self.len() {
            self.absorb[state] += probability;
        }
    }

    /// Probability that a step taken from `state` absorbs.
    #[must_use]
    pub fn absorption_probability(&self, state: usize) -> f64 {
        self.absorb.get(state).copied().unwrap_or(0.0)
    }

    /// True when no transition moves to a lower-indexed state.
    #[must_use]
    pub fn is_forward_only(&self) -> bool {
        self.transitions
            .iter()
            .enumerate()
            .all(|(from, row)| row.iter().all(|(to, _)| *to >= from))
    }

    /// Expected accumulated cost until absorption from every state, where
    /// `costs[i]` is charged on each visit to state `i`.
    ///
    /// Forward-only chains are solved by back-substitution; anything else by
    /// an LU solve of the dense system `(I - Q) x = c`.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Config` on a cost/state length mismatch and
    /// `BalanceError::Convergence` when some state can never absorb.
    pub fn expected_costs(&self, costs: &[f64]) -> Result<Vec<f64>> {
        if costs.len() != self.len() {
            return Err(BalanceError::config(
                "costs",
                format!("expected {} entries, got {}", self.len(), costs.len()),
            ));
        }
        if self.is_forward_only() {
            self.back_substitute(costs)
        } else {
            self.eliminate(costs)
        }
    }

    fn back_substitute(&self, costs: &[f64]) -> Result<Vec<f64>> {
        let n = self.len();
        let mut expected = vec![0.0; n];
        for state in (0..n).rev() {
            let mut leave = self.absorb[state];
            let mut onward = 0.0;
            for (to, p) in &self.transitions[state] {
                if *to != state {
                    leave += p;
                    onward += p * expected[*to];
                }
            }
            if leave <= CDF_EPSILON {
                return Err(BalanceError::convergence(
                    format!("markov state {state} never leaves itself"),
                    0,
                ));
            }
            expected[state] = (costs[state] + onward) / leave;
        }
        Ok(expected)
    }

    fn eliminate(&self, costs: &[f64]) -> Result<Vec<f64>> {
        let n = self.len();
        let mut system = DMatrix::<f64>::identity(n, n);
        for (row, transitions) in self.transitions.iter().enumerate() {
            for (to, p) in transitions {
                system[(row, *to)] -= p;
            }
        }
        let solution = system
            .lu()
            .solve(&DVector::from_column_slice(costs))
            .ok_or_else(|| BalanceError::convergence("markov system is singular", 0))?;
        if solution.iter().any(|x| !x.is_finite()) {
            return Err(BalanceError::convergence(
                "markov system has no finite solution",
                0,
            ));
        }
        Ok(solution.iter().copied().collect())
    }

    /// Exact absorption-time quantiles from `start`: for each `q`, the smallest
    /// step count `k` with `P(T <= k) >= q`.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Convergence` if some quantile is not reached within
    /// `max_steps`, and `BalanceError::Domain` for an invalid `start` or `q`.
    pub fn absorption_quantiles(
        &self,
        start: usize,
        percentiles: &[f64],
        max_steps: u64,
    ) -> Result<Vec<u64>> {
        let bounded = self.bounded_absorption_quantiles(start, percentiles, max_steps)?;
        if bounded.iter().any(Option::is_none) {
            return Err(BalanceError::convergence(
                format!("absorption quantiles from state {start}"),
                max_steps,
            ));
        }
        Ok(bounded.into_iter().flatten().collect())
    }

    /// Like [`Self::absorption_quantiles`], but quantiles not reached within
    /// `max_steps` come back as `None` instead of failing the whole request.
    ///
    /// A start state that can only loop on itself is geometric and uses the
    /// closed form, which has no step limit.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` for an invalid `start` or `q`.
    pub fn bounded_absorption_quantiles(
        &self,
        start: usize,
        percentiles: &[f64],
        max_steps: u64,
    ) -> Result<Vec<Option<u64>>> {
        if start >= self.len() {
            return Err(BalanceError::domain(
                "absorption quantiles",
                format!("start state {start} is not transient"),
            ));
        }
        validate_percentiles("percentiles", percentiles)
            .map_err(|err| BalanceError::domain("absorption quantiles", err.to_string()))?;

        let absorb = self.absorb[start];
        if absorb > 0.0 && self.transitions[start].iter().all(|(to, _)| *to == start) {
            return percentiles
                .iter()
                .map(|q| {
                    if *q >= 1.0 && absorb < 1.0 {
                        Ok(None)
                    } else {
                        geometric_percentile(absorb, *q).map(Some)
                    }
                })
                .collect();
        }

        let mut mass = vec![0.0; self.len()];
        mass[start] = 1.0;
        let mut resolved: Vec<Option<u64>> = vec![None; percentiles.len()];
        let mut cdf = 0.0;

        for step in 1..=max_steps {
            let mut next = vec![0.0; self.len()];
            for (state, weight) in mass.iter().enumerate() {
                if *weight == 0.0 {
                    continue;
                }
                cdf += weight * self.absorb[state];
                for (to, p) in &self.transitions[state] {
                    next[*to] += weight * p;
                }
            }
            mass = next;
            for (slot, q) in resolved.iter_mut().zip(percentiles) {
                if slot.is_none() && cdf >= q - CDF_EPSILON {
                    *slot = Some(step);
                }
            }
            if resolved.iter().all(Option::is_some) {
                break;
            }
        }
        Ok(resolved)
    }
}

/// Outcomes of a seeded Monte Carlo batch, in trial-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun<T> {
    pub outcomes: Vec<T>,
    pub draws: u64,
}

/// Run `trials` independent trials on per-trial streams of a batch seed
/// derived from `(seed, tag)`.
pub fn run_batch<T, F>(trials: usize, seed: u64, tag: &str, mut trial: F) -> BatchRun<T>
where
    F: FnMut(&mut TrialRng) -> T,
{
    let batch_seed = derive_stream_seed(seed, tag.as_bytes());
    let mut outcomes = Vec::with_capacity(trials);
    let mut draws = 0u64;
    for index in 0..trials {
        let mut rng = trial_rng(batch_seed, u64::try_from(index).unwrap_or(u64::MAX));
        outcomes.push(trial(&mut rng));
        draws = draws.saturating_add(rng.draws());
    }
    log::debug!("batch '{tag}' ran {trials} trials with {draws} draws");
    BatchRun { outcomes, draws }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn nearest_rank_matches_definition() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(nearest_rank(&sorted, 0.5).unwrap(), 5.0);
        assert_eq!(nearest_rank(&sorted, 0.9).unwrap(), 9.0);
        assert_eq!(nearest_rank(&sorted, 0.95).unwrap(), 10.0);
        assert_eq!(nearest_rank(&sorted, 0.01).unwrap(), 1.0);
        assert_eq!(nearest_rank(&sorted, 1.0).unwrap(), 10.0);
        assert!(nearest_rank(&sorted, 0.0).is_err());
        assert!(nearest_rank(&[], 0.5).is_err());
    }

    #[test]
    fn nearest_rank_is_not_fooled_by_float_products() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(nearest_rank(&sorted, 0.07).unwrap(), 7.0);
        assert_eq!(nearest_rank(&sorted, 0.29).unwrap(), 29.0);
    }

    #[test]
    fn batch_summary_labels_percentiles() {
        let batch = TrialBatch::from_samples(vec![4.0, 1.0, 3.0, 2.0]).unwrap();
        let summary = batch.summary(&[0.5, 0.9]).unwrap();
        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.percentiles.get("p50"), Some(&2.0));
        assert_eq!(summary.percentiles.get("p90"), Some(&4.0));
        assert_eq!(summary.max, 4.0);
        assert!(TrialBatch::from_samples(vec![f64::NAN]).is_err());
    }

    #[test]
    fn geometric_helpers() {
        assert_eq!(geometric_expectation(0.05).unwrap(), 20.0);
        assert!(geometric_expectation(0.0).is_err());
        // 1 - 0.5^5 = 0.96875 >= 0.95, 1 - 0.5^4 = 0.9375 < 0.95
        assert_eq!(geometric_percentile(0.5, 0.95).unwrap(), 5);
        assert_eq!(geometric_percentile(1.0, 0.99).unwrap(), 1);
        assert!(geometric_percentile(0.5, 1.0).is_err());
    }

    #[test]
    fn single_state_chain_matches_geometric() {
        let mut chain = MarkovChain::new(1);
        chain.add_transition(0, 0, 0.95);
        chain.add_absorption(0, 0.05);
        let expected = chain.expected_costs(&[1.0]).unwrap();
        assert_eq!(expected[0], 20.0);
        let quantiles = chain.absorption_quantiles(0, &[0.5, 0.95], 10_000).unwrap();
        assert_eq!(quantiles[0], geometric_percentile(0.05, 0.5).unwrap());
        assert_eq!(quantiles[1], geometric_percentile(0.05, 0.95).unwrap());
    }

    #[test]
    fn backward_chain_uses_elimination() {
        // Two levels; failing at level 1 drops back to level 0.
        let mut chain = MarkovChain::new(2);
        chain.add_transition(0, 0, 0.5);
        chain.add_transition(0, 1, 0.5);
        chain.add_transition(1, 0, 0.5);
        chain.add_absorption(1, 0.5);
        assert!(!chain.is_forward_only());
        let expected = chain.expected_costs(&[1.0, 1.0]).unwrap();
        // E0 = 1 + 0.5 E0 + 0.5 E1, E1 = 1 + 0.5 E0  =>  E0 = 6, E1 = 4
        assert!((expected[0] - 6.0).abs() < 1e-9);
        assert!((expected[1] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn regressing_chain_matches_direct_solution() {
        // Three levels; a failure drops one level, floored at level 0.
        let mut chain = MarkovChain::new(3);
        chain.add_transition(0, 1, 0.5);
        chain.add_transition(0, 0, 0.5);
        chain.add_transition(1, 2, 0.5);
        chain.add_transition(1, 0, 0.5);
        chain.add_absorption(2, 0.5);
        chain.add_transition(2, 1, 0.5);
        let expected = chain.expected_costs(&[1.0, 1.0, 1.0]).unwrap();
        // E0 = 2 + E1, E1 = 1 + 0.5 E0 + 0.5 E2, E2 = 1 + 0.5 E1
        assert!((expected[0] - 12.0).abs() < 1e-9);
        assert!((expected[1] - 10.0).abs() < 1e-9);
        assert!((expected[2] - 6.0).abs() < 1e-9);
    }

    #[test]
    fn cyclic_chain_without_absorption_is_singular() {
        let mut chain = MarkovChain::new(2);
        chain.add_transition(0, 1, 1.0);
        chain.add_transition(1, 0, 1.0);
        assert!(!chain.is_forward_only());
        assert!(chain.expected_costs(&[1.0, 1.0]).unwrap_err().is_convergence());
    }

    #[test]
    fn non_absorbing_chain_is_convergence_error() {
        let mut chain = MarkovChain::new(1);
        chain.add_transition(0, 0, 1.0);
        assert!(chain.expected_costs(&[1.0]).unwrap_err().is_convergence());
        assert!(chain
            .absorption_quantiles(0, &[0.5], 100)
            .unwrap_err()
            .is_convergence());
    }

    #[test]
    fn labels_stay_distinct_and_order_by_rank() {
        assert_eq!(percentile_label(0.9), "p90");
        assert_eq!(percentile_label(0.904), "p90.4");
        assert_eq!(percentile_label(0.995), "p99.5");
        assert_eq!(percentile_label(1.0), "p100");
        let labels: Vec<String> = [1.0, 0.5, 0.904, 0.9]
            .into_iter()
            .map(percentile_label)
            .collect();
        assert_eq!(ordered_labels(&labels), ["p50", "p90", "p90.4", "p100"]);
    }

    #[test]
    fn duplicate_percentile_labels_are_rejected() {
        assert!(validate_percentiles("percentiles", &[0.9, 0.904, 0.5]).is_ok());
        let err = validate_percentiles("percentiles", &[0.5, 0.9, 0.900_000_1]).unwrap_err();
        assert_eq!(err.field(), Some("percentiles[2]"));
    }

    #[test]
    fn rare_geometric_state_skips_step_limit() {
        let mut chain = MarkovChain::new(1);
        chain.add_transition(0, 0, 1.0 - 1e-6);
        chain.add_absorption(0, 1e-6);
        let quantiles = chain.absorption_quantiles(0, &[0.5, 0.95], 1_000).unwrap();
        assert_eq!(quantiles[1], geometric_percentile(1e-6, 0.95).unwrap());
        assert!(quantiles[1] > 1_000);
    }

    #[test]
    fn bounded_quantiles_leave_unreached_targets_empty() {
        // Forward chain of two slow states: not geometric, so the limit applies.
        let mut chain = MarkovChain::new(2);
        chain.add_transition(0, 0, 0.99);
        chain.add_transition(0, 1, 0.01);
        chain.add_transition(1, 1, 0.99);
        chain.add_absorption(1, 0.01);
        let bounded = chain
            .bounded_absorption_quantiles(0, &[0.01, 0.95], 20)
            .unwrap();
        // P(T <= 20) = 1 - 0.99^20 - 20 * 0.01 * 0.99^19 ~ 0.017
        assert!(bounded[0].is_some());
        assert_eq!(bounded[1], None);
        assert!(chain
            .absorption_quantiles(0, &[0.95], 20)
            .unwrap_err()
            .is_convergence());
    }

    #[test]
    fn batches_replay_under_fixed_seed() {
        let first = run_batch(64, 7, "test", |rng| rng.r#gen::<f64>());
        let second = run_batch(64, 7, "test", |rng| rng.r#gen::<f64>());
        assert_eq!(first, second);
        assert_eq!(first.draws, 64);
        let other = run_batch(64, 7, "other", |rng| rng.r#gen::<f64>());
        assert_ne!(first.outcomes, other.outcomes);
    }
}
