//! Enhancement cost simulator.
//!
//! A ladder of levels `0..N` is modelled as an absorbing Markov chain whose
//! transient states are `(level, attempt at that level)`. The attempt counter
//! only matters for levels with a pity ramp or hard pity, so plain levels
//! collapse to a single state. Reaching the target level absorbs.
//!
//! Two strategies produce the same report shape:
//! - exact: expectations from a linear solve over the chain and attempt
//!   quantiles by propagating the state distribution (closed form for a
//!   constant-probability level);
//! - Monte Carlo: seeded trial batches through the percentile engine.
//!
//! `auto` takes the exact path whenever the ladder never regresses (the chain
//! is upper-triangular and back-substitution is linear in the state count) or
//! the chain is small enough for a dense LU solve, currently
//! [`EXACT_STATE_LIMIT`] states. Past that, elimination costs grow cubically
//! and simulation wins. An explicit `exact` request past that size on a
//! regressing ladder is rejected rather than attempted.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{
    DEFAULT_MAX_ATTEMPTS_PER_TRIAL, DEFAULT_PERCENTILES, DEFAULT_SEED, DEFAULT_TRIALS,
    EXACT_STATE_LIMIT, MAX_PITY_STATES, MAX_TRIALS,
};
use crate::curves::CurveSpec;
use crate::error::{BalanceError, Result};
use crate::numbers::{ceil_f64_to_u64, snap_probability, u64_to_f64};
use crate::percentile::{
    MarkovChain, TrialBatch, percentile_label, run_batch, validate_percentiles,
};
use crate::rng::TrialRng;

const DEFAULT_SAMPLE: &str = include_str!("../data/enhancement_cost.json");

/// Attempt rules for moving from this level to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementLevel {
    #[serde(default)]
    pub label: Option<String>,
    pub success_probability: f64,
    #[serde(default)]
    pub cost_per_attempt: f64,
    /// Attempt number at which success is guaranteed.
    #[serde(default)]
    pub pity_threshold: Option<u32>,
    /// Probability ramp keyed on the attempt number at this level.
    #[serde(default)]
    pub pity_curve: Option<CurveSpec>,
    #[serde(default)]
    pub protection_consumed_on_fail: bool,
    /// Levels lost on an unprotected failure.
    #[serde(default)]
    pub downgrade_on_fail: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Auto,
    Exact,
    MonteCarlo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileSource {
    Exact,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementConfig {
    pub levels: Vec<EnhancementLevel>,
    /// Price of the protection item consumed by a protected failure.
    #[serde(default)]
    pub protection_cost: f64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_trial: u64,
    #[serde(default)]
    pub allow_truncated: bool,
}

const fn default_trials() -> usize {
    DEFAULT_TRIALS
}

const fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_percentiles() -> Vec<f64> {
    DEFAULT_PERCENTILES.to_vec()
}

const fn default_max_attempts() -> u64 {
    DEFAULT_MAX_ATTEMPTS_PER_TRIAL
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            protection_cost: 0.0,
            strategy: Strategy::Auto,
            trials: DEFAULT_TRIALS,
            seed: DEFAULT_SEED,
            percentiles: default_percentiles(),
            max_attempts_per_trial: DEFAULT_MAX_ATTEMPTS_PER_TRIAL,
            allow_truncated: false,
        }
    }
}

impl EnhancementConfig {
    /// Built-in demo ladder used when no payload is supplied.
    #[must_use]
    pub fn load_from_static() -> Self {
        serde_json::from_str(DEFAULT_SAMPLE).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `BalanceError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(BalanceError::config("levels", "at least one level is required"));
        }
        for (idx, level) in self.levels.iter().enumerate() {
            validate_level(idx, level)?;
        }
        if !self.protection_cost.is_finite() || self.protection_cost < 0.0 {
            return Err(BalanceError::config("protection_cost", "must be >= 0"));
        }
        if self.trials == 0 || self.trials > MAX_TRIALS {
            return Err(BalanceError::config(
                "trials",
                format!("must lie in 1..={MAX_TRIALS}"),
            ));
        }
        if self.max_attempts_per_trial == 0 {
            return Err(BalanceError::config("max_attempts_per_trial", "must be > 0"));
        }
        validate_percentiles("percentiles", &self.percentiles)
    }
}

fn validate_level(idx: usize, level: &EnhancementLevel) -> Result<()> {
    let field = format!("levels[{idx}]");
    if !(level.success_probability > 0.0 && level.success_probability <= 1.0) {
        return Err(BalanceError::config(
            format!("{field}.success_probability"),
            "must lie in (0, 1]",
        ));
    }
    if !level.cost_per_attempt.is_finite() || level.cost_per_attempt < 0.0 {
        return Err(BalanceError::config(
            format!("{field}.cost_per_attempt"),
            "must be >= 0",
        ));
    }
    match level.pity_threshold {
        Some(0) => {
            return Err(BalanceError::config(
                format!("{field}.pity_threshold"),
                "attempts are 1-indexed",
            ));
        }
        Some(threshold) if threshold > MAX_PITY_STATES => {
            return Err(BalanceError::config(
                format!("{field}.pity_threshold"),
                format!("must be <= {MAX_PITY_STATES}"),
            ));
        }
        _ => {}
    }
    if let Some(curve) = &level.pity_curve {
        let curve_field = format!("{field}.pity_curve");
        if !curve.is_pity() {
            return Err(BalanceError::config(
                curve_field,
                format!("expected a pity curve, got {}", curve.kind()),
            ));
        }
        curve.validate(&curve_field)?;
    }
    Ok(())
}

/// Expectation and percentiles for one ladder segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedCostReport {
    pub from_level: usize,
    pub to_level: usize,
    pub expected_attempts: f64,
    pub expected_cost: f64,
    pub percentile_attempts: BTreeMap<String, u64>,
    pub percentile_cost: BTreeMap<String, f64>,
    pub attempt_percentile_source: PercentileSource,
    pub cost_percentile_source: PercentileSource,
    /// Simulated trials cut off by the per-trial attempt limit.
    pub truncated_trials: usize,
    /// Exact attempt percentiles not reached within the attempt limit; their
    /// values are reported at the limit.
    #[serde(default)]
    pub truncated_percentiles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementReport {
    pub strategy_used: Strategy,
    pub state_count: usize,
    pub steps: Vec<ExpectedCostReport>,
    pub cumulative: ExpectedCostReport,
    /// Trials per simulated batch, zero when nothing was simulated.
    pub trials: usize,
    pub draws: u64,
    pub truncated: bool,
    pub warnings: Vec<String>,
}

/// Per-level probability table indexed by attempt number.
#[derive(Debug, Clone)]
struct LevelTable {
    probabilities: Vec<f64>,
    cost: f64,
    protected: bool,
    downgrade: usize,
}

impl LevelTable {
    fn states(&self) -> usize {
        self.probabilities.len()
    }

    /// Attempts past the table end reuse the stationary tail.
    fn probability(&self, attempt: usize) -> f64 {
        let idx = attempt.clamp(1, self.states()) - 1;
        self.probabilities[idx]
    }

    fn failure_target(&self, level: usize) -> usize {
        if self.protected {
            level
        } else {
            level.saturating_sub(self.downgrade)
        }
    }

    fn visit_cost(&self, attempt: usize, protection_cost: f64) -> f64 {
        if self.protected {
            self.cost + (1.0 - self.probability(attempt)) * protection_cost
        } else {
            self.cost
        }
    }
}

fn build_tables(levels: &[EnhancementLevel]) -> Result<Vec<LevelTable>> {
    let mut tables = Vec::with_capacity(levels.len());
    for (idx, level) in levels.iter().enumerate() {
        let states = match (level.pity_threshold, &level.pity_curve) {
            (Some(threshold), _) => threshold,
            (None, Some(curve)) => {
                let plateau = curve.stationary_after().unwrap_or(1);
                if plateau > MAX_PITY_STATES {
                    return Err(BalanceError::config(
                        format!("levels[{idx}].pity_curve"),
                        format!("ramp does not settle within {MAX_PITY_STATES} attempts"),
                    ));
                }
                plateau
            }
            (None, None) => 1,
        };
        let mut probabilities = Vec::with_capacity(states as usize);
        for attempt in 1..=states {
            let mut p = level.success_probability;
            if let Some(curve) = &level.pity_curve {
                p = p.max(curve.evaluate(f64::from(attempt))?);
            }
            if level.pity_threshold.is_some_and(|threshold| attempt >= threshold) {
                p = 1.0;
            }
            probabilities.push(snap_probability(p.min(1.0)));
        }
        tables.push(LevelTable {
            probabilities,
            cost: level.cost_per_attempt,
            protected: level.protection_consumed_on_fail,
            downgrade: level.downgrade_on_fail as usize,
        });
    }
    Ok(tables)
}

/// Chain over levels `0..target`; reaching `target` absorbs.
struct LadderChain {
    chain: MarkovChain,
    offsets: Vec<usize>,
    attempts: Vec<f64>,
    costs: Vec<f64>,
}

impl LadderChain {
    fn build(tables: &[LevelTable], target: usize, protection_cost: f64) -> Self {
        let mut offsets = Vec::with_capacity(target);
        let mut total = 0;
        for table in &tables[..target] {
            offsets.push(total);
            total += table.states();
        }
        let mut chain = MarkovChain::new(total);
        let mut costs = vec![0.0; total];

        for (level, table) in tables[..target].iter().enumerate() {
            for attempt in 1..=table.states() {
                let state = offsets[level] + attempt - 1;
                let p = table.probability(attempt);
                costs[state] = table.visit_cost(attempt, protection_cost);
                if level + 1 == target {
                    chain.add_absorption(state, p);
                } else {
                    chain.add_transition(state, offsets[level + 1], p);
                }
                let fail_level = table.failure_target(level);
                let next = if fail_level == level {
                    state + usize::from(attempt < table.states())
                } else {
                    offsets[fail_level]
                };
                chain.add_transition(state, next, snap_probability(1.0 - p));
            }
        }

        Self {
            chain,
            offsets,
            attempts: vec![1.0; total],
            costs,
        }
    }

    fn start(&self, level: usize) -> usize {
        self.offsets[level]
    }
}

#[derive(Debug, Clone, Copy)]
struct TrialOutcome {
    attempts: u64,
    cost: f64,
    truncated: bool,
}

fn simulate_trial(
    tables: &[LevelTable],
    from: usize,
    target: usize,
    limits: (u64, f64),
    rng: &mut TrialRng,
) -> TrialOutcome {
    let (max_attempts, protection_cost) = limits;
    let mut level = from;
    let mut attempt = 1usize;
    let mut attempts = 0u64;
    let mut cost = 0.0;
    while level < target {
        if attempts >= max_attempts {
            return TrialOutcome {
                attempts,
                cost,
                truncated: true,
            };
        }
        attempts += 1;
        let table = &tables[level];
        cost += table.cost;
        if rng.r#gen::<f64>() < table.probability(attempt) {
            level += 1;
            attempt = 1;
            continue;
        }
        if table.protected {
            cost += protection_cost;
        }
        let next = table.failure_target(level);
        if next == level {
            attempt = attempt.saturating_add(1);
        } else {
            level = next;
            attempt = 1;
        }
    }
    TrialOutcome {
        attempts,
        cost,
        truncated: false,
    }
}

struct Simulated {
    attempts: TrialBatch,
    costs: TrialBatch,
    truncated: usize,
    draws: u64,
}

struct Solver<'a> {
    config: &'a EnhancementConfig,
    tables: Vec<LevelTable>,
    trials_used: usize,
    draws: u64,
}

impl Solver<'_> {
    fn simulate(&mut self, from: usize, target: usize, tag: &str) -> Result<Simulated> {
        let limits = (
            self.config.max_attempts_per_trial,
            self.config.protection_cost,
        );
        let tables = &self.tables;
        let batch = run_batch(self.config.trials, self.config.seed, tag, |rng| {
            simulate_trial(tables, from, target, limits, rng)
        });
        self.trials_used = self.config.trials;
        self.draws = self.draws.saturating_add(batch.draws);
        let truncated = batch.outcomes.iter().filter(|o| o.truncated).count();
        Ok(Simulated {
            attempts: TrialBatch::from_samples(
                batch.outcomes.iter().map(|o| u64_to_f64(o.attempts)).collect(),
            )?,
            costs: TrialBatch::from_samples(batch.outcomes.iter().map(|o| o.cost).collect())?,
            truncated,
            draws: batch.draws,
        })
    }

    fn uniform_cost(&self, target: usize) -> Option<f64> {
        let levels = &self.tables[..target];
        let first = levels.first()?.cost;
        let protection_free =
            self.config.protection_cost == 0.0 || levels.iter().all(|t| !t.protected);
        (protection_free && levels.iter().all(|t| t.cost == first)).then_some(first)
    }

    fn exact_segment(&mut self, from: usize, target: usize, tag: &str) -> Result<ExpectedCostReport> {
        let ladder = LadderChain::build(&self.tables, target, self.config.protection_cost);
        let start = ladder.start(from);
        let expected_attempts = ladder.chain.expected_costs(&ladder.attempts)?[start];
        let expected_cost = ladder.chain.expected_costs(&ladder.costs)?[start];
        let limit = self.config.max_attempts_per_trial;
        let bounded = ladder
            .chain
            .bounded_absorption_quantiles(start, &self.config.percentiles, limit)?;

        let mut percentile_attempts = BTreeMap::new();
        let mut truncated_percentiles = Vec::new();
        let mut quantiles = Vec::with_capacity(bounded.len());
        for (q, k) in self.config.percentiles.iter().zip(bounded) {
            let label = percentile_label(*q);
            let k = k.unwrap_or_else(|| {
                truncated_percentiles.push(label.clone());
                limit
            });
            percentile_attempts.insert(label, k);
            quantiles.push(k);
        }
        if !truncated_percentiles.is_empty() {
            log::warn!(
                "{tag}: {} not reached within {limit} attempts",
                truncated_percentiles.join(", ")
            );
        }

        let (percentile_cost, cost_percentile_source, truncated_trials) =
            if let Some(unit) = self.uniform_cost(target) {
                let costs = self
                    .config
                    .percentiles
                    .iter()
                    .zip(&quantiles)
                    .map(|(q, k)| (percentile_label(*q), unit * u64_to_f64(*k)))
                    .collect();
                (costs, PercentileSource::Exact, 0)
            } else {
                let simulated = self.simulate(from, target, tag)?;
                log::debug!(
                    "{tag}: cost percentiles simulated over {} trials ({} draws)",
                    simulated.costs.len(),
                    simulated.draws
                );
                let summary = simulated.costs.summary(&self.config.percentiles)?;
                (
                    summary.percentiles,
                    PercentileSource::Simulated,
                    simulated.truncated,
                )
            };

        Ok(ExpectedCostReport {
            from_level: from,
            to_level: target,
            expected_attempts,
            expected_cost,
            percentile_attempts,
            percentile_cost,
            attempt_percentile_source: PercentileSource::Exact,
            cost_percentile_source,
            truncated_trials,
            truncated_percentiles,
        })
    }

    fn simulated_segment(
        &mut self,
        from: usize,
        target: usize,
        tag: &str,
    ) -> Result<ExpectedCostReport> {
        let simulated = self.simulate(from, target, tag)?;
        let attempts = simulated.attempts.summary(&self.config.percentiles)?;
        let costs = simulated.costs.summary(&self.config.percentiles)?;
        Ok(ExpectedCostReport {
            from_level: from,
            to_level: target,
            expected_attempts: attempts.mean,
            expected_cost: costs.mean,
            percentile_attempts: attempts
                .percentiles
                .into_iter()
                .map(|(label, value)| (label, ceil_f64_to_u64(value)))
                .collect(),
            percentile_cost: costs.percentiles,
            attempt_percentile_source: PercentileSource::Simulated,
            cost_percentile_source: PercentileSource::Simulated,
            truncated_trials: simulated.truncated,
            truncated_percentiles: Vec::new(),
        })
    }

    fn segment(
        &mut self,
        strategy: Strategy,
        from: usize,
        target: usize,
        tag: &str,
    ) -> Result<ExpectedCostReport> {
        match strategy {
            Strategy::MonteCarlo => self.simulated_segment(from, target, tag),
            _ => self.exact_segment(from, target, tag),
        }
    }
}

fn choose_strategy(
    requested: Strategy,
    tables: &[LevelTable],
    states: usize,
) -> Result<Strategy> {
    let regresses = tables
        .iter()
        .enumerate()
        .any(|(level, table)| table.failure_target(level) < level);
    let dense_ok = !regresses || states <= EXACT_STATE_LIMIT;
    match requested {
        Strategy::Auto if dense_ok => Ok(Strategy::Exact),
        Strategy::Auto => Ok(Strategy::MonteCarlo),
        Strategy::Exact if !dense_ok => Err(BalanceError::config(
            "strategy",
            format!(
                "exact solve of a regressing ladder is limited to {EXACT_STATE_LIMIT} states, \
                 this one has {states}; use monte_carlo or auto"
            ),
        )),
        explicit => Ok(explicit),
    }
}

fn ladder_warnings(config: &EnhancementConfig, tables: &[LevelTable]) -> Vec<String> {
    tables
        .iter()
        .enumerate()
        .filter(|(_, table)| table.probability(table.states()) < 1.0)
        .map(|(idx, _)| {
            let name = config.levels[idx]
                .label
                .clone()
                .unwrap_or_else(|| format!("levels[{idx}]"));
            format!("{name} has no hard pity; worst-case attempts are unbounded")
        })
        .collect()
}

/// Expected attempts and cost per ladder step and for the whole ladder.
///
/// # Errors
///
/// Returns `BalanceError::Config` for an invalid ladder and
/// `BalanceError::Convergence` when a chain cannot absorb within
/// `max_attempts_per_trial`; a simulated run that truncated trials carries
/// the marked partial report unless `allow_truncated` is set.
pub fn simulate_enhancement(config: &EnhancementConfig) -> Result<EnhancementReport> {
    config.validate()?;
    let tables = build_tables(&config.levels)?;
    let target = tables.len();
    let state_count: usize = tables.iter().map(LevelTable::states).sum();
    let strategy = choose_strategy(config.strategy, &tables, state_count)?;
    log::debug!(
        "enhancement ladder: {target} levels, {state_count} states, strategy {strategy:?}"
    );
    let warnings = ladder_warnings(config, &tables);

    let mut solver = Solver {
        config,
        tables,
        trials_used: 0,
        draws: 0,
    };
    let mut steps = Vec::with_capacity(target);
    for to in 1..=target {
        steps.push(solver.segment(strategy, to - 1, to, &format!("enhancement/step-{to}"))?);
    }
    let cumulative = solver.segment(strategy, 0, target, "enhancement/cumulative")?;

    let segments = || steps.iter().chain(std::iter::once(&cumulative));
    let truncated_trials: usize = segments().map(|report| report.truncated_trials).sum();
    let truncated_percentiles: usize = segments()
        .map(|report| report.truncated_percentiles.len())
        .sum();
    let report = EnhancementReport {
        strategy_used: strategy,
        state_count,
        steps,
        cumulative,
        trials: solver.trials_used,
        draws: solver.draws,
        truncated: truncated_trials > 0 || truncated_percentiles > 0,
        warnings,
    };

    if !report.truncated {
        return Ok(report);
    }
    log::warn!(
        "{truncated_trials} simulated trials and {truncated_percentiles} exact percentiles \
         hit the {} attempt limit",
        config.max_attempts_per_trial
    );
    if config.allow_truncated {
        Ok(report)
    } else {
        Err(BalanceError::Convergence {
            context: format!(
                "enhancement ladder ({truncated_trials} trials and {truncated_percentiles} \
                 percentiles truncated across {} segments)",
                target + 1
            ),
            limit: config.max_attempts_per_trial,
            partial: Some(Box::new(report)),
        })
    }
}
