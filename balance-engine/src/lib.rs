//! Balance Engine
//!
//! Numeric core for deriving game-balance tables: a curve library, a
//! percentile engine and four calculators (combat pacing, economy flow,
//! enhancement cost, clear probability). Every calculator is a pure function
//! of an explicit configuration; stochastic paths take an explicit seed.

pub mod calculator;
pub mod clear;
pub mod combat;
pub mod constants;
pub mod curves;
pub mod economy;
pub mod enhancement;
pub mod error;
pub mod numbers;
pub mod percentile;
pub mod rng;

// Re-export commonly used types
pub use calculator::{
    BalanceReport, BalanceRequest, Calculator, ClearCalculator, CombatCalculator,
    EconomyCalculator, EnhancementCalculator, Mode, RunOptions, run_request, run_request_with,
    run_sample,
};
pub use clear::{
    ClearCurveSpec, ClearReport, GapRow, LogisticCurve, LogisticFit, Observation, fit_logistic,
    solve_midpoint, solve_steepness, tune_clear_curve,
};
pub use combat::{
    BossPhase, BossPlan, BossSolution, CombatConfig, CombatReport, DamageProfile, DamageSolution,
    SolvedFor, effective_hp, mitigation, run_combat, solve_boss, solve_profile, ttk_forward,
    ttk_inverse,
};
pub use curves::{
    Breakpoint, CurveSpec, PityBand, diminishing, logistic_inverse, piecewise, pity_linear,
    pity_table, sigmoid, sigmoid_saturating, weighted_pick, weighted_pick_with,
};
pub use economy::{
    EconomyConfig, EconomyDiagnostics, EconomyLedger, EconomyReport, Flow, FlowSide, LedgerStep,
    PatchImpact, RateInput, SegmentSummary, Shock, ShockEffect, Trend, simulate_economy,
};
pub use enhancement::{
    EnhancementConfig, EnhancementLevel, EnhancementReport, ExpectedCostReport, PercentileSource,
    Strategy, simulate_enhancement,
};
pub use error::{BalanceError, Result};
pub use percentile::{
    BatchRun, DistributionSummary, MarkovChain, TrialBatch, geometric_expectation,
    geometric_percentile, nearest_rank, percentile_label, run_batch,
};
pub use rng::{CountingRng, TrialRng, derive_stream_seed, trial_rng};
