//! Centralized defaults and safeguard limits for the balance engine.
//!
//! Every calculator reads its fallback knobs from here so that a change to
//! a default shows up in one reviewed place rather than scattered literals.

// Randomness ---------------------------------------------------------------
pub const DEFAULT_SEED: u64 = 1337;
pub const DEFAULT_TRIALS: usize = 10_000;
pub const MAX_TRIALS: usize = 2_000_000;

// Percentiles --------------------------------------------------------------
pub const DEFAULT_PERCENTILES: [f64; 3] = [0.50, 0.90, 0.95];
/// Slack subtracted from `q * N` before taking the ceiling, so that products
/// such as `0.07 * 100` do not land one rank high.
pub const RANK_EPSILON: f64 = 1e-9;
/// Slack applied when comparing cumulative mass against a quantile.
pub const CDF_EPSILON: f64 = 1e-12;

// Curves -------------------------------------------------------------------
/// Magnitude of `k * (x - x0)` beyond which the sigmoid saturates to 0 or L.
pub const SIGMOID_SATURATION: f64 = 40.0;
/// Probabilities produced by pity helpers are snapped to a grid of this many steps per unit.
pub const PROBABILITY_STEPS: f64 = 1e12;

// Tolerances ---------------------------------------------------------------
pub const FLOAT_TOLERANCE: f64 = 1e-9;

// Enhancement safeguards ---------------------------------------------------
pub const DEFAULT_MAX_ATTEMPTS_PER_TRIAL: u64 = 100_000;
/// Largest regressing chain, in transient states, handed to the dense LU solve.
pub const EXACT_STATE_LIMIT: usize = 512;
/// Largest number of distinct pity states tracked for one level.
pub const MAX_PITY_STATES: u32 = 4_096;

// Economy ------------------------------------------------------------------
pub const DEFAULT_STABILITY_BAND: (f64, f64) = (0.9, 1.1);
/// Longest ledger, in steps, a single run will allocate.
pub const MAX_HORIZON: i64 = 1_000_000;

// Clear probability --------------------------------------------------------
pub const DEFAULT_RETRY_TARGET: f64 = 0.95;
