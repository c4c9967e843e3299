//! Curve library: the pure mathematical primitives every calculator composes.
//!
//! All functions are stateless. Weighted sampling takes a caller-supplied
//! uniform draw in `[0, 1)` so it stays deterministic; `weighted_pick_with`
//! is the convenience form that pulls the draw from an explicit generator.
use num_traits::cast::cast;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::SIGMOID_SATURATION;
use crate::error::{BalanceError, Result};
use crate::numbers::snap_probability;

/// One segment of a piecewise-linear curve.
///
/// The segment covers `[threshold, next threshold)`; its value there is
/// `intercept + slope * (x - threshold)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub threshold: f64,
    #[serde(default)]
    pub slope: f64,
    #[serde(default)]
    pub intercept: f64,
}

/// One band of a soft-pity table.
///
/// `from_attempt` is the first attempt (1-indexed) at which `probability`
/// applies; the band runs through the attempt before the next band starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PityBand {
    pub from_attempt: u32,
    pub probability: f64,
}

/// Declarative description of a curve, built fresh per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CurveSpec {
    Sigmoid {
        #[serde(alias = "L")]
        l: f64,
        k: f64,
        x0: f64,
    },
    Inverse {
        k: f64,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    Piecewise {
        breakpoints: Vec<Breakpoint>,
    },
    Weighted {
        weights: Vec<f64>,
    },
    PityLinear {
        p_base: f64,
        delta: f64,
        #[serde(default = "default_scale")]
        p_max: f64,
    },
    PitySoft {
        bands: Vec<PityBand>,
    },
    Constant {
        value: f64,
    },
}

const fn default_scale() -> f64 {
    1.0
}

impl CurveSpec {
    /// Short kind label used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sigmoid { .. } => "sigmoid",
            Self::Inverse { .. } => "inverse",
            Self::Piecewise { .. } => "piecewise",
            Self::Weighted { .. } => "weighted",
            Self::PityLinear { .. } => "pity-linear",
            Self::PitySoft { .. } => "pity-soft",
            Self::Constant { .. } => "constant",
        }
    }

    /// Check that every required parameter is present and within domain.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Config` naming the offending parameter under `field`.
    pub fn validate(&self, field: &str) -> Result<()> {
        match self {
            Self::Sigmoid { l, k, x0 } => {
                if !l.is_finite() || *l <= 0.0 {
                    return Err(BalanceError::config(format!("{field}.l"), "must be > 0"));
                }
                require_finite(&format!("{field}.k"), *k)?;
                require_finite(&format!("{field}.x0"), *x0)
            }
            Self::Inverse { k, scale } => {
                if !k.is_finite() || *k <= 0.0 {
                    return Err(BalanceError::config(format!("{field}.k"), "must be > 0"));
                }
                require_finite(&format!("{field}.scale"), *scale)
            }
            Self::Piecewise { breakpoints } => {
                validate_breakpoints(&format!("{field}.breakpoints"), breakpoints)
            }
            Self::Weighted { weights } => validate_weights(&format!("{field}.weights"), weights),
            Self::PityLinear {
                p_base,
                delta,
                p_max,
            } => {
                require_probability(&format!("{field}.p_base"), *p_base)?;
                require_probability(&format!("{field}.p_max"), *p_max)?;
                if !delta.is_finite() || *delta < 0.0 {
                    return Err(BalanceError::config(format!("{field}.delta"), "must be >= 0"));
                }
                if p_max < p_base {
                    return Err(BalanceError::config(
                        format!("{field}.p_max"),
                        format!("must be >= p_base ({p_base})"),
                    ));
                }
                Ok(())
            }
            Self::PitySoft { bands } => validate_bands(&format!("{field}.bands"), bands),
            Self::Constant { value } => require_finite(&format!("{field}.value"), *value),
        }
    }

    /// Evaluate the curve at `x`. Pity curves read `x` as a 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` for weighted curves (use [`CurveSpec::pick`])
    /// or for inputs outside the curve's domain.
    pub fn evaluate(&self, x: f64) -> Result<f64> {
        match self {
            Self::Sigmoid { l, k, x0 } => Ok(sigmoid(x, *l, *k, *x0)),
            Self::Inverse { k, scale } => Ok(scale * diminishing(x, *k)?),
            Self::Piecewise { breakpoints } => piecewise(x, breakpoints),
            Self::Weighted { .. } => Err(BalanceError::domain(
                "weighted evaluate",
                "weighted curves select an index; use pick(draw)",
            )),
            Self::PityLinear {
                p_base,
                delta,
                p_max,
            } => Ok(pity_linear(attempt_from_x(x), *p_base, *delta, *p_max)),
            Self::PitySoft { bands } => pity_table(attempt_from_x(x), bands),
            Self::Constant { value } => Ok(*value),
        }
    }

    /// Select an index from a weighted curve with a pre-drawn uniform value.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` when the curve is not weighted or the draw
    /// falls outside `[0, 1)`.
    pub fn pick(&self, draw: f64) -> Result<usize> {
        match self {
            Self::Weighted { weights } => weighted_pick(weights, draw),
            other => Err(BalanceError::domain(
                "weighted pick",
                format!("{} curves do not select indices", other.kind()),
            )),
        }
    }

    /// Whether this curve is a pity ladder keyed on attempt number.
    #[must_use]
    pub const fn is_pity(&self) -> bool {
        matches!(self, Self::PityLinear { .. } | Self::PitySoft { .. })
    }

    /// First attempt from which a pity curve no longer changes.
    #[must_use]
    pub fn stationary_after(&self) -> Option<u32> {
        match self {
            Self::PityLinear {
                p_base,
                delta,
                p_max,
            } => Some(pity_linear_plateau(*p_base, *delta, *p_max)),
            Self::PitySoft { bands } => bands.last().map(|band| band.from_attempt.max(1)),
            _ => None,
        }
    }

    /// Whether a pity curve eventually guarantees success.
    #[must_use]
    pub fn guarantees_success(&self) -> bool {
        match self {
            Self::PityLinear { p_max, .. } => snap_probability(*p_max) >= 1.0,
            Self::PitySoft { bands } => bands
                .last()
                .is_some_and(|band| snap_probability(band.probability) >= 1.0),
            _ => false,
        }
    }
}

/// Logistic curve `L / (1 + e^{-k(x - x0)})`.
///
/// Saturates to exactly 0 or `L` once `|k(x - x0)|` exceeds
/// [`SIGMOID_SATURATION`]; evaluates `L/2` exactly at `x0`.
#[must_use]
pub fn sigmoid(x: f64, l: f64, k: f64, x0: f64) -> f64 {
    sigmoid_saturating(x, l, k, x0, SIGMOID_SATURATION)
}

/// [`sigmoid`] with an explicit saturation magnitude.
#[must_use]
pub fn sigmoid_saturating(x: f64, l: f64, k: f64, x0: f64, saturation: f64) -> f64 {
    let z = k * (x - x0);
    if z.is_nan() {
        return l / 2.0;
    }
    if z >= saturation {
        return l;
    }
    if z <= -saturation {
        return 0.0;
    }
    if z >= 0.0 {
        l / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        l * e / (1.0 + e)
    }
}

/// Closed-form logistic inverse `x = x0 - ln(L/P - 1) / k`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` unless `0 < p < L` and `k != 0`.
pub fn logistic_inverse(p: f64, l: f64, k: f64, x0: f64) -> Result<f64> {
    if !(p > 0.0 && p < l) {
        return Err(BalanceError::domain(
            "logistic inverse",
            format!("probability {p} must lie strictly inside (0, {l})"),
        ));
    }
    if k == 0.0 || !k.is_finite() {
        return Err(BalanceError::domain(
            "logistic inverse",
            "steepness k must be finite and non-zero",
        ));
    }
    Ok(x0 - (l / p - 1.0).ln() / k)
}

/// Diminishing return `x / (x + k)`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` if `x < 0` or `k <= 0`.
pub fn diminishing(x: f64, k: f64) -> Result<f64> {
    if !(k > 0.0) {
        return Err(BalanceError::domain(
            "diminishing return",
            format!("k must be > 0 (got {k})"),
        ));
    }
    if !(x >= 0.0) {
        return Err(BalanceError::domain(
            "diminishing return",
            format!("x must be >= 0 (got {x})"),
        ));
    }
    if x.is_infinite() {
        return Ok(1.0);
    }
    Ok(x / (x + k))
}

/// Evaluate the segment whose threshold is the largest one `<= x`.
///
/// # Errors
///
/// Returns `BalanceError::Config` if the breakpoints are empty or unsorted.
pub fn piecewise(x: f64, breakpoints: &[Breakpoint]) -> Result<f64> {
    validate_breakpoints("breakpoints", breakpoints)?;
    let idx = breakpoints
        .partition_point(|bp| bp.threshold <= x)
        .saturating_sub(1);
    let segment = &breakpoints[idx];
    Ok(segment.intercept + segment.slope * (x - segment.threshold))
}

/// Select the index whose cumulative range contains `draw * total_weight`.
///
/// # Errors
///
/// Returns `BalanceError::Config` for empty, negative or all-zero weights and
/// `BalanceError::Domain` when `draw` is outside `[0, 1)`.
pub fn weighted_pick(weights: &[f64], draw: f64) -> Result<usize> {
    validate_weights("weights", weights)?;
    if !(0.0..1.0).contains(&draw) {
        return Err(BalanceError::domain(
            "weighted pick",
            format!("draw {draw} must lie in [0, 1)"),
        ));
    }
    let total: f64 = weights.iter().sum();
    let target = draw * total;
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (idx, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = idx;
        if target < cumulative {
            return Ok(idx);
        }
    }
    Ok(last_positive)
}

/// [`weighted_pick`] drawing the uniform value from `rng`.
///
/// # Errors
///
/// Same as [`weighted_pick`].
pub fn weighted_pick_with<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Result<usize> {
    weighted_pick(weights, rng.r#gen::<f64>())
}

/// Linear pity: `min(p_base + (n - 1) * delta, p_max)` clamped into `[0, 1]`.
///
/// `n` is the 1-indexed attempt number; `n = 0` is treated as the first attempt.
#[must_use]
pub fn pity_linear(n: u32, p_base: f64, delta: f64, p_max: f64) -> f64 {
    let steps = f64::from(n.saturating_sub(1));
    snap_probability((p_base + steps * delta).min(p_max))
}

/// Soft-pity lookup: probability of the band with the largest `from_attempt <= n`.
///
/// Attempts before the first band use the first band's probability.
///
/// # Errors
///
/// Returns `BalanceError::Config` if the bands are empty, unsorted or out of range.
pub fn pity_table(n: u32, bands: &[PityBand]) -> Result<f64> {
    validate_bands("bands", bands)?;
    let idx = bands
        .partition_point(|band| band.from_attempt <= n)
        .saturating_sub(1);
    Ok(snap_probability(bands[idx].probability))
}

fn pity_linear_plateau(p_base: f64, delta: f64, p_max: f64) -> u32 {
    let ceiling = snap_probability(p_max);
    if delta <= 0.0 || pity_linear(1, p_base, delta, p_max) >= ceiling {
        return 1;
    }
    let estimate = ((p_max - p_base) / delta).ceil() + 1.0;
    let mut n = cast::<f64, u32>(estimate.max(1.0)).unwrap_or(u32::MAX);
    while n > 1 && pity_linear(n - 1, p_base, delta, p_max) >= ceiling {
        n -= 1;
    }
    while n < u32::MAX && pity_linear(n, p_base, delta, p_max) < ceiling {
        n += 1;
    }
    n
}

fn attempt_from_x(x: f64) -> u32 {
    if !(x >= 1.0) {
        return 1;
    }
    cast::<f64, u32>(x.round()).unwrap_or(u32::MAX)
}

fn require_finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(BalanceError::config(field, "must be a finite number"))
    }
}

fn require_probability(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(BalanceError::config(
            field,
            format!("must lie in [0, 1] (got {value})"),
        ))
    }
}

pub(crate) fn validate_breakpoints(field: &str, breakpoints: &[Breakpoint]) -> Result<()> {
    if breakpoints.is_empty() {
        return Err(BalanceError::config(field, "at least one breakpoint is required"));
    }
    for (idx, bp) in breakpoints.iter().enumerate() {
        if !(bp.threshold.is_finite() && bp.slope.is_finite() && bp.intercept.is_finite()) {
            return Err(BalanceError::config(
                format!("{field}[{idx}]"),
                "threshold, slope and intercept must be finite",
            ));
        }
    }
    if let Some(idx) = breakpoints
        .windows(2)
        .position(|pair| pair[1].threshold <= pair[0].threshold)
    {
        return Err(BalanceError::config(
            format!("{field}[{}].threshold", idx + 1),
            "thresholds must be strictly ascending",
        ));
    }
    Ok(())
}

pub(crate) fn validate_weights(field: &str, weights: &[f64]) -> Result<()> {
    if weights.is_empty() {
        return Err(BalanceError::config(field, "at least one weight is required"));
    }
    if let Some(idx) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
        return Err(BalanceError::config(
            format!("{field}[{idx}]"),
            "weights must be finite and >= 0",
        ));
    }
    if weights.iter().all(|w| *w == 0.0) {
        return Err(BalanceError::config(field, "weights must not all be zero"));
    }
    Ok(())
}

pub(crate) fn validate_bands(field: &str, bands: &[PityBand]) -> Result<()> {
    if bands.is_empty() {
        return Err(BalanceError::config(field, "at least one band is required"));
    }
    for (idx, band) in bands.iter().enumerate() {
        require_probability(&format!("{field}[{idx}].probability"), band.probability)?;
        if band.from_attempt == 0 {
            return Err(BalanceError::config(
                format!("{field}[{idx}].from_attempt"),
                "attempts are 1-indexed",
            ));
        }
    }
    if let Some(idx) = bands
        .windows(2)
        .position(|pair| pair[1].from_attempt <= pair[0].from_attempt)
    {
        return Err(BalanceError::config(
            format!("{field}[{}].from_attempt", idx + 1),
            "bands must be strictly ascending",
        ));
    }
    Ok(())
}
