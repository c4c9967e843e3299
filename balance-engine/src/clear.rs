//! Clear-probability tuner over a skill-gap axis.
//!
//! The gap is player power minus encounter difficulty; the curve maps it to a
//! probability of clearing the encounter on one attempt.
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_RETRY_TARGET;
use crate::curves::{CurveSpec, logistic_inverse, sigmoid};
use crate::error::{BalanceError, Result};
use crate::numbers::usize_to_f64;
use crate::percentile::{geometric_expectation, geometric_percentile};

const DEFAULT_SAMPLE: &str = include_str!("../data/clear_probability.json");

/// Logistic clear curve `L / (1 + e^{-k(gap - x0)})`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticCurve {
    #[serde(alias = "L", default = "default_ceiling")]
    pub l: f64,
    pub k: f64,
    pub x0: f64,
}

const fn default_ceiling() -> f64 {
    1.0
}

impl LogisticCurve {
    /// # Errors
    ///
    /// Returns `BalanceError::Config` unless `0 < L <= 1`, `k != 0` and `x0` is finite.
    pub fn validate(&self, field: &str) -> Result<()> {
        if !(self.l > 0.0 && self.l <= 1.0) {
            return Err(BalanceError::config(
                format!("{field}.l"),
                "clear ceiling must lie in (0, 1]",
            ));
        }
        if !self.k.is_finite() || self.k == 0.0 {
            return Err(BalanceError::config(
                format!("{field}.k"),
                "steepness must be finite and non-zero",
            ));
        }
        if !self.x0.is_finite() {
            return Err(BalanceError::config(format!("{field}.x0"), "must be finite"));
        }
        Ok(())
    }

    #[must_use]
    pub fn evaluate(&self, gap: f64) -> f64 {
        sigmoid(gap, self.l, self.k, self.x0)
    }

    /// Gap at which the curve crosses `probability`.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Domain` unless `0 < probability < L`.
    pub fn inverse(&self, probability: f64) -> Result<f64> {
        logistic_inverse(probability, self.l, self.k, self.x0)
    }

    #[must_use]
    pub const fn as_curve_spec(&self) -> CurveSpec {
        CurveSpec::Sigmoid {
            l: self.l,
            k: self.k,
            x0: self.x0,
        }
    }
}

/// Midpoint `x0` that makes the curve pass through `probability` at `gap`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` unless `0 < probability < L` and `k != 0`.
pub fn solve_midpoint(gap: f64, probability: f64, l: f64, k: f64) -> Result<f64> {
    // Inverting around x0 = 0 gives gap - x0 directly.
    let offset = logistic_inverse(probability, l, k, 0.0)?;
    Ok(gap - offset)
}

/// Steepness `k` that makes the curve pass through `probability` at `gap`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` unless `0 < probability < L` and `gap != x0`.
pub fn solve_steepness(gap: f64, probability: f64, l: f64, x0: f64) -> Result<f64> {
    if !(probability > 0.0 && probability < l) {
        return Err(BalanceError::domain(
            "steepness solve",
            format!("probability {probability} must lie strictly inside (0, {l})"),
        ));
    }
    if gap == x0 {
        return Err(BalanceError::domain(
            "steepness solve",
            "the midpoint always evaluates to L/2 regardless of steepness",
        ));
    }
    Ok(-(l / probability - 1.0).ln() / (gap - x0))
}

/// Observed clear rate at a gap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub gap: f64,
    pub clear_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticFit {
    pub curve: LogisticCurve,
    /// Root-mean-square error on the probability scale.
    pub rmse: f64,
    pub points: usize,
}

/// Fit `k` and `x0` for a fixed ceiling `l` by least squares on the logit
/// `ln(p / (L - p)) = k * gap - k * x0`.
///
/// # Errors
///
/// Returns `BalanceError::Config` for fewer than two points or a rate outside
/// `(0, L)`, and `BalanceError::Domain` when the gaps are all equal or the
/// fitted slope is zero.
pub fn fit_logistic(observations: &[Observation], l: f64) -> Result<LogisticFit> {
    if observations.len() < 2 {
        return Err(BalanceError::config(
            "observations",
            "at least two observations are required to fit",
        ));
    }
    let mut logits = Vec::with_capacity(observations.len());
    for (idx, obs) in observations.iter().enumerate() {
        if !obs.gap.is_finite() {
            return Err(BalanceError::config(
                format!("observations[{idx}].gap"),
                "must be finite",
            ));
        }
        if !(obs.clear_rate > 0.0 && obs.clear_rate < l) {
            return Err(BalanceError::config(
                format!("observations[{idx}].clear_rate"),
                format!("must lie strictly inside (0, {l})"),
            ));
        }
        logits.push((obs.gap, (obs.clear_rate / (l - obs.clear_rate)).ln()));
    }

    let n = usize_to_f64(logits.len());
    let mean_x = logits.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = logits.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = logits.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = logits
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    if sxx == 0.0 {
        return Err(BalanceError::domain(
            "logistic fit",
            "observations share a single gap value",
        ));
    }
    let k = sxy / sxx;
    if k == 0.0 || !k.is_finite() {
        return Err(BalanceError::domain(
            "logistic fit",
            "clear rate does not vary with gap",
        ));
    }
    let x0 = mean_x - mean_y / k;
    let curve = LogisticCurve { l, k, x0 };
    let sse: f64 = observations
        .iter()
        .map(|obs| (curve.evaluate(obs.gap) - obs.clear_rate).powi(2))
        .sum();
    Ok(LogisticFit {
        curve,
        rmse: (sse / n).sqrt(),
        points: observations.len(),
    })
}

/// Request for the tuner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCurveSpec {
    /// Curve to tune; fitted from `observations` when absent.
    #[serde(default)]
    pub curve: Option<LogisticCurve>,
    #[serde(default)]
    pub observations: Vec<Observation>,
    /// Ceiling used when fitting without a configured curve.
    #[serde(default)]
    pub fit_ceiling: Option<f64>,
    pub target_clear_probability: f64,
    #[serde(default = "default_retry_target")]
    pub retry_target: f64,
    /// Gaps tabulated in the report.
    #[serde(default)]
    pub gaps: Vec<f64>,
    /// Gap the encounter is designed around; enables the midpoint and
    /// steepness solves.
    #[serde(default)]
    pub reference_gap: Option<f64>,
}

const fn default_retry_target() -> f64 {
    DEFAULT_RETRY_TARGET
}

impl Default for ClearCurveSpec {
    fn default() -> Self {
        Self {
            curve: Some(LogisticCurve {
                l: 1.0,
                k: 1.0,
                x0: 0.0,
            }),
            observations: Vec::new(),
            fit_ceiling: None,
            target_clear_probability: 0.5,
            retry_target: DEFAULT_RETRY_TARGET,
            gaps: Vec::new(),
            reference_gap: None,
        }
    }
}

impl ClearCurveSpec {
    /// Built-in demo tuning request used when no payload is supplied.
    #[must_use]
    pub fn load_from_static() -> Self {
        serde_json::from_str(DEFAULT_SAMPLE).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `BalanceError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        match &self.curve {
            Some(curve) => curve.validate("curve")?,
            None if self.observations.is_empty() => {
                return Err(BalanceError::config(
                    "curve",
                    "a curve or observations to fit one are required",
                ));
            }
            None => {}
        }
        if let Some(ceiling) = self.fit_ceiling
            && !(ceiling > 0.0 && ceiling <= 1.0)
        {
            return Err(BalanceError::config("fit_ceiling", "must lie in (0, 1]"));
        }
        if !self.target_clear_probability.is_finite() {
            return Err(BalanceError::config(
                "target_clear_probability",
                "must be finite",
            ));
        }
        if !(self.retry_target > 0.0 && self.retry_target < 1.0) {
            return Err(BalanceError::config("retry_target", "must lie in (0, 1)"));
        }
        if let Some(idx) = self.gaps.iter().position(|g| !g.is_finite()) {
            return Err(BalanceError::config(format!("gaps[{idx}]"), "must be finite"));
        }
        if self.reference_gap.is_some_and(|g| !g.is_finite()) {
            return Err(BalanceError::config("reference_gap", "must be finite"));
        }
        Ok(())
    }

    fn ceiling(&self) -> f64 {
        self.fit_ceiling
            .or_else(|| self.curve.map(|c| c.l))
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRow {
    pub gap: f64,
    pub clear_probability: f64,
    /// Absent when the curve saturates to zero at this gap.
    pub expected_attempts: Option<f64>,
    pub retry_allowance: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearReport {
    pub curve: LogisticCurve,
    pub fit: Option<LogisticFit>,
    pub target_clear_probability: f64,
    pub solved_gap: f64,
    pub expected_attempts: f64,
    pub retry_target: f64,
    pub retry_allowance: u64,
    pub reference_gap: Option<f64>,
    pub midpoint_for_reference: Option<f64>,
    pub steepness_for_reference: Option<f64>,
    /// Why no steepness was solved for the reference gap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steepness_unavailable: Option<String>,
    pub table: Vec<GapRow>,
}

fn gap_row(curve: &LogisticCurve, gap: f64, retry_target: f64) -> Result<GapRow> {
    let probability = curve.evaluate(gap);
    if probability <= 0.0 {
        return Ok(GapRow {
            gap,
            clear_probability: probability,
            expected_attempts: None,
            retry_allowance: None,
        });
    }
    let capped = probability.min(1.0);
    Ok(GapRow {
        gap,
        clear_probability: probability,
        expected_attempts: Some(geometric_expectation(capped)?),
        retry_allowance: Some(geometric_percentile(capped, retry_target)?),
    })
}

/// Solve the gap for the target clear rate and tabulate attempts and retries.
///
/// # Errors
///
/// Returns `BalanceError::Config` for an invalid request and
/// `BalanceError::Domain` when the target lies outside `(0, L)`.
pub fn tune_clear_curve(spec: &ClearCurveSpec) -> Result<ClearReport> {
    spec.validate()?;
    let fit = if spec.observations.is_empty() {
        None
    } else {
        Some(fit_logistic(&spec.observations, spec.ceiling())?)
    };
    let curve = match (spec.curve, &fit) {
        (Some(curve), _) => curve,
        (None, Some(fit)) => fit.curve,
        (None, None) => {
            return Err(BalanceError::config("curve", "no curve to tune"));
        }
    };
    if let Some(fit) = &fit {
        log::debug!(
            "fitted clear curve k={:.4} x0={:.4} over {} points (rmse {:.4})",
            fit.curve.k,
            fit.curve.x0,
            fit.points,
            fit.rmse
        );
    }

    let target = spec.target_clear_probability;
    let solved_gap = curve.inverse(target)?;
    let expected_attempts = geometric_expectation(target)?;
    let retry_allowance = geometric_percentile(target, spec.retry_target)?;

    let mut steepness_unavailable = None;
    let (midpoint_for_reference, steepness_for_reference) = match spec.reference_gap {
        Some(gap) => {
            let midpoint = solve_midpoint(gap, target, curve.l, curve.k)?;
            // A reference gap at the midpoint pins the rate to L/2 for any k.
            let steepness = match solve_steepness(gap, target, curve.l, curve.x0) {
                Ok(k) => Some(k),
                Err(BalanceError::Domain { reason, .. }) => {
                    log::warn!("no steepness for reference gap {gap}: {reason}");
                    steepness_unavailable = Some(reason);
                    None
                }
                Err(err) => return Err(err),
            };
            (Some(midpoint), steepness)
        }
        None => (None, None),
    };

    let table = spec
        .gaps
        .iter()
        .map(|gap| gap_row(&curve, *gap, spec.retry_target))
        .collect::<Result<Vec<_>>>()?;

    Ok(ClearReport {
        curve,
        fit,
        target_clear_probability: target,
        solved_gap,
        expected_attempts,
        retry_target: spec.retry_target,
        retry_allowance,
        reference_gap: spec.reference_gap,
        midpoint_for_reference,
        steepness_for_reference,
        steepness_unavailable,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURVE: LogisticCurve = LogisticCurve {
        l: 0.95,
        k: 0.08,
        x0: -10.0,
    };

    #[test]
    fn inverse_then_forward_round_trips() {
        for target in [0.05, 0.3, 0.5, 0.7, 0.9] {
            let gap = CURVE.inverse(target).unwrap();
            assert!((CURVE.evaluate(gap) - target).abs() < 1e-9);
        }
        assert!(matches!(
            CURVE.inverse(0.95),
            Err(BalanceError::Domain { .. })
        ));
    }

    #[test]
    fn midpoint_and_steepness_hit_target() {
        let x0 = solve_midpoint(5.0, 0.7, CURVE.l, CURVE.k).unwrap();
        let moved = LogisticCurve { x0, ..CURVE };
        assert!((moved.evaluate(5.0) - 0.7).abs() < 1e-9);

        let k = solve_steepness(5.0, 0.7, CURVE.l, CURVE.x0).unwrap();
        let steeper = LogisticCurve { k, ..CURVE };
        assert!((steeper.evaluate(5.0) - 0.7).abs() < 1e-9);
        assert!(solve_steepness(CURVE.x0, 0.7, CURVE.l, CURVE.x0).is_err());
    }

    #[test]
    fn fit_recovers_exact_curve() {
        let truth = LogisticCurve {
            l: 1.0,
            k: 0.2,
            x0: 3.0,
        };
        let observations: Vec<Observation> = [-10.0, -4.0, 0.0, 3.0, 8.0, 15.0]
            .into_iter()
            .map(|gap| Observation {
                gap,
                clear_rate: truth.evaluate(gap),
            })
            .collect();
        let fit = fit_logistic(&observations, 1.0).unwrap();
        assert!((fit.curve.k - 0.2).abs() < 1e-9);
        assert!((fit.curve.x0 - 3.0).abs() < 1e-9);
        assert!(fit.rmse < 1e-9);
    }

    #[test]
    fn fit_rejects_degenerate_points() {
        let same_gap = [
            Observation {
                gap: 1.0,
                clear_rate: 0.2,
            },
            Observation {
                gap: 1.0,
                clear_rate: 0.6,
            },
        ];
        assert!(matches!(
            fit_logistic(&same_gap, 1.0),
            Err(BalanceError::Domain { .. })
        ));
        let saturated = [
            Observation {
                gap: 1.0,
                clear_rate: 1.0,
            },
            Observation {
                gap: 2.0,
                clear_rate: 0.6,
            },
        ];
        let err = fit_logistic(&saturated, 1.0).unwrap_err();
        assert_eq!(err.field(), Some("observations[0].clear_rate"));
    }

    #[test]
    fn tuner_reports_retry_allowance() {
        let spec = ClearCurveSpec {
            curve: Some(CURVE),
            target_clear_probability: 0.4,
            gaps: vec![-600.0, 0.0],
            reference_gap: Some(0.0),
            ..ClearCurveSpec::default()
        };
        let report = tune_clear_curve(&spec).unwrap();
        assert_eq!(report.expected_attempts, 2.5);
        // 1 - 0.6^6 = 0.953
        assert_eq!(report.retry_allowance, 6);
        assert!((CURVE.evaluate(report.solved_gap) - 0.4).abs() < 1e-9);
        assert_eq!(report.table[0].clear_probability, 0.0);
        assert!(report.table[0].expected_attempts.is_none());
        assert!(report.table[1].retry_allowance.is_some());
        assert!(report.midpoint_for_reference.is_some());
    }

    #[test]
    fn reference_gap_at_midpoint_explains_missing_steepness() {
        let spec = ClearCurveSpec {
            curve: Some(CURVE),
            target_clear_probability: 0.4,
            reference_gap: Some(CURVE.x0),
            ..ClearCurveSpec::default()
        };
        let report = tune_clear_curve(&spec).unwrap();
        assert!(report.midpoint_for_reference.is_some());
        assert!(report.steepness_for_reference.is_none());
        assert!(report.steepness_unavailable.is_some_and(|why| why.contains("L/2")));

        let off_midpoint = tune_clear_curve(&ClearCurveSpec {
            reference_gap: Some(0.0),
            ..spec
        })
        .unwrap();
        assert!(off_midpoint.steepness_for_reference.is_some());
        assert!(off_midpoint.steepness_unavailable.is_none());
    }

    #[test]
    fn invalid_curve_is_config_error() {
        let spec = ClearCurveSpec {
            curve: Some(LogisticCurve {
                l: 1.5,
                k: 1.0,
                x0: 0.0,
            }),
            ..ClearCurveSpec::default()
        };
        assert_eq!(tune_clear_curve(&spec).unwrap_err().field(), Some("curve.l"));
        let missing = ClearCurveSpec {
            curve: None,
            ..ClearCurveSpec::default()
        };
        assert_eq!(missing.validate().unwrap_err().field(), Some("curve"));
    }
}
