//! Numeric conversion helpers centralizing safe numeric casts.

use num_traits::cast::cast;

use crate::constants::PROBABILITY_STEPS;

/// Convert a count to f64 while allowing precision loss in a single location.
#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    cast::<usize, f64>(value).unwrap_or(f64::MAX)
}

/// Convert u64 to f64 while allowing precision loss in a single location.
#[must_use]
pub fn u64_to_f64(value: u64) -> f64 {
    cast::<u64, f64>(value).unwrap_or(f64::MAX)
}

/// Ceil a f64 and clamp it to the u64 range, returning 0 for non-finite or negative values.
#[must_use]
pub fn ceil_f64_to_u64(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let max = cast::<u64, f64>(u64::MAX).unwrap_or(f64::MAX);
    cast::<f64, u64>(value.min(max).ceil()).unwrap_or(u64::MAX)
}

/// Ceil a f64 into a 1-indexed rank no larger than `len`.
#[must_use]
pub fn ceil_rank(value: f64, len: usize) -> usize {
    let rank = cast::<f64, usize>(value.max(1.0).ceil()).unwrap_or(len);
    rank.clamp(1, len.max(1))
}

/// Clamp into `[0, 1]` and snap to the probability grid.
#[must_use]
pub fn snap_probability(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    let clamped = value.clamp(0.0, 1.0);
    (clamped * PROBABILITY_STEPS).round() / PROBABILITY_STEPS
}

/// Absolute-or-relative closeness test used by invariant checks.
#[must_use]
pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}
