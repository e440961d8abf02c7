//! Ordinal threshold tables and truncated-normal sampling for the probit
//! augmentation.

use statrs::function::erf::{erfc, erfc_inv};

/// Probability mass below which an interval is sampled with the tail
/// approximation instead of the inverse CDF.
const MIN_INTERVAL_MASS: f64 = 1.0e-300;
/// Uniforms are kept this far from 0 and 1 before inversion.
const UNIFORM_MARGIN: f64 = 1.0e-16;
/// Spacing of the initial interior thresholds.
const INITIAL_THRESHOLD_GAP: f64 = 1.0;

/// Standard normal CDF.
#[must_use]
pub fn standard_normal_cdf(value: f64) -> f64 {
    0.5 * erfc(-value / std::f64::consts::SQRT_2)
}

/// Standard normal quantile.
#[must_use]
pub fn standard_normal_quantile(probability: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * probability)
}

/// Cut points `[-inf, 0, tau_2, ..., tau_{K-1}, +inf]` for `K` categories.
#[must_use]
pub fn initial_cut_points(n_categories: usize) -> Vec<f64> {
    let n_categories = n_categories.max(2);
    let mut cuts = Vec::with_capacity(n_categories + 1);
    cuts.push(f64::NEG_INFINITY);
    let mut value = 0.0;
    for _ in 1..n_categories {
        cuts.push(value);
        value += INITIAL_THRESHOLD_GAP;
    }
    cuts.push(f64::INFINITY);
    cuts
}

/// Admissible interval `(lower, upper]` of `category`.
#[must_use]
pub fn category_interval(cuts: &[f64], category: usize) -> (f64, f64) {
    (cuts[category], cuts[category + 1])
}

/// Category whose interval contains `z`.
#[must_use]
pub fn category_of(z: f64, cuts: &[f64]) -> usize {
    let last = cuts.len().saturating_sub(2);
    (0..last).find(|category| z <= cuts[category + 1]).unwrap_or(last)
}

/// Deterministic starting value inside a category interval.
#[must_use]
pub fn initial_latent_response(cuts: &[f64], category: usize) -> f64 {
    let (lower, upper) = category_interval(cuts, category);
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => 0.5 * (lower + upper),
        (true, false) => lower + 0.5,
        (false, true) => upper - 0.5,
        (false, false) => 0.0,
    }
}

/// One truncated-normal draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedDraw {
    pub value: f64,
    /// The interval carried negligible mass and a tail approximation or
    /// boundary value was used.
    pub used_fallback: bool,
}

/// Draw from `Normal(mean, 1)` restricted to `(lower, upper]`, driven by one
/// uniform on `[0, 1)`. The result always satisfies `lower < value <= upper`.
#[must_use]
pub fn sample_truncated_normal(mean: f64, lower: f64, upper: f64, uniform: f64) -> TruncatedDraw {
    let draw = sample_truncated_standard_normal(lower - mean, upper - mean, uniform);
    TruncatedDraw {
        value: clamp_to_interval(mean + draw.value, lower, upper),
        used_fallback: draw.used_fallback,
    }
}

/// Draw from a standard normal restricted to `(lower, upper]`.
#[must_use]
pub fn sample_truncated_standard_normal(lower: f64, upper: f64, uniform: f64) -> TruncatedDraw {
    if lower >= 0.0 {
        // the lower tail is computed accurately, so reflect onto it
        let reflected = sample_truncated_standard_normal(-upper, -lower, uniform);
        return TruncatedDraw {
            value: clamp_to_interval(-reflected.value, lower, upper),
            used_fallback: reflected.used_fallback,
        };
    }

    let uniform = uniform.clamp(UNIFORM_MARGIN, 1.0 - UNIFORM_MARGIN);
    let lower_mass = standard_normal_cdf(lower);
    let mass = standard_normal_cdf(upper) - lower_mass;
    if mass > MIN_INTERVAL_MASS && mass.is_finite() {
        let value = standard_normal_quantile(uniform.mul_add(mass, lower_mass));
        if value.is_finite() {
            return TruncatedDraw {
                value: clamp_to_interval(value, lower, upper),
                used_fallback: false,
            };
        }
    }

    TruncatedDraw {
        value: lower_tail_approximation(lower, upper, uniform),
        used_fallback: true,
    }
}

/// Exponential approximation of a far lower tail `(lower, upper]` with
/// `upper << 0`; distances below `upper` decay at rate `|upper|`.
fn lower_tail_approximation(lower: f64, upper: f64, uniform: f64) -> f64 {
    if !upper.is_finite() {
        return clamp_to_interval(lower + 1.0, lower, upper);
    }
    let exponential = -(1.0 - uniform).ln();
    let rate = upper.abs().max(1.0);
    let width = upper - lower;
    clamp_to_interval(upper - (exponential / rate).min(width), lower, upper)
}

fn clamp_to_interval(value: f64, lower: f64, upper: f64) -> f64 {
    if value.is_nan() {
        return if upper.is_finite() { upper } else { lower.next_up() };
    }
    if value <= lower {
        if lower.is_finite() { lower.next_up() } else { upper }
    } else if value > upper {
        upper
    } else {
        value
    }
}
