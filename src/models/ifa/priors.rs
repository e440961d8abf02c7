//! Item prior specifications and log-density helpers.

use faer::Mat;
use statrs::function::gamma::ln_gamma;

use super::types::IfaError;

/// Normal priors on item difficulties and discriminations.
#[derive(Debug, Clone)]
pub struct ItemPriors {
    pub difficulty_mean: Vec<f64>,
    pub difficulty_sd: Vec<f64>,
    /// `m x q` prior means of the discriminations.
    pub discrimination_mean: Mat<f64>,
    /// `m x q` prior standard deviations of the discriminations.
    pub discrimination_sd: Mat<f64>,
}

impl ItemPriors {
    #[must_use]
    pub const fn new(
        difficulty_mean: Vec<f64>,
        difficulty_sd: Vec<f64>,
        discrimination_mean: Mat<f64>,
        discrimination_sd: Mat<f64>,
    ) -> Self {
        Self {
            difficulty_mean,
            difficulty_sd,
            discrimination_mean,
            discrimination_sd,
        }
    }

    /// Same prior for every item and factor.
    #[must_use]
    pub fn broadcast(
        n_items: usize,
        n_factors: usize,
        difficulty: (f64, f64),
        discrimination: (f64, f64),
    ) -> Self {
        Self {
            difficulty_mean: vec![difficulty.0; n_items],
            difficulty_sd: vec![difficulty.1; n_items],
            discrimination_mean: Mat::from_fn(n_items, n_factors, |_, _| discrimination.0),
            discrimination_sd: Mat::from_fn(n_items, n_factors, |_, _| discrimination.1),
        }
    }

    /// # Errors
    ///
    /// Returns `IfaError` on shape mismatches, non-finite means or
    /// non-positive standard deviations.
    pub fn validate(&self, n_items: usize, n_factors: usize) -> Result<(), IfaError> {
        for (what, values) in [
            ("difficulty prior mean", &self.difficulty_mean),
            ("difficulty prior sd", &self.difficulty_sd),
        ] {
            if values.len() != n_items {
                return Err(IfaError::LengthMismatch {
                    what,
                    expected: n_items,
                    found: values.len(),
                });
            }
        }
        for (what, matrix) in [
            ("discrimination prior mean", &self.discrimination_mean),
            ("discrimination prior sd", &self.discrimination_sd),
        ] {
            if matrix.nrows() != n_items || matrix.ncols() != n_factors {
                return Err(IfaError::DimensionMismatch {
                    what,
                    expected_rows: n_items,
                    expected_cols: n_factors,
                    rows: matrix.nrows(),
                    cols: matrix.ncols(),
                });
            }
        }

        if self.difficulty_mean.iter().any(|value| !value.is_finite()) {
            return Err(IfaError::NonFinitePriorMean("difficulty prior mean"));
        }
        if !self.difficulty_sd.iter().copied().all(is_valid_scale) {
            return Err(IfaError::InvalidPriorScale("difficulty prior sd"));
        }
        for item in 0..n_items {
            for factor in 0..n_factors {
                if !self.discrimination_mean[(item, factor)].is_finite() {
                    return Err(IfaError::NonFinitePriorMean("discrimination prior mean"));
                }
                if !is_valid_scale(self.discrimination_sd[(item, factor)]) {
                    return Err(IfaError::InvalidPriorScale("discrimination prior sd"));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_scale(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Unnormalized LKJ(`eta`) log-density of a correlation matrix, evaluated on
/// its lower Cholesky factor.
#[must_use]
pub fn log_lkj_cholesky_density(lower: &Mat<f64>, eta: f64) -> f64 {
    let dim = lower.ncols();
    let shape_term = 2.0f64.mul_add(eta, -2.0);
    (1..dim)
        .map(|idx| {
            let exponent = crate::utils::usize_to_f64(dim - idx - 1) + shape_term;
            exponent * lower[(idx, idx)].ln()
        })
        .sum()
}

/// Log-density of `Gamma(shape, rate)`.
#[must_use]
pub fn log_gamma_density(value: f64, shape: f64, rate: f64) -> f64 {
    if !(value > 0.0 && shape > 0.0 && rate > 0.0) {
        return f64::NEG_INFINITY;
    }
    shape.mul_add(rate.ln(), -ln_gamma(shape)) + (shape - 1.0).mul_add(value.ln(), -rate * value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn broadcast_priors_are_valid() {
        let priors = ItemPriors::broadcast(4, 2, (0.0, 2.0), (0.5, 1.0));
        assert!(priors.validate(4, 2).is_ok());
    }

    #[test]
    fn validate_rejects_zero_sd() {
        let mut priors = ItemPriors::broadcast(3, 1, (0.0, 1.0), (0.0, 1.0));
        priors.discrimination_sd[(1, 0)] = 0.0;
        assert_eq!(
            priors.validate(3, 1),
            Err(IfaError::InvalidPriorScale("discrimination prior sd"))
        );
    }

    #[test]
    fn validate_rejects_shape_mismatch() {
        let priors = ItemPriors::broadcast(3, 1, (0.0, 1.0), (0.0, 1.0));
        assert!(matches!(
            priors.validate(4, 1),
            Err(IfaError::LengthMismatch { .. })
        ));
        assert!(matches!(
            priors.validate(3, 2),
            Err(IfaError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn lkj_with_unit_shape_is_flat_for_two_factors() {
        let lower = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 1.0,
            (1, 0) => 0.6,
            (1, 1) => 0.8,
            _ => 0.0,
        });
        assert_relative_eq!(log_lkj_cholesky_density(&lower, 1.0), 0.0, epsilon = 1e-12);
        // eta = 2 adds 2 * log(L_11)
        assert_relative_eq!(
            log_lkj_cholesky_density(&lower, 2.0),
            2.0 * 0.8_f64.ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn gamma_density_matches_exponential_case() {
        assert_relative_eq!(log_gamma_density(2.0, 1.0, 3.0), 3.0_f64.ln() - 6.0, epsilon = 1e-12);
        assert!(log_gamma_density(0.0, 2.0, 1.0).is_infinite());
    }
}
