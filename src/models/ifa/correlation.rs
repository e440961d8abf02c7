//! One-to-one map between unconstrained vectors and correlation matrices.
//!
//! The free vector holds one canonical partial correlation per strictly
//! lower-triangular entry, row by row, on the `atanh` scale. Each row of the
//! Cholesky factor is built on the unit sphere, so every finite free vector
//! maps to a valid correlation factor up to floating-point saturation.

use faer::Mat;

use crate::utils::usize_to_f64;

/// Candidates whose Cholesky diagonal drops below this are treated as
/// not positive definite.
pub const MIN_CHOLESKY_DIAGONAL: f64 = 1.0e-8;

/// Number of free parameters of a `dim x dim` correlation matrix.
#[must_use]
pub const fn free_parameter_count(dim: usize) -> usize {
    dim * dim.saturating_sub(1) / 2
}

/// Cholesky factor of a correlation matrix together with the log-Jacobian of
/// the map from the free vector.
#[derive(Debug, Clone)]
pub struct CorrelationFactor {
    pub lower: Mat<f64>,
    pub log_jacobian: f64,
}

/// Map a free vector to a correlation Cholesky factor.
///
/// Returns `None` when the result is numerically singular or non-finite.
#[must_use]
pub fn cholesky_from_free(free: &[f64], dim: usize) -> Option<CorrelationFactor> {
    if free.len() != free_parameter_count(dim) {
        return None;
    }
    let mut lower = Mat::<f64>::zeros(dim, dim);
    if dim == 0 {
        return Some(CorrelationFactor {
            lower,
            log_jacobian: 0.0,
        });
    }
    lower[(0, 0)] = 1.0;

    let mut log_jacobian = 0.0_f64;
    let mut cursor = 0usize;
    for row in 1..dim {
        let mut sum_sqs = 0.0_f64;
        for col in 0..row {
            let partial = free[cursor].tanh();
            cursor += 1;
            log_jacobian += (-partial * partial).ln_1p();

            let remaining = 1.0 - sum_sqs;
            if col > 0 {
                log_jacobian += 0.5 * remaining.ln();
            }
            let value = partial * remaining.max(0.0).sqrt();
            lower[(row, col)] = value;
            sum_sqs += value * value;
        }
        lower[(row, row)] = (1.0 - sum_sqs).max(0.0).sqrt();
    }

    let valid = log_jacobian.is_finite()
        && (0..dim).all(|idx| lower[(idx, idx)] > MIN_CHOLESKY_DIAGONAL)
        && (0..dim).all(|row| (0..=row).all(|col| lower[(row, col)].is_finite()));
    valid.then_some(CorrelationFactor {
        lower,
        log_jacobian,
    })
}

/// Inverse of [`cholesky_from_free`].
#[must_use]
pub fn free_from_cholesky(lower: &Mat<f64>) -> Vec<f64> {
    let dim = lower.ncols();
    let mut free = Vec::with_capacity(free_parameter_count(dim));
    for row in 1..dim {
        let mut sum_sqs = 0.0_f64;
        for col in 0..row {
            let value = lower[(row, col)];
            let scale = (1.0 - sum_sqs).max(f64::MIN_POSITIVE).sqrt();
            free.push((value / scale).clamp(-1.0, 1.0).atanh());
            sum_sqs += value * value;
        }
    }
    free
}

/// `L L'` with the diagonal pinned to exactly one.
#[must_use]
pub fn correlation_from_cholesky(lower: &Mat<f64>) -> Mat<f64> {
    let dim = lower.ncols();
    Mat::from_fn(dim, dim, |row, col| {
        if row == col {
            1.0
        } else {
            (0..=row.min(col))
                .map(|k| lower[(row, k)] * lower[(col, k)])
                .sum::<f64>()
        }
    })
}

/// Whether `matrix` is symmetric with unit diagonal and positive definite.
#[must_use]
pub fn is_correlation_matrix(matrix: &Mat<f64>, tolerance: f64) -> bool {
    let dim = matrix.ncols();
    matrix.nrows() == dim
        && (0..dim).all(|idx| (matrix[(idx, idx)] - 1.0).abs() <= tolerance)
        && crate::utils::matrix_is_symmetric(matrix, tolerance)
        && crate::utils::cholesky_lower(matrix).is_ok()
}

/// Average absolute off-diagonal correlation, used in adaptation logs.
#[must_use]
pub fn mean_abs_off_diagonal(matrix: &Mat<f64>) -> f64 {
    let dim = matrix.ncols();
    if dim < 2 {
        return 0.0;
    }
    let total: f64 = (1..dim)
        .flat_map(|row| (0..row).map(move |col| (row, col)))
        .map(|(row, col)| matrix[(row, col)].abs())
        .sum();
    total / usize_to_f64(free_parameter_count(dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_free_vector_is_identity() {
        let factor = cholesky_from_free(&[0.0; 3], 3).expect("valid factor");
        let corr = correlation_from_cholesky(&factor.lower);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(corr[(i, j)], expected, epsilon = 1e-12);
            }
        }
        assert_relative_eq!(factor.log_jacobian, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn free_vector_round_trips_through_factor() {
        let free = [0.4, -1.1, 0.25, 0.9, -0.3, 0.05];
        let factor = cholesky_from_free(&free, 4).expect("valid factor");
        let recovered = free_from_cholesky(&factor.lower);
        for (a, b) in recovered.iter().zip(free) {
            assert_relative_eq!(*a, b, epsilon = 1e-10);
        }
        let corr = correlation_from_cholesky(&factor.lower);
        assert!(is_correlation_matrix(&corr, 1e-10));
    }

    #[test]
    fn two_factor_correlation_is_tanh() {
        let factor = cholesky_from_free(&[0.7], 2).expect("valid factor");
        let corr = correlation_from_cholesky(&factor.lower);
        assert_relative_eq!(corr[(1, 0)], 0.7_f64.tanh(), epsilon = 1e-12);
        assert_relative_eq!(
            factor.log_jacobian,
            (1.0 - 0.7_f64.tanh().powi(2)).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn saturated_free_vector_is_rejected() {
        assert!(cholesky_from_free(&[40.0], 2).is_none());
        assert!(cholesky_from_free(&[0.1, 0.2], 2).is_none());
    }

    #[test]
    fn rejects_non_correlation_matrix() {
        let not_unit = Mat::from_fn(2, 2, |i, j| if i == j { 2.0 } else { 0.1 });
        assert!(!is_correlation_matrix(&not_unit, 1e-9));
        let indefinite = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 1.0 });
        assert!(!is_correlation_matrix(&indefinite, 1e-9));
    }
}
