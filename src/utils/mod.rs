/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared linear algebra, random-number and threading utilities for the samplers.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared helpers for factorizing dense systems (hand-rolled for the small
//! per-respondent blocks, faer's LLT for the joint spatial systems), drawing
//! standard random variates, and splitting independent work across threads.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};
use rand::RngExt;
use rand::rngs::StdRng;
use thiserror::Error;

/// Work lists shorter than this run on the calling thread.
const PARALLEL_MIN_ITEMS: usize = 64;

/// Failures of the dense linear algebra helpers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinalgError {
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("matrix must be square; found {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// Lower Cholesky factor `L` with `L L' = matrix`.
///
/// # Errors
///
/// Returns `LinalgError` if the matrix is not square or a pivot is not
/// strictly positive.
pub fn cholesky_lower(matrix: &Mat<f64>) -> Result<Mat<f64>, LinalgError> {
    let dim = matrix.ncols();
    if matrix.nrows() != dim {
        return Err(LinalgError::NotSquare {
            rows: matrix.nrows(),
            cols: dim,
        });
    }
    let mut lower = Mat::<f64>::zeros(dim, dim);
    for row in 0..dim {
        for col in 0..=row {
            let mut sum = matrix[(row, col)];
            for k in 0..col {
                sum -= lower[(row, k)] * lower[(col, k)];
            }
            if row == col {
                if !(sum > 0.0 && sum.is_finite()) {
                    return Err(LinalgError::NotPositiveDefinite);
                }
                lower[(row, col)] = sum.sqrt();
            } else {
                lower[(row, col)] = sum / lower[(col, col)];
            }
        }
    }
    Ok(lower)
}

/// Cholesky factor with an escalating diagonal jitter for nearly singular input.
///
/// # Errors
///
/// Returns `LinalgError::NotPositiveDefinite` if no jitter up to `1e-2` helps.
pub fn cholesky_with_jitter(matrix: &Mat<f64>) -> Result<Mat<f64>, LinalgError> {
    if let Ok(lower) = cholesky_lower(matrix) {
        return Ok(lower);
    }
    let dim = matrix.ncols();
    let mut jitter = 1.0e-10;
    for _ in 0..9 {
        let regularized = Mat::from_fn(dim, dim, |row, col| {
            if row == col {
                matrix[(row, col)] + jitter
            } else {
                matrix[(row, col)]
            }
        });
        if let Ok(lower) = cholesky_lower(&regularized) {
            return Ok(lower);
        }
        jitter *= 10.0;
    }
    Err(LinalgError::NotPositiveDefinite)
}

/// faer LLT factorization, retried with an escalating diagonal jitter.
///
/// Used for the large joint systems; [`cholesky_with_jitter`] covers the
/// small per-respondent blocks.
///
/// # Errors
///
/// Returns `LinalgError` if the matrix is not square or no jitter up to
/// `1e-2` makes it positive definite.
pub fn dense_llt_with_jitter(matrix: &Mat<f64>) -> Result<Llt<f64>, LinalgError> {
    let dim = matrix.ncols();
    if matrix.nrows() != dim {
        return Err(LinalgError::NotSquare {
            rows: matrix.nrows(),
            cols: dim,
        });
    }
    if !matrix_is_finite(matrix) {
        return Err(LinalgError::NotPositiveDefinite);
    }
    if let Ok(factor) = Llt::new(matrix.as_ref(), Side::Lower) {
        return Ok(factor);
    }
    let mut jitter = 1.0e-10;
    for _ in 0..9 {
        let regularized = Mat::from_fn(dim, dim, |row, col| {
            if row == col {
                matrix[(row, col)] + jitter
            } else {
                matrix[(row, col)]
            }
        });
        if let Ok(factor) = Llt::new(regularized.as_ref(), Side::Lower) {
            return Ok(factor);
        }
        jitter *= 10.0;
    }
    Err(LinalgError::NotPositiveDefinite)
}

/// Lower Cholesky factor of a large dense matrix via faer.
///
/// # Errors
///
/// Same as [`dense_llt_with_jitter`].
pub fn dense_cholesky_with_jitter(matrix: &Mat<f64>) -> Result<Mat<f64>, LinalgError> {
    Ok(dense_llt_with_jitter(matrix)?.L().to_owned())
}

/// Draw from `N(P^{-1} b, P^{-1})` for a large dense precision `P`.
///
/// With `P = L L'`, `P^{-1} (b + L z)` has the required mean and covariance,
/// so one faer solve gives the draw.
///
/// # Errors
///
/// Returns `LinalgError` if `P` cannot be factorized.
pub fn draw_from_dense_precision(
    precision: &Mat<f64>,
    canonical: &[f64],
    standard_normals: &[f64],
) -> Result<Vec<f64>, LinalgError> {
    let factor = dense_llt_with_jitter(precision)?;
    let dim = canonical.len();
    let noise = Mat::from_fn(dim, 1, |row, _| standard_normals[row]);
    let shifted = factor.L() * noise.as_ref();
    let rhs = Mat::from_fn(dim, 1, |row, _| canonical[row] + shifted[(row, 0)]);
    let draw = factor.solve(rhs.as_ref());
    Ok((0..dim).map(|row| draw[(row, 0)]).collect())
}

/// Solve `L x = b` for lower-triangular `L`.
#[must_use]
pub fn forward_substitute(lower: &Mat<f64>, rhs: &[f64]) -> Vec<f64> {
    let dim = rhs.len();
    let mut solution = vec![0.0; dim];
    for row in 0..dim {
        let mut sum = rhs[row];
        for col in 0..row {
            sum -= lower[(row, col)] * solution[col];
        }
        solution[row] = sum / lower[(row, row)];
    }
    solution
}

/// Solve `L' x = b` for lower-triangular `L`.
#[must_use]
pub fn backward_substitute_transpose(lower: &Mat<f64>, rhs: &[f64]) -> Vec<f64> {
    let dim = rhs.len();
    let mut solution = vec![0.0; dim];
    for row in (0..dim).rev() {
        let mut sum = rhs[row];
        for col in row + 1..dim {
            sum -= lower[(col, row)] * solution[col];
        }
        solution[row] = sum / lower[(row, row)];
    }
    solution
}

/// Inverse of a lower-triangular matrix (itself lower-triangular).
#[must_use]
pub fn lower_triangular_inverse(lower: &Mat<f64>) -> Mat<f64> {
    let dim = lower.ncols();
    let mut inverse = Mat::<f64>::zeros(dim, dim);
    let mut basis = vec![0.0; dim];
    for col in 0..dim {
        basis.iter_mut().for_each(|value| *value = 0.0);
        basis[col] = 1.0;
        let solution = forward_substitute(lower, &basis);
        for row in col..dim {
            inverse[(row, col)] = solution[row];
        }
    }
    inverse
}

/// `log det(L L')` from a Cholesky factor.
#[must_use]
pub fn log_det_from_cholesky(lower: &Mat<f64>) -> f64 {
    2.0 * (0..lower.ncols())
        .map(|idx| lower[(idx, idx)].ln())
        .sum::<f64>()
}

/// Draw from `N(mean, P^{-1})` given the lower Cholesky factor of the precision `P`
/// and the canonical vector `P mean`, consuming one standard normal per dimension.
#[must_use]
pub fn draw_from_precision(
    precision_chol: &Mat<f64>,
    canonical: &[f64],
    standard_normals: &[f64],
) -> Vec<f64> {
    let half = forward_substitute(precision_chol, canonical);
    let mean = backward_substitute_transpose(precision_chol, &half);
    let noise = backward_substitute_transpose(precision_chol, standard_normals);
    mean.iter().zip(noise).map(|(mu, eps)| mu + eps).collect()
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

#[must_use]
pub fn matrix_is_symmetric(matrix: &Mat<f64>, tolerance: f64) -> bool {
    if matrix.nrows() != matrix.ncols() {
        return false;
    }
    for row in 0..matrix.nrows() {
        for col in 0..row {
            if (matrix[(row, col)] - matrix[(col, row)]).abs() > tolerance {
                return false;
            }
        }
    }
    true
}

#[must_use]
pub fn identity_matrix(dim: usize) -> Mat<f64> {
    Mat::from_fn(dim, dim, |row, col| if row == col { 1.0 } else { 0.0 })
}

#[must_use]
pub fn row_to_vec(matrix: &Mat<f64>, row: usize) -> Vec<f64> {
    (0..matrix.ncols()).map(|col| matrix[(row, col)]).collect()
}

#[must_use]
pub fn dot(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

/// Lower-triangular matrix-vector product `L v`.
#[must_use]
pub fn lower_mul_vec(lower: &Mat<f64>, values: &[f64]) -> Vec<f64> {
    (0..lower.nrows())
        .map(|row| (0..=row).map(|col| lower[(row, col)] * values[col]).sum())
        .collect()
}

pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

pub fn standard_normals(rng: &mut StdRng, count: usize) -> Vec<f64> {
    (0..count).map(|_| sample_standard_normal(rng)).collect()
}

/// Uniform draws on `[0, 1)`.
pub fn uniforms(rng: &mut StdRng, count: usize) -> Vec<f64> {
    (0..count).map(|_| rng.random::<f64>()).collect()
}

/// Map `task` over `0..count`, chunked across scoped threads for long lists.
///
/// Results are returned in index order regardless of how the work was split.
pub fn parallel_map<T, F>(count: usize, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let threads = std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(count.max(1));
    if threads <= 1 || count < PARALLEL_MIN_ITEMS {
        return (0..count).map(task).collect();
    }

    let chunk_size = count.div_ceil(threads).max(1);
    let task = &task;
    std::thread::scope(|scope| {
        let handles = (0..count)
            .step_by(chunk_size)
            .map(|chunk_start| {
                let chunk_end = (chunk_start + chunk_size).min(count);
                scope.spawn(move || (chunk_start..chunk_end).map(task).collect::<Vec<T>>())
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(count);
        for handle in handles {
            match handle.join() {
                Ok(chunk) => results.extend(chunk),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        results
    })
}

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn spd_matrix() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 4.0,
            (1, 1) => 3.0,
            (2, 2) => 2.0,
            (0, 1) | (1, 0) => 1.0,
            (1, 2) | (2, 1) => 0.5,
            _ => 0.0,
        })
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let matrix = spd_matrix();
        let lower = cholesky_lower(&matrix).expect("matrix is positive definite");
        let product = &lower * lower.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(product[(i, j)], matrix[(i, j)], epsilon = 1.0e-12);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let matrix = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 2.0 });
        assert_eq!(
            cholesky_lower(&matrix),
            Err(LinalgError::NotPositiveDefinite)
        );
    }

    #[test]
    fn jitter_rescues_singular_matrix() {
        let matrix = Mat::from_fn(2, 2, |_, _| 1.0);
        assert!(cholesky_lower(&matrix).is_err());
        assert!(cholesky_with_jitter(&matrix).is_ok());
    }

    #[test]
    fn triangular_solves_invert_products() {
        let lower = cholesky_lower(&spd_matrix()).expect("positive definite");
        let values = [0.3, -1.2, 2.0];
        let product = lower_mul_vec(&lower, &values);
        let recovered = forward_substitute(&lower, &product);
        for (a, b) in recovered.iter().zip(values) {
            assert_relative_eq!(*a, b, epsilon = 1.0e-12);
        }

        let inverse = lower_triangular_inverse(&lower);
        let identity = &inverse * &lower;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(identity[(i, j)], expected, epsilon = 1.0e-12);
            }
        }
    }

    #[test]
    fn precision_draw_without_noise_is_the_mean() {
        let precision = spd_matrix();
        let lower = cholesky_lower(&precision).expect("positive definite");
        let mean = [1.0, -0.5, 0.25];
        let canonical: Vec<f64> = (0..3)
            .map(|i| (0..3).map(|j| precision[(i, j)] * mean[j]).sum())
            .collect();
        let draw = draw_from_precision(&lower, &canonical, &[0.0; 3]);
        for (a, b) in draw.iter().zip(mean) {
            assert_relative_eq!(*a, b, epsilon = 1.0e-10);
        }
    }

    fn banded_spd(dim: usize) -> Mat<f64> {
        Mat::from_fn(dim, dim, |i, j| match i.abs_diff(j) {
            0 => 2.5,
            1 => -0.8,
            2 => 0.3,
            _ => 0.0,
        })
    }

    #[test]
    fn dense_factor_matches_small_block_factor() {
        let matrix = banded_spd(40);
        let dense = dense_cholesky_with_jitter(&matrix).expect("positive definite");
        let small = cholesky_lower(&matrix).expect("positive definite");
        for i in 0..40 {
            for j in 0..=i {
                assert_relative_eq!(dense[(i, j)], small[(i, j)], epsilon = 1.0e-10);
            }
        }
    }

    #[test]
    fn dense_precision_draw_matches_triangular_solves() {
        let precision = banded_spd(30);
        let lower = cholesky_lower(&precision).expect("positive definite");
        let canonical: Vec<f64> = (0..30).map(|i| usize_to_f64(i % 5) - 2.0).collect();
        let normals: Vec<f64> = (0..30).map(|i| usize_to_f64(i % 3) - 1.0).collect();
        let dense = draw_from_dense_precision(&precision, &canonical, &normals)
            .expect("positive definite");
        let reference = draw_from_precision(&lower, &canonical, &normals);
        for (a, b) in dense.iter().zip(reference) {
            assert_relative_eq!(*a, b, epsilon = 1.0e-9);
        }
    }

    #[test]
    fn dense_factor_rejects_non_finite_and_non_square_input() {
        let mut matrix = banded_spd(3);
        matrix[(1, 1)] = f64::NAN;
        assert_eq!(
            dense_llt_with_jitter(&matrix).err(),
            Some(LinalgError::NotPositiveDefinite)
        );
        assert_eq!(
            dense_llt_with_jitter(&Mat::zeros(2, 3)).err(),
            Some(LinalgError::NotSquare { rows: 2, cols: 3 })
        );
    }

    #[test]
    fn log_det_matches_direct_value() {
        let matrix = Mat::from_fn(2, 2, |i, j| if i == j { 2.0 } else { 0.0 });
        let lower = cholesky_lower(&matrix).expect("positive definite");
        assert_relative_eq!(log_det_from_cholesky(&lower), 4.0_f64.ln(), epsilon = 1.0e-12);
    }

    #[test]
    fn parallel_map_preserves_order() {
        let values = parallel_map(500, |idx| idx * 2);
        assert_eq!(values.len(), 500);
        assert!(values.iter().enumerate().all(|(idx, value)| *value == idx * 2));
    }

    #[test]
    fn standard_normals_have_plausible_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws = standard_normals(&mut rng, 20_000);
        let mean = draws.iter().sum::<f64>() / 20_000.0;
        let variance = draws.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / 20_000.0;
        assert!(mean.abs() < 0.05);
        assert!((variance - 1.0).abs() < 0.05);
    }
}
