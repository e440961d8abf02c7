use faer::Mat;

#[must_use]
pub fn select_rows(matrix: &Mat<f64>, indices: &[usize]) -> Mat<f64> {
    Mat::from_fn(indices.len(), matrix.ncols(), |i, j| {
        matrix[(indices[i], j)]
    })
}

/// `X'X`.
#[must_use]
pub fn crossprod(matrix: &Mat<f64>) -> Mat<f64> {
    matrix.transpose() * matrix.as_ref()
}

/// Mean over the rows of a sequence of equally shaped matrices.
#[must_use]
pub fn elementwise_mean<'a>(matrices: impl ExactSizeIterator<Item = &'a Mat<f64>>) -> Option<Mat<f64>> {
    let count = matrices.len();
    let mut total: Option<Mat<f64>> = None;
    for matrix in matrices {
        total = Some(match total {
            None => matrix.clone(),
            Some(acc) => Mat::from_fn(acc.nrows(), acc.ncols(), |i, j| acc[(i, j)] + matrix[(i, j)]),
        });
    }
    let scale = 1.0 / crate::utils::usize_to_f64(count.max(1));
    total.map(|sum| Mat::from_fn(sum.nrows(), sum.ncols(), |i, j| sum[(i, j)] * scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossprod_matches_manual_product() {
        let x = Mat::from_fn(3, 2, |i, j| if j == 0 { 1.0 } else { f64::from(u8::try_from(i).unwrap_or(0)) });
        let xtx = crossprod(&x);
        assert!((xtx[(0, 0)] - 3.0).abs() < 1e-12);
        assert!((xtx[(0, 1)] - 3.0).abs() < 1e-12);
        assert!((xtx[(1, 1)] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn elementwise_mean_averages_matrices() {
        let a = Mat::from_fn(1, 2, |_, j| if j == 0 { 1.0 } else { 2.0 });
        let b = Mat::from_fn(1, 2, |_, j| if j == 0 { 3.0 } else { 6.0 });
        let mean = elementwise_mean([&a, &b].into_iter()).expect("non-empty");
        assert!((mean[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((mean[(0, 1)] - 4.0).abs() < 1e-12);
        assert!(elementwise_mean(std::iter::empty::<&Mat<f64>>()).is_none());
    }
}
