//! Posterior predictive draws of traits at new predictor rows or locations.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::{dense_cholesky_with_jitter, lower_mul_vec, standard_normals};

use super::state::{IfaModel, ModelState, lmc_covariance};
use super::types::ModelVariant;

/// Draw traits at the prediction points of a predictive variant and store
/// them as `state.predicted_theta()`.
///
/// `cifa_pred` draws `B'x + L eps` per prediction row, with `L` the
/// correlation factor. `spifa_pred` draws from the conditional (kriging)
/// distribution of the new locations' traits given the respondents' current
/// traits under the coregionalization covariance. Other variants are left
/// untouched.
pub fn predict_traits(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    let n_new = model.n_prediction_points();
    if n_new == 0 {
        return;
    }
    let predicted = match model.variant() {
        ModelVariant::CovariatePredictive => predict_from_covariates(model, state, n_new, rng),
        ModelVariant::SpatialPredictive => krige(model, state, n_new, rng),
        ModelVariant::Exploratory | ModelVariant::Covariate | ModelVariant::Spatial => return,
    };
    state.predicted_theta = Some(predicted);
}

fn prediction_mean(model: &IfaModel, state: &ModelState, n_new: usize) -> Mat<f64> {
    match (model.prediction_predictors(), state.regression.as_ref()) {
        (Some(rows), Some(coefficients)) if rows.nrows() == n_new => rows * coefficients,
        _ => Mat::zeros(n_new, model.n_factors()),
    }
}

fn predict_from_covariates(
    model: &IfaModel,
    state: &ModelState,
    n_new: usize,
    rng: &mut StdRng,
) -> Mat<f64> {
    let mean = prediction_mean(model, state, n_new);
    let mut predicted = mean.clone();
    for point in 0..n_new {
        let noise = standard_normals(rng, model.n_factors());
        let shift = lower_mul_vec(&state.corr_chol, &noise);
        for (k, value) in shift.into_iter().enumerate() {
            predicted[(point, k)] += value;
        }
    }
    predicted
}

fn krige(model: &IfaModel, state: &ModelState, n_new: usize, rng: &mut StdRng) -> Mat<f64> {
    let n = model.n_respondents();
    let q = model.n_factors();
    let mean = prediction_mean(model, state, n_new);
    let normals = standard_normals(rng, n_new * q);
    let (Some(distances), Some(spatial)) = (model.distances(), state.spatial.as_ref()) else {
        return mean;
    };

    let observed = 0..n;
    let new = n..n + n_new;
    let cross = lmc_covariance(distances, &state.corr_chol, spatial, new.clone(), observed);
    let marginal = lmc_covariance(distances, &state.corr_chol, spatial, new.clone(), new);

    // Sigma_no Sigma_oo^{-1}, using the cached joint precision of the respondents
    let gain = &cross * state.trait_prior.precision();
    let residual = Mat::from_fn(n * q, 1, |index, _| {
        let (i, k) = (index % n, index / n);
        state.theta[(i, k)] - state.prior_mean[(i, k)]
    });
    let shift = &gain * &residual;
    let reduction = gain.as_ref() * cross.transpose();
    let conditional = Mat::from_fn(n_new * q, n_new * q, |a, b| {
        0.5 * ((marginal[(a, b)] - reduction[(a, b)]) + (marginal[(b, a)] - reduction[(b, a)]))
    });

    let noise = match dense_cholesky_with_jitter(&conditional) {
        Ok(lower) => lower_mul_vec(&lower, &normals),
        Err(err) => {
            log::warn!("kriging covariance is not positive definite ({err}); returning the conditional mean");
            vec![0.0; n_new * q]
        }
    };
    Mat::from_fn(n_new, q, |point, k| {
        let index = k * n_new + point;
        mean[(point, k)] + shift[(index, 0)] + noise[index]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use crate::models::ifa::state::test_support::{binary_input, build, line_distances};
    use crate::models::ifa::state::{InitialValues, Restrictions};
    use crate::utils::usize_to_f64;

    #[test]
    fn non_predictive_variants_do_not_predict() {
        let input = binary_input(10, 3, 1);
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::Exploratory,
            InitialValues::standard(10, 3, 1, 0.5),
        );
        let mut rng = StdRng::seed_from_u64(1);
        predict_traits(&model, &mut state, &mut rng);
        assert!(state.predicted_theta().is_none());
    }

    #[test]
    fn covariate_prediction_centres_on_the_regression() {
        let n = 20;
        let predictors = Mat::from_fn(n + 2, 1, |i, _| if i < n { 1.0 } else { 2.0 });
        let input = binary_input(n, 3, 1).with_predictors(predictors);
        let initial = InitialValues::standard(n, 3, 1, 0.5)
            .with_regression(Mat::from_fn(1, 1, |_, _| 0.75));
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::CovariatePredictive,
            initial,
        );
        assert_eq!(model.n_prediction_points(), 2);
        let mut rng = StdRng::seed_from_u64(8);
        let mut total = 0.0;
        let draws = 4_000;
        for _ in 0..draws {
            predict_traits(&model, &mut state, &mut rng);
            let predicted = state.predicted_theta().expect("predictive variant");
            assert_eq!(predicted.nrows(), 2);
            total += predicted[(0, 0)];
        }
        assert_relative_eq!(total / usize_to_f64(draws), 1.5, epsilon = 0.06);
    }

    #[test]
    fn kriging_at_an_observed_location_tracks_its_trait() {
        let n = 6;
        // the prediction point sits on top of respondent 2
        let mut distances = line_distances(n + 1);
        for j in 0..=n {
            let value = distances[(2, j)];
            distances[(n, j)] = value;
            distances[(j, n)] = value;
        }
        distances[(n, n)] = 0.0;
        let input = binary_input(n, 3, 1).with_distances(distances);
        let mut initial = InitialValues::standard(n, 3, 1, 0.5)
            .with_spatial(vec![0.999], vec![2.0]);
        initial.theta[(2, 0)] = 1.2;
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::SpatialPredictive,
            initial,
        );
        let mut rng = StdRng::seed_from_u64(3);
        predict_traits(&model, &mut state, &mut rng);
        let predicted = state.predicted_theta().expect("predictive variant");
        assert_relative_eq!(predicted[(0, 0)], 1.2, epsilon = 0.2);
    }
}
