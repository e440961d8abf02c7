//! Gibbs updates of the latent traits and the trait regression.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::{
    cholesky_with_jitter, draw_from_dense_precision, draw_from_precision, parallel_map,
    standard_normals,
};

use super::state::{IfaModel, ModelState};

/// Draw the latent traits from their Gaussian full conditional.
///
/// Independent priors give one `q`-dimensional draw per respondent; the
/// joint spatial prior couples everyone into a single `nq`-dimensional draw
/// over `vec(Theta)`. If a conditional precision cannot be factorized the
/// affected traits keep their current values.
pub fn update_theta(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    if state.trait_prior.is_joint() {
        update_theta_jointly(model, state, rng);
    } else {
        update_theta_by_respondent(model, state, rng);
    }
}

fn update_theta_by_respondent(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    let n = model.n_respondents();
    let q = model.n_factors();
    let normals: Vec<Vec<f64>> = (0..n).map(|_| standard_normals(rng, q)).collect();

    let prior_precision = state.trait_prior.precision();
    let loadings = &state.restricted_discrimination;
    let latent = &state.latent;
    let difficulty = &state.difficulty;
    let prior_mean = &state.prior_mean;
    let theta = &state.theta;

    let rows = parallel_map(n, |respondent| {
        let mut precision = prior_precision.clone();
        let mut canonical: Vec<f64> = (0..q)
            .map(|k| {
                (0..q)
                    .map(|l| prior_precision[(k, l)] * prior_mean[(respondent, l)])
                    .sum::<f64>()
            })
            .collect();
        for item in model.items_answered_by(respondent) {
            let shifted = latent[(respondent, *item)] + difficulty[*item];
            for k in 0..q {
                let weight = loadings[(*item, k)];
                canonical[k] = weight.mul_add(shifted, canonical[k]);
                for l in 0..q {
                    precision[(k, l)] += weight * loadings[(*item, l)];
                }
            }
        }
        match cholesky_with_jitter(&precision) {
            Ok(lower) => draw_from_precision(&lower, &canonical, &normals[respondent]),
            Err(_) => (0..q).map(|k| theta[(respondent, k)]).collect(),
        }
    });

    for (respondent, row) in rows.into_iter().enumerate() {
        for (k, value) in row.into_iter().enumerate() {
            state.theta[(respondent, k)] = value;
        }
    }
}

fn update_theta_jointly(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    let n = model.n_respondents();
    let q = model.n_factors();
    let dim = n * q;
    let normals = standard_normals(rng, dim);

    let prior_precision = state.trait_prior.precision();
    let loadings = &state.restricted_discrimination;
    let mean = Mat::from_fn(dim, 1, |index, _| state.prior_mean[(index % n, index / n)]);
    let prior_canonical = prior_precision * &mean;

    let mut precision = prior_precision.clone();
    let mut canonical: Vec<f64> = (0..dim).map(|row| prior_canonical[(row, 0)]).collect();
    for respondent in 0..n {
        for item in model.items_answered_by(respondent) {
            let shifted = state.latent[(respondent, *item)] + state.difficulty[*item];
            for k in 0..q {
                let weight = loadings[(*item, k)];
                canonical[k * n + respondent] =
                    weight.mul_add(shifted, canonical[k * n + respondent]);
                for l in 0..q {
                    precision[(k * n + respondent, l * n + respondent)] +=
                        weight * loadings[(*item, l)];
                }
            }
        }
    }

    match draw_from_dense_precision(&precision, &canonical, &normals) {
        Ok(draw) => {
            for (index, value) in draw.into_iter().enumerate() {
                state.theta[(index % n, index / n)] = value;
            }
        }
        Err(err) => log::warn!("joint trait update skipped: {err}"),
    }
}

/// Draw the free regression coefficients from their Gaussian conditional
/// given the traits, then refresh the trait prior mean `X B`.
///
/// Each free coefficient of factor `k` carries an independent
/// `N(0, V_sd[k]^2)` prior; restricted coefficients stay at zero.
pub fn update_regression(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    let (Some(structure), Some(predictors), Some(crossprod)) = (
        model.covariates(),
        model.predictors(),
        model.predictor_crossprod(),
    ) else {
        return;
    };
    let free = structure.free_entries();
    if free.is_empty() {
        return;
    }
    let normals = standard_normals(rng, free.len());
    let n = model.n_respondents();
    let prior_precision = state.trait_prior.precision();

    let (mut precision, canonical) = if state.trait_prior.is_joint() {
        // vec(X B) = D b with D[(k n + i), (r, k)] = x_ir
        let weighted = Mat::from_fn(prior_precision.nrows(), free.len(), |row, e| {
            let (r, k) = free[e];
            (0..n)
                .map(|i| prior_precision[(row, k * n + i)] * predictors[(i, r)])
                .sum::<f64>()
        });
        let precision = Mat::from_fn(free.len(), free.len(), |e, f| {
            let (r, k) = free[e];
            (0..n)
                .map(|i| predictors[(i, r)] * weighted[(k * n + i, f)])
                .sum::<f64>()
        });
        let canonical: Vec<f64> = (0..free.len())
            .map(|e| {
                (0..weighted.nrows())
                    .map(|row| weighted[(row, e)] * state.theta[(row % n, row / n)])
                    .sum::<f64>()
            })
            .collect();
        (precision, canonical)
    } else {
        let cross = predictors.transpose() * state.theta.as_ref();
        let precision = Mat::from_fn(free.len(), free.len(), |e, f| {
            let (r, k) = free[e];
            let (s, l) = free[f];
            prior_precision[(k, l)] * crossprod[(r, s)]
        });
        let canonical: Vec<f64> = free
            .iter()
            .map(|(r, k)| {
                (0..model.n_factors())
                    .map(|l| prior_precision[(*k, l)] * cross[(*r, l)])
                    .sum::<f64>()
            })
            .collect();
        (precision, canonical)
    };
    for (e, (_, k)) in free.iter().enumerate() {
        precision[(e, e)] += model.prior_scale()[*k].powi(-2);
    }

    let Ok(lower) = cholesky_with_jitter(&precision) else {
        log::warn!("regression update skipped: conditional precision is singular");
        return;
    };
    let draw = draw_from_precision(&lower, &canonical, &normals);
    let mut coefficients = Mat::<f64>::zeros(structure.n_predictors(), structure.n_factors());
    for ((r, k), value) in free.iter().zip(draw) {
        coefficients[(*r, *k)] = value;
    }
    state.prior_mean = model.trait_prior_mean(Some(&coefficients));
    state.regression = Some(coefficients);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use crate::models::ifa::state::test_support::{binary_input, build, line_distances};
    use crate::models::ifa::state::{InitialValues, Restrictions};
    use crate::models::ifa::types::ModelVariant;
    use crate::utils::usize_to_f64;

    fn predictors(n: usize) -> Mat<f64> {
        Mat::from_fn(n, 2, |i, j| {
            if j == 0 {
                1.0
            } else {
                usize_to_f64(i % 5) - 2.0
            }
        })
    }

    #[test]
    fn respondent_without_answers_draws_from_the_prior() {
        let responses = Mat::from_fn(4, 3, |i, j| {
            if i == 3 {
                f64::NAN
            } else if (i + j) % 2 == 0 {
                1.0
            } else {
                0.0
            }
        });
        let input = crate::input::IfaInput::new(responses, 1);
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::Exploratory,
            InitialValues::standard(4, 3, 1, 1.0),
        );
        let mut rng = StdRng::seed_from_u64(17);
        let draws: Vec<f64> = (0..8_000)
            .map(|_| {
                update_theta(&model, &mut state, &mut rng);
                state.theta()[(3, 0)]
            })
            .collect();
        let mean = draws.iter().sum::<f64>() / usize_to_f64(draws.len());
        let variance =
            draws.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / usize_to_f64(draws.len());
        assert_relative_eq!(mean, 0.0, epsilon = 0.05);
        assert_relative_eq!(variance, 1.0, epsilon = 0.08);
    }

    #[test]
    fn trait_draw_follows_the_latent_responses() {
        let input = binary_input(10, 30, 1);
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(30, 1),
            ModelVariant::Exploratory,
            InitialValues::standard(10, 30, 1, 1.0),
        );
        for j in 0..30 {
            state.latent[(0, j)] = 2.0;
            state.latent[(1, j)] = -2.0;
        }
        let mut rng = StdRng::seed_from_u64(1);
        update_theta(&model, &mut state, &mut rng);
        // posterior mean is 60 / 31 with sd 1 / sqrt(31)
        assert_relative_eq!(state.theta()[(0, 0)], 60.0 / 31.0, epsilon = 0.8);
        assert_relative_eq!(state.theta()[(1, 0)], -60.0 / 31.0, epsilon = 0.8);
    }

    #[test]
    fn spatial_variant_updates_all_traits_jointly() {
        let input = binary_input(8, 4, 2).with_distances(line_distances(8));
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(4, 2),
            ModelVariant::Spatial,
            InitialValues::standard(8, 4, 2, 0.7),
        );
        assert!(state.trait_prior().is_joint());
        let mut rng = StdRng::seed_from_u64(9);
        update_theta(&model, &mut state, &mut rng);
        let moved = (0..8).all(|i| state.theta()[(i, 0)].abs() > 0.0);
        assert!(moved);
        assert!(crate::utils::matrix_is_finite(state.theta()));
    }

    #[test]
    fn regression_recovers_trait_slope_and_respects_restrictions() {
        let n = 400;
        let x = predictors(n);
        let input = binary_input(n, 3, 2).with_predictors(x.clone());
        let restriction = Mat::from_fn(2, 2, |r, k| if r == 1 && k == 1 { 0.0 } else { 1.0 });
        let restrictions =
            Restrictions::unrestricted(3, 2).with_covariates(restriction, vec![10.0, 10.0]);
        let mut initial = InitialValues::standard(n, 3, 2, 0.5);
        initial.theta = Mat::from_fn(n, 2, |i, k| {
            if k == 0 {
                0.5 + 0.8 * x[(i, 1)]
            } else {
                -0.3
            }
        });
        let (model, mut state) = build(&input, &restrictions, ModelVariant::Covariate, initial);
        let mut rng = StdRng::seed_from_u64(12);
        update_regression(&model, &mut state, &mut rng);
        let coefficients = state.regression().expect("covariate model has coefficients");
        assert_relative_eq!(coefficients[(0, 0)], 0.5, epsilon = 0.2);
        assert_relative_eq!(coefficients[(1, 0)], 0.8, epsilon = 0.2);
        assert_relative_eq!(coefficients[(0, 1)], -0.3, epsilon = 0.2);
        assert!(coefficients[(1, 1)] == 0.0);
        assert_relative_eq!(
            state.prior_mean()[(3, 0)],
            coefficients[(0, 0)] + coefficients[(1, 0)] * x[(3, 1)],
            epsilon = 1e-12
        );
    }

    #[test]
    fn spatial_regression_draw_is_finite() {
        let n = 10;
        let input = binary_input(n, 3, 1)
            .with_predictors(predictors(n))
            .with_distances(line_distances(n));
        let (model, mut state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::Spatial,
            InitialValues::standard(n, 3, 1, 0.5),
        );
        assert!(model.has_regression());
        let mut rng = StdRng::seed_from_u64(30);
        update_theta(&model, &mut state, &mut rng);
        update_regression(&model, &mut state, &mut rng);
        let coefficients = state.regression().expect("spatial model with predictors");
        assert!(crate::utils::matrix_is_finite(coefficients));
    }
}
