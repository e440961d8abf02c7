//! Conjugate updates of item difficulties and discriminations.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::{
    cholesky_with_jitter, draw_from_precision, parallel_map, sample_standard_normal,
    standard_normals,
};

use super::priors::ItemPriors;
use super::restriction::{LoadingConstraint, TieGroup};
use super::state::{IfaModel, ModelState};
use super::types::TiePolicy;

/// Draw each difficulty from its normal full conditional.
///
/// With `z_ij = LA_j . theta_i - c_j + e_ij`, the conditional of `c_j` has
/// precision `1 / sd^2 + n_obs` and mean
/// `(mean / sd^2 + sum_i (LA_j . theta_i - z_ij)) / precision`.
/// Items without observations are drawn from their prior.
pub fn update_c(model: &IfaModel, state: &mut ModelState, priors: &ItemPriors, rng: &mut StdRng) {
    let normals = standard_normals(rng, model.n_items());
    let theta = &state.theta;
    let loadings = &state.restricted_discrimination;
    let latent = &state.latent;
    let q = model.n_factors();

    let difficulty = parallel_map(model.n_items(), |item| {
        let prior_precision = priors.difficulty_sd[item].powi(-2);
        let observations = model.observations(item);
        let residual_sum: f64 = observations
            .iter()
            .map(|observation| {
                let respondent = observation.respondent;
                let predictor: f64 = (0..q)
                    .map(|k| loadings[(item, k)] * theta[(respondent, k)])
                    .sum();
                predictor - latent[(respondent, item)]
            })
            .sum();
        let precision = prior_precision + crate::utils::usize_to_f64(observations.len());
        let mean =
            prior_precision.mul_add(priors.difficulty_mean[item], residual_sum) / precision;
        mean + normals[item] / precision.sqrt()
    });
    state.difficulty = difficulty;
}

/// Draw the discriminations.
///
/// Free entries of each item are drawn jointly from their multivariate
/// normal conditional, holding that item's tied entries fixed. Tie groups are
/// then updated according to `policy`. Structural zeros are never visited
/// and `LA` is recomputed at the end.
pub fn update_a(
    model: &IfaModel,
    state: &mut ModelState,
    priors: &ItemPriors,
    policy: TiePolicy,
    rng: &mut StdRng,
) {
    let structure = model.loadings();
    let normals: Vec<Vec<f64>> = (0..model.n_items())
        .map(|item| standard_normals(rng, structure.free_factors(item).len()))
        .collect();

    let free_draws = {
        let discrimination = &state.discrimination;
        let theta = &state.theta;
        let latent = &state.latent;
        let difficulty = &state.difficulty;
        parallel_map(model.n_items(), |item| {
            let free = structure.free_factors(item);
            if free.is_empty() {
                return Vec::new();
            }
            let dim = free.len();
            let fixed: Vec<usize> = (0..model.n_factors())
                .filter(|k| matches!(structure.constraint(item, *k), LoadingConstraint::Tied(_)))
                .collect();

            let mut precision = Mat::from_fn(dim, dim, |a, b| {
                if a == b {
                    priors.discrimination_sd[(item, free[a])].powi(-2)
                } else {
                    0.0
                }
            });
            let mut canonical: Vec<f64> = free
                .iter()
                .map(|k| {
                    priors.discrimination_mean[(item, *k)]
                        * priors.discrimination_sd[(item, *k)].powi(-2)
                })
                .collect();

            for observation in model.observations(item) {
                let i = observation.respondent;
                let offset: f64 = fixed
                    .iter()
                    .map(|k| discrimination[(item, *k)] * theta[(i, *k)])
                    .sum();
                let residual = latent[(i, item)] + difficulty[item] - offset;
                for (a, ka) in free.iter().enumerate() {
                    canonical[a] = theta[(i, *ka)].mul_add(residual, canonical[a]);
                    for (b, kb) in free.iter().enumerate() {
                        precision[(a, b)] += theta[(i, *ka)] * theta[(i, *kb)];
                    }
                }
            }

            match cholesky_with_jitter(&precision) {
                Ok(lower) => draw_from_precision(&lower, &canonical, &normals[item]),
                Err(_) => free.iter().map(|k| discrimination[(item, *k)]).collect(),
            }
        })
    };

    for (item, values) in free_draws.into_iter().enumerate() {
        for (k, value) in structure.free_factors(item).iter().zip(values) {
            state.discrimination[(item, *k)] = value;
        }
    }

    for group in structure.tie_groups() {
        match policy {
            TiePolicy::Joint => update_tie_group_jointly(model, state, priors, group, rng),
            TiePolicy::Average => update_tie_group_by_average(model, state, priors, group, rng),
        }
    }

    state.refresh_restricted_discrimination(model);
}

/// `z + c - sum of item loadings outside `excluded``, for one cell.
fn partial_residual(
    state: &ModelState,
    item: usize,
    respondent: usize,
    n_factors: usize,
    excluded: &[usize],
    structure_zero: impl Fn(usize) -> bool,
) -> f64 {
    let offset: f64 = (0..n_factors)
        .filter(|k| !excluded.contains(k) && !structure_zero(*k))
        .map(|k| state.discrimination[(item, k)] * state.theta[(respondent, k)])
        .sum();
    state.latent[(respondent, item)] + state.difficulty[item] - offset
}

/// Scalar normal draw for a loading shared by all members of `group`.
///
/// Uses the prior of the group's first member.
fn update_tie_group_jointly(
    model: &IfaModel,
    state: &mut ModelState,
    priors: &ItemPriors,
    group: &TieGroup,
    rng: &mut StdRng,
) {
    let structure = model.loadings();
    let q = model.n_factors();
    let (first_item, first_factor) = group.members[0];
    let prior_precision = priors.discrimination_sd[(first_item, first_factor)].powi(-2);
    let mut precision = prior_precision;
    let mut canonical = prior_precision * priors.discrimination_mean[(first_item, first_factor)];

    for item in group.items() {
        let members: Vec<usize> = group.factors_of(item).collect();
        for observation in model.observations(item) {
            let i = observation.respondent;
            let weight: f64 = members.iter().map(|k| state.theta[(i, *k)]).sum();
            let residual = partial_residual(state, item, i, q, &members, |k| {
                structure.constraint(item, k) == LoadingConstraint::Zero
            });
            precision = weight.mul_add(weight, precision);
            canonical = weight.mul_add(residual, canonical);
        }
    }

    let value = canonical / precision + sample_standard_normal(rng) / precision.sqrt();
    for (item, factor) in &group.members {
        state.discrimination[(*item, *factor)] = value;
    }
}

/// Draw each member from its own scalar conditional, then set the whole
/// group to the mean of those draws.
fn update_tie_group_by_average(
    model: &IfaModel,
    state: &mut ModelState,
    priors: &ItemPriors,
    group: &TieGroup,
    rng: &mut StdRng,
) {
    let structure = model.loadings();
    let q = model.n_factors();
    let mut total = 0.0;
    for (item, factor) in &group.members {
        let (item, factor) = (*item, *factor);
        let prior_precision = priors.discrimination_sd[(item, factor)].powi(-2);
        let mut precision = prior_precision;
        let mut canonical = prior_precision * priors.discrimination_mean[(item, factor)];
        for observation in model.observations(item) {
            let i = observation.respondent;
            let weight = state.theta[(i, factor)];
            let residual = partial_residual(state, item, i, q, &[factor], |k| {
                structure.constraint(item, k) == LoadingConstraint::Zero
            });
            precision = weight.mul_add(weight, precision);
            canonical = weight.mul_add(residual, canonical);
        }
        total += canonical / precision + sample_standard_normal(rng) / precision.sqrt();
    }
    let mean = total / crate::utils::usize_to_f64(group.members.len());
    for (item, factor) in &group.members {
        state.discrimination[(*item, *factor)] = mean;
    }
}
