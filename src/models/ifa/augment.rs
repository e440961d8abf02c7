//! Data augmentation: latent responses and ordinal thresholds.

use rand::rngs::StdRng;
use rand::RngExt;

use crate::utils::{dot, parallel_map, row_to_vec, uniforms};

use super::likelihood::{category_interval, sample_truncated_normal};
use super::state::{IfaModel, ModelState};

/// Redraw every observed latent response from its truncated conditional.
///
/// Missing cells are left untouched. Uniforms are drawn item by item from
/// `rng` before the parallel sweep, so the result does not depend on the
/// number of worker threads. Returns the number of draws that needed the
/// extreme-tail fallback.
pub fn update_z(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) -> usize {
    let draws: Vec<Vec<f64>> = (0..model.n_items())
        .map(|item| uniforms(rng, model.observations(item).len()))
        .collect();

    let theta = &state.theta;
    let loadings = &state.restricted_discrimination;
    let difficulty = &state.difficulty;
    let cut_points = &state.cut_points;
    let updates = parallel_map(model.n_items(), |item| {
        let weights = row_to_vec(loadings, item);
        let mut fallbacks = 0usize;
        let values: Vec<f64> = model
            .observations(item)
            .iter()
            .zip(&draws[item])
            .map(|(observation, uniform)| {
                let trait_row = row_to_vec(theta, observation.respondent);
                let mean = dot(&weights, &trait_row) - difficulty[item];
                let (lower, upper) = category_interval(&cut_points[item], observation.category);
                let draw = sample_truncated_normal(mean, lower, upper, *uniform);
                if draw.used_fallback {
                    fallbacks += 1;
                }
                draw.value
            })
            .collect();
        (values, fallbacks)
    });

    let mut total_fallbacks = 0;
    for (item, (values, fallbacks)) in updates.into_iter().enumerate() {
        for (observation, value) in model.observations(item).iter().zip(values) {
            state.latent[(observation.respondent, item)] = value;
        }
        total_fallbacks += fallbacks;
    }
    if let Some(level) = fallback_log_level(state.truncation_fallbacks, total_fallbacks) {
        log::log!(
            level,
            "{total_fallbacks} latent responses fell in negligible-mass intervals"
        );
    }
    state.truncation_fallbacks += total_fallbacks;
    total_fallbacks
}

/// Warn on the first sweep of a chain that needs the tail fallback; later
/// sweeps only log at debug level since the run diagnostics carry the count.
const fn fallback_log_level(previous_total: usize, this_sweep: usize) -> Option<log::Level> {
    match (previous_total, this_sweep) {
        (_, 0) => None,
        (0, _) => Some(log::Level::Warn),
        _ => Some(log::Level::Debug),
    }
}

/// Gibbs update of the free interior thresholds.
///
/// Threshold `k` separates categories `k - 1` and `k`; it is drawn uniformly
/// between the largest latent response in category `k - 1` and the smallest
/// in category `k`, intersected with its neighbouring thresholds. When either
/// bound is unbounded (an empty category at the top of the scale) the current
/// value is kept.
pub fn update_thresholds(model: &IfaModel, state: &mut ModelState, rng: &mut StdRng) {
    for item in 0..model.n_items() {
        let n_categories = model.n_categories(item);
        if n_categories < 3 {
            continue;
        }

        let mut highest = vec![f64::NEG_INFINITY; n_categories];
        let mut lowest = vec![f64::INFINITY; n_categories];
        for observation in model.observations(item) {
            let z = state.latent[(observation.respondent, item)];
            let category = observation.category;
            highest[category] = highest[category].max(z);
            lowest[category] = lowest[category].min(z);
        }

        let cuts = &mut state.cut_points[item];
        for cut in 2..n_categories {
            let lower = cuts[cut - 1].max(highest[cut - 1]);
            let upper = cuts[cut + 1].min(lowest[cut]);
            let uniform = rng.random::<f64>();
            if !(lower.is_finite() && upper.is_finite()) || upper <= lower {
                continue;
            }
            let candidate = uniform.mul_add(upper - lower, lower);
            if candidate >= lower && candidate < upper {
                cuts[cut] = candidate;
            }
        }
    }
}
