//! Adaptive Metropolis updates of the trait covariance parameters.
//!
//! The correlation block moves the unconstrained correlation vector under an
//! LKJ prior; the spatial block moves `[logit share, log range]` per factor
//! with a Gamma prior on the ranges. Both targets include the log-Jacobian
//! of their transform so the chain targets the posterior of the constrained
//! parameters.

use faer::Mat;
use rand::rngs::StdRng;

use crate::inference::ProposalOutcome;

use super::correlation::cholesky_from_free;
use super::priors::{log_gamma_density, log_lkj_cholesky_density};
use super::state::{IfaModel, ModelState, SpatialParams, TraitPrior};
use super::types::{AdaptiveBlock, IfaError, IfaSamplerConfig, SpatialPrior};

enum AcceptedCandidate {
    Correlation {
        free: Vec<f64>,
        lower: Mat<f64>,
        prior: TraitPrior,
    },
    Spatial {
        params: SpatialParams,
        prior: TraitPrior,
    },
}

/// One adaptive Metropolis step for adaptive block `index`.
///
/// Candidates whose implied covariance is not positive definite are rejected
/// with acceptance probability zero. On acceptance the cached trait prior is
/// replaced by the candidate's.
///
/// # Errors
///
/// Returns `IfaError::UnknownAdaptiveBlock` if `index` does not name a block
/// of this model.
pub fn update_cov_params(
    model: &IfaModel,
    state: &mut ModelState,
    config: &IfaSamplerConfig,
    index: usize,
    rng: &mut StdRng,
) -> Result<ProposalOutcome, IfaError> {
    let blocks = state.blocks.len();
    let kind = state
        .blocks
        .get(index)
        .map(|block| block.kind)
        .ok_or(IfaError::UnknownAdaptiveBlock { index, blocks })?;
    let q = model.n_factors();

    let current = match kind {
        AdaptiveBlock::Correlation => {
            let jacobian = cholesky_from_free(&state.corr_free, q).map_or(0.0, |f| f.log_jacobian);
            state.trait_log_density()
                + log_lkj_cholesky_density(&state.corr_chol, config.lkj_shape)
                + jacobian
        }
        AdaptiveBlock::Spatial => {
            state.trait_log_density()
                + state
                    .spatial
                    .as_ref()
                    .map_or(0.0, |params| spatial_log_prior(params, config.spatial_prior))
        }
    };

    let mut slot: Option<AcceptedCandidate> = None;
    let outcome = {
        let ModelState {
            blocks,
            theta,
            prior_mean,
            corr_chol,
            spatial,
            ..
        } = &mut *state;
        blocks[index]
            .proposal
            .step(rng, config.adaptation, current, |candidate| match kind {
                AdaptiveBlock::Correlation => {
                    let factor = cholesky_from_free(candidate, q)?;
                    let prior = model.trait_prior(&factor.lower, spatial.as_ref())?;
                    let value = prior.log_density(theta, prior_mean)
                        + log_lkj_cholesky_density(&factor.lower, config.lkj_shape)
                        + factor.log_jacobian;
                    slot = Some(AcceptedCandidate::Correlation {
                        free: candidate.to_vec(),
                        lower: factor.lower,
                        prior,
                    });
                    Some(value)
                }
                AdaptiveBlock::Spatial => {
                    let params = SpatialParams::from_unconstrained(candidate)?;
                    let prior = model.trait_prior(corr_chol, Some(&params))?;
                    let value = prior.log_density(theta, prior_mean)
                        + spatial_log_prior(&params, config.spatial_prior);
                    slot = Some(AcceptedCandidate::Spatial { params, prior });
                    Some(value)
                }
            })
    };

    if outcome.accepted {
        match slot {
            Some(AcceptedCandidate::Correlation { free, lower, prior }) => {
                state.corr_free = free;
                state.corr_chol = lower;
                state.trait_prior = prior;
            }
            Some(AcceptedCandidate::Spatial { params, prior }) => {
                state.spatial = Some(params);
                state.trait_prior = prior;
            }
            None => {}
        }
    }
    Ok(outcome)
}

/// Log prior of the spatial parameters on the unconstrained scale:
/// uniform shares and Gamma ranges, plus the logit and log Jacobians.
#[must_use]
pub fn spatial_log_prior(params: &SpatialParams, prior: SpatialPrior) -> f64 {
    let shares: f64 = params
        .share
        .iter()
        .map(|s| s.ln() + (-s).ln_1p())
        .sum();
    let ranges: f64 = params
        .range
        .iter()
        .map(|phi| log_gamma_density(*phi, prior.range_shape, prior.range_rate) + phi.ln())
        .sum();
    shares + ranges
}
