//! Sampler entrypoint for Bayesian item factor analysis.
//!
//! One sweep runs the stages in a fixed order: latent responses, item
//! difficulties, discriminations and thresholds, traits, trait regression,
//! then each adaptive covariance block. Traits at prediction points are
//! drawn only on iterations that are recorded.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::input::IfaInput;
use crate::preprocess::{items_with_empty_categories, response_diagnostics};

use super::augment::{update_thresholds, update_z};
use super::correlation::mean_abs_off_diagonal;
use super::covariance::update_cov_params;
use super::items::{update_a, update_c};
use super::posterior::{IfaPosteriorDraw, IfaPosteriorSamples};
use super::predict::predict_traits;
use super::priors::ItemPriors;
use super::state::{AdaptiveInit, IfaModel, InitialValues, ModelState, Restrictions};
use super::traits::{update_regression, update_theta};
use super::types::{
    AdaptiveBlock, BlockDiagnostics, IfaError, IfaSamplerConfig, IfaSamplerDiagnostics,
    ModelVariant,
};

/// Metropolis-within-Gibbs sampler owning the model and its chain state.
///
/// The state, the random stream and the iteration count persist across
/// calls, so a second `sample` continues the chain where the first one
/// stopped. The stream is seeded from `config.mcmc.seed` on the first call
/// only. `StdRng` is not `Clone`, so a clone starts without a stream and
/// reseeds from `config.mcmc.seed` on its first call.
#[derive(Debug)]
pub struct IfaSampler {
    model: IfaModel,
    state: ModelState,
    rng: Option<StdRng>,
    iterations_done: usize,
}

impl Clone for IfaSampler {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            state: self.state.clone(),
            rng: None,
            iterations_done: self.iterations_done,
        }
    }
}

impl IfaSampler {
    /// Build the model description and the initial chain state.
    ///
    /// # Errors
    ///
    /// Returns `IfaError` if the inputs, restrictions, initial values or
    /// adaptive settings are invalid for `variant`.
    pub fn new(
        input: &IfaInput,
        restrictions: &Restrictions,
        initial: InitialValues,
        adaptive: &AdaptiveInit,
        variant: ModelVariant,
    ) -> Result<Self, IfaError> {
        let model = IfaModel::new(input, restrictions, variant)?;
        let state = ModelState::new(&model, initial, adaptive)?;

        let sparse = items_with_empty_categories(&response_diagnostics(input.responses()));
        if !sparse.is_empty() {
            log::warn!("items {sparse:?} skip a response category; their thresholds are weakly identified");
        }
        log::debug!(
            "built `{variant}` sampler: {} respondents, {} items, {} factors, {} adaptive blocks",
            model.n_respondents(),
            model.n_items(),
            model.n_factors(),
            state.adaptive_blocks().len()
        );
        Ok(Self {
            model,
            state,
            rng: None,
            iterations_done: 0,
        })
    }

    #[must_use]
    pub const fn model(&self) -> &IfaModel {
        &self.model
    }

    #[must_use]
    pub const fn state(&self) -> &ModelState {
        &self.state
    }

    /// Sweeps completed over the life of this chain.
    #[must_use]
    pub const fn iterations_done(&self) -> usize {
        self.iterations_done
    }

    /// Run `config.mcmc.iterations` sweeps and return the recorded draws.
    ///
    /// Burn-in and thinning count from the start of this call; recorded
    /// iteration numbers continue from earlier calls.
    ///
    /// # Errors
    ///
    /// Returns `IfaError` if `priors` or `config` are invalid. Nothing is
    /// sampled in that case.
    pub fn sample(
        &mut self,
        priors: &ItemPriors,
        config: IfaSamplerConfig,
    ) -> Result<IfaPosteriorSamples, IfaError> {
        self.sample_with_stop(priors, config, &AtomicBool::new(false))
    }

    /// Like [`Self::sample`], but stops before the next sweep once `stop` is
    /// set. Every returned draw comes from a completed sweep.
    ///
    /// # Errors
    ///
    /// Returns `IfaError` if `priors` or `config` are invalid.
    pub fn sample_with_stop(
        &mut self,
        priors: &ItemPriors,
        config: IfaSamplerConfig,
        stop: &AtomicBool,
    ) -> Result<IfaPosteriorSamples, IfaError> {
        config.validate()?;
        priors.validate(self.model.n_items(), self.model.n_factors())?;

        let mut rng = self
            .rng
            .take()
            .unwrap_or_else(|| StdRng::seed_from_u64(config.mcmc.seed));
        let offset = self.iterations_done;
        let fallbacks_before = self.state.truncation_fallbacks();
        let mut draws = Vec::with_capacity(config.mcmc.retained_draws());
        let mut diagnostics = IfaSamplerDiagnostics::default();

        for iteration in 1..=config.mcmc.iterations {
            if stop.load(Ordering::Relaxed) {
                diagnostics.stopped_early = true;
                log::debug!("stop requested after {} iterations", iteration - 1);
                break;
            }
            if let Err(err) = self.sweep(priors, &config, &mut rng) {
                self.rng = Some(rng);
                return Err(err);
            }
            diagnostics.iterations_completed = iteration;
            self.iterations_done = offset + iteration;

            if config.mcmc.records(iteration) {
                predict_traits(&self.model, &mut self.state, &mut rng);
                draws.push(self.snapshot(offset + iteration, config.record_latent_responses));
            }
        }
        self.rng = Some(rng);

        diagnostics.truncation_fallbacks = self.state.truncation_fallbacks() - fallbacks_before;
        diagnostics.blocks = self.block_diagnostics();
        self.log_adaptation_summary(&diagnostics);
        Ok(IfaPosteriorSamples { draws, diagnostics })
    }

    /// Run `chains` independent copies of this sampler on scoped threads.
    ///
    /// Chain `k` starts a fresh stream seeded with
    /// `config.mcmc.seed + k * seed_stride` from this sampler's current state,
    /// which is left untouched.
    ///
    /// # Errors
    ///
    /// Returns the first `IfaError` raised by any chain.
    pub fn sample_chains(
        &self,
        priors: &ItemPriors,
        config: IfaSamplerConfig,
        chains: usize,
        seed_stride: u64,
    ) -> Result<Vec<IfaPosteriorSamples>, IfaError> {
        if chains == 0 {
            return Err(IfaError::InvalidChainCount { min: 1, found: 0 });
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..chains)
                .map(|chain| {
                    let mut sampler = self.clone();
                    let mut chain_config = config;
                    let index = u64::try_from(chain).unwrap_or(u64::MAX);
                    chain_config.mcmc.seed = config
                        .mcmc
                        .seed
                        .wrapping_add(index.saturating_mul(seed_stride));
                    sampler.rng = Some(StdRng::seed_from_u64(chain_config.mcmc.seed));
                    scope.spawn(move || sampler.sample(priors, chain_config))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }

    fn sweep(
        &mut self,
        priors: &ItemPriors,
        config: &IfaSamplerConfig,
        rng: &mut StdRng,
    ) -> Result<(), IfaError> {
        let model = &self.model;
        let state = &mut self.state;

        update_z(model, state, rng);
        update_c(model, state, priors, rng);
        update_a(model, state, priors, config.tie_policy, rng);
        update_thresholds(model, state, rng);
        update_theta(model, state, rng);
        if model.has_regression() {
            update_regression(model, state, rng);
        }
        for index in 0..state.adaptive_blocks().len() {
            update_cov_params(model, state, config, index, rng)?;
        }
        Ok(())
    }

    fn snapshot(&self, iteration: usize, record_latent: bool) -> IfaPosteriorDraw {
        let state = &self.state;
        IfaPosteriorDraw {
            iteration,
            theta: state.theta().clone(),
            difficulty: state.difficulty().to_vec(),
            discrimination: state.restricted_discrimination().clone(),
            thresholds: (0..self.model.n_items())
                .map(|item| state.cut_points(item).to_vec())
                .collect(),
            correlation: state.correlation(),
            regression: state.regression().cloned(),
            spatial_share: state.spatial().map(|params| params.share.clone()),
            spatial_range: state.spatial().map(|params| params.range.clone()),
            predicted_theta: state.predicted_theta().cloned(),
            latent_responses: record_latent.then(|| state.latent_responses().clone()),
            adaptation: self.block_diagnostics(),
        }
    }

    fn block_diagnostics(&self) -> Vec<BlockDiagnostics> {
        self.state
            .adaptive_blocks()
            .iter()
            .map(super::state::AdaptiveBlockState::diagnostics)
            .collect()
    }

    fn log_adaptation_summary(&self, diagnostics: &IfaSamplerDiagnostics) {
        for block in &diagnostics.blocks {
            match block.block {
                AdaptiveBlock::Correlation => log::debug!(
                    "correlation block: acceptance {:.3}, logscale {:.3}, mean |corr| {:.3}",
                    block.acceptance_rate,
                    block.logscale,
                    mean_abs_off_diagonal(&self.state.correlation())
                ),
                AdaptiveBlock::Spatial => log::debug!(
                    "spatial block: acceptance {:.3}, logscale {:.3}",
                    block.acceptance_rate,
                    block.logscale
                ),
            }
            if block.invalid_candidates > 0 {
                log::debug!(
                    "{:?} block rejected {} candidates outside the support",
                    block.block,
                    block.invalid_candidates
                );
            }
        }
    }
}
