#![forbid(unsafe_code)]

//! # `bayesian_ifa`
//!
//! Metropolis-within-Gibbs sampling for Bayesian item factor analysis of
//! binary and ordinal questionnaire responses.
//!
//! The sampler augments each observed response with a latent probit
//! response, draws item difficulties, discriminations and thresholds from
//! their conjugate conditionals, draws the respondents' latent traits, and
//! tunes the trait correlation (and, for spatial models, the spatial kernel
//! parameters) with adaptive random-walk Metropolis.
//!
//! ```
//! use bayesian_ifa::{
//!     AdaptiveInit, IfaInput, IfaSampler, IfaSamplerConfig, InitialValues, ItemPriors,
//!     ModelVariant, Restrictions,
//! };
//! use faer::Mat;
//!
//! let responses = Mat::from_fn(20, 4, |i, j| ((i + j) % 2) as f64);
//! let input = IfaInput::new(responses, 1);
//! let mut sampler = IfaSampler::new(
//!     &input,
//!     &Restrictions::unrestricted(4, 1),
//!     InitialValues::standard(20, 4, 1, 0.5),
//!     &AdaptiveInit::default(),
//!     ModelVariant::Exploratory,
//! )?;
//! let priors = ItemPriors::broadcast(4, 1, (0.0, 1.0), (0.0, 1.0));
//! let mut config = IfaSamplerConfig::default();
//! config.mcmc.iterations = 20;
//! config.mcmc.thin = 2;
//! let samples = sampler.sample(&priors, config)?;
//! assert_eq!(samples.len(), 10);
//! # Ok::<(), bayesian_ifa::IfaError>(())
//! ```

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod utils;

pub use inference::{
    AdaptationConfig, AdaptiveProposal, InferenceError, McmcConfig, ProposalOutcome,
    ProposalStats,
};
pub use input::{IfaInput, InputError};
pub use preprocess::{ItemResponseSummary, items_with_empty_categories, response_diagnostics};
pub mod matrix_ops {
    pub use crate::models::matrix_ops::*;
}

pub use models::ifa::{
    AdaptiveBlock, AdaptiveInit, BlockDiagnostics, IfaConvergenceSummary, IfaError, IfaModel,
    IfaPosteriorDraw, IfaPosteriorSamples, IfaPosteriorSummary, IfaSampler, IfaSamplerConfig,
    IfaSamplerDiagnostics, InitialValues, ItemPriors, ModelState, ModelVariant,
    ParameterSummary, Restrictions, SpatialParams, SpatialPrior, TiePolicy, autocorrelation,
    category_of, effective_sample_size, predict_traits, split_rhat, summarize_multi_chain_convergence,
    summarize_posterior, update_a, update_c, update_cov_params, update_regression,
    update_theta, update_thresholds, update_z,
};
