//! Bayesian item factor analysis for binary and ordinal responses.
//!
//! Responses are linked to latent traits through augmented probit responses
//! `z_ij ~ N(LA_j . theta_i - c_j, 1)` cut at per-item thresholds. Traits are
//! either independent with a common correlation, regressed on predictors, or
//! spatially structured through a linear model of coregionalization. The
//! sampler alternates conjugate Gibbs steps with adaptive Metropolis steps for
//! the covariance parameters.

pub mod augment;
pub mod correlation;
pub mod covariance;
pub mod diagnostics;
pub mod items;
pub mod likelihood;
pub mod posterior;
pub mod predict;
pub mod priors;
pub mod restriction;
pub mod sampler;
pub mod state;
pub mod traits;
pub mod types;

pub use augment::{update_thresholds, update_z};
pub use covariance::update_cov_params;
pub use diagnostics::{
    IfaConvergenceSummary, autocorrelation, effective_sample_size, split_rhat,
    summarize_multi_chain_convergence,
};
pub use items::{update_a, update_c};
pub use likelihood::category_of;
pub use posterior::{
    IfaPosteriorDraw, IfaPosteriorSamples, IfaPosteriorSummary, ParameterSummary,
    summarize_posterior,
};
pub use predict::predict_traits;
pub use priors::ItemPriors;
pub use restriction::{CovariateStructure, LoadingConstraint, LoadingStructure, TieGroup};
pub use sampler::IfaSampler;
pub use state::{
    AdaptiveInit, IfaModel, InitialValues, ModelState, Restrictions, SpatialParams, TraitPrior,
};
pub use traits::{update_regression, update_theta};
pub use types::{
    AdaptiveBlock, BlockDiagnostics, IfaError, IfaSamplerConfig, IfaSamplerDiagnostics,
    ModelVariant, SpatialPrior, TiePolicy,
};
