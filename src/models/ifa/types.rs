//! Core public types for the item factor analysis module.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::inference::{AdaptationConfig, InferenceError, McmcConfig};
use crate::input::InputError;

/// Errors returned by IFA construction, validation and sampling.
///
/// Every variant is raised before the first iteration; numerical trouble
/// inside a sweep is absorbed by the stage that hit it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IfaError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error(transparent)]
    InvalidSchedule(#[from] InferenceError),
    #[error("{what} must be {expected_rows}x{expected_cols}; found {rows}x{cols}")]
    DimensionMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    #[error("{what} must have length {expected}; found {found}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{what} entry ({row}, {col}) is {value}; expected a non-negative integer code")]
    InvalidRestriction {
        what: &'static str,
        row: usize,
        col: usize,
        value: f64,
    },
    #[error("model variant `{variant}` requires {component}")]
    MissingComponent {
        variant: ModelVariant,
        component: &'static str,
    },
    #[error("{0} must be strictly positive and finite")]
    InvalidPriorScale(&'static str),
    #[error("{0} must be finite")]
    NonFinitePriorMean(&'static str),
    #[error("{0} contain non-finite values")]
    NonFiniteInitialValues(&'static str),
    #[error("initial correlation must be a symmetric positive-definite matrix with unit diagonal")]
    InvalidCorrelation,
    #[error("initial spatial shares must lie in (0, 1) and ranges must be positive")]
    InvalidSpatialParameters,
    #[error("spatial range prior must have positive shape and rate")]
    InvalidSpatialPrior,
    #[error("adaptive proposal covariance must be a finite symmetric {dim}x{dim} matrix")]
    InvalidAdaptiveCovariance { dim: usize },
    #[error("adaptive proposal scale must be positive and finite; found {0}")]
    InvalidAdaptiveScale(f64),
    #[error("adaptive block index {index} is out of range; the model has {blocks} blocks")]
    UnknownAdaptiveBlock { index: usize, blocks: usize },
    #[error("correlation prior shape must be positive and finite; found {0}")]
    InvalidLkjShape(f64),
    #[error("unknown model variant `{0}`")]
    UnknownModelVariant(String),
    #[error("initial trait prior covariance is not positive definite")]
    SingularTraitPrior,
    #[error("convergence diagnostics need at least {min} chains; found {found}")]
    InvalidChainCount { min: usize, found: usize },
    #[error("each chain needs at least {minimum} draws; found {found}")]
    InsufficientChainDraws { minimum: usize, found: usize },
    #[error("posterior draws have inconsistent dimensions across chains")]
    InconsistentPosteriorDimensions,
}

/// Trait-structure variant selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
    /// Independent traits with a common correlation (`eifa`).
    #[default]
    Exploratory,
    /// Trait means regressed on predictors (`cifa`).
    Covariate,
    /// Covariate model with trait prediction at extra predictor rows (`cifa_pred`).
    CovariatePredictive,
    /// Spatially structured traits (`spifa`).
    Spatial,
    /// Spatial model with kriging at extra locations (`spifa_pred`).
    SpatialPredictive,
}

impl ModelVariant {
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Exploratory => "eifa",
            Self::Covariate => "cifa",
            Self::CovariatePredictive => "cifa_pred",
            Self::Spatial => "spifa",
            Self::SpatialPredictive => "spifa_pred",
        }
    }

    #[must_use]
    pub const fn requires_predictors(self) -> bool {
        matches!(self, Self::Covariate | Self::CovariatePredictive)
    }

    #[must_use]
    pub const fn is_spatial(self) -> bool {
        matches!(self, Self::Spatial | Self::SpatialPredictive)
    }

    #[must_use]
    pub const fn is_predictive(self) -> bool {
        matches!(self, Self::CovariatePredictive | Self::SpatialPredictive)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ModelVariant {
    type Err = IfaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "eifa" => Ok(Self::Exploratory),
            "cifa" => Ok(Self::Covariate),
            "cifa_pred" => Ok(Self::CovariatePredictive),
            "spifa" => Ok(Self::Spatial),
            "spifa_pred" => Ok(Self::SpatialPredictive),
            other => Err(IfaError::UnknownModelVariant(other.to_owned())),
        }
    }
}

/// How loadings tied by the restriction matrix are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiePolicy {
    /// One shared value per tie group, drawn from its exact conditional.
    #[default]
    Joint,
    /// Members drawn one by one, then every member set to the group mean.
    Average,
}

/// Gamma prior on the spatial range parameters.
#[derive(Debug, Clone, Copy)]
pub struct SpatialPrior {
    pub range_shape: f64,
    pub range_rate: f64,
}

impl Default for SpatialPrior {
    fn default() -> Self {
        Self {
            range_shape: 2.0,
            range_rate: 1.0,
        }
    }
}

impl SpatialPrior {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.range_shape.is_finite()
            && self.range_shape > 0.0
            && self.range_rate.is_finite()
            && self.range_rate > 0.0
    }
}

/// Full sampler configuration for one `sample` call.
#[derive(Debug, Clone, Copy)]
pub struct IfaSamplerConfig {
    pub mcmc: McmcConfig,
    pub adaptation: AdaptationConfig,
    /// LKJ shape `eta` of the correlation prior.
    pub lkj_shape: f64,
    pub tie_policy: TiePolicy,
    pub spatial_prior: SpatialPrior,
    /// Store the augmented responses with every recorded draw.
    pub record_latent_responses: bool,
}

impl Default for IfaSamplerConfig {
    fn default() -> Self {
        Self {
            mcmc: McmcConfig::default(),
            adaptation: AdaptationConfig::default(),
            lkj_shape: 1.0,
            tie_policy: TiePolicy::default(),
            spatial_prior: SpatialPrior::default(),
            record_latent_responses: false,
        }
    }
}

impl IfaSamplerConfig {
    /// # Errors
    ///
    /// Returns `IfaError` if any configuration block is invalid.
    pub fn validate(self) -> Result<(), IfaError> {
        self.mcmc.validate()?;
        self.adaptation.validate()?;
        if !(self.lkj_shape.is_finite() && self.lkj_shape > 0.0) {
            return Err(IfaError::InvalidLkjShape(self.lkj_shape));
        }
        if !self.spatial_prior.is_valid() {
            return Err(IfaError::InvalidSpatialPrior);
        }
        Ok(())
    }
}

/// Parameter block tuned by one adaptive proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveBlock {
    /// Unconstrained correlation parameters.
    Correlation,
    /// Logit spatial shares and log ranges.
    Spatial,
}

/// Adaptation state of one block at the time of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockDiagnostics {
    pub block: AdaptiveBlock,
    pub proposed: usize,
    pub accepted: usize,
    pub acceptance_rate: f64,
    pub logscale: f64,
    pub invalid_candidates: usize,
    pub covariance_fallbacks: usize,
}

/// Run-level diagnostics returned with the posterior draws.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IfaSamplerDiagnostics {
    pub iterations_completed: usize,
    pub stopped_early: bool,
    /// Truncated-normal draws that fell back to a tail approximation or boundary.
    pub truncation_fallbacks: usize,
    pub blocks: Vec<BlockDiagnostics>,
}
