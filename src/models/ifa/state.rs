//! Immutable model description and the mutable chain state it is sampled on.
//!
//! `IfaModel` owns everything fixed for the lifetime of a sampler: response
//! categories, observation index sets, restriction descriptors, predictors
//! and distances. `ModelState` owns the current parameter values, the values
//! derived from them (`LA`, the correlation factor, the trait prior cache) and
//! the adaptive proposals. Each update stage reads the model and writes only
//! its own part of the state.

use std::ops::Range;

use faer::Mat;
use faer::linalg::solvers::Solve;

use crate::inference::AdaptiveProposal;
use crate::input::IfaInput;
use crate::models::matrix_ops::{crossprod, select_rows};
use crate::preprocess::{response_category, response_diagnostics};
use crate::utils::{
    LinalgError, dense_llt_with_jitter, identity_matrix, log_det_from_cholesky,
    lower_triangular_inverse, matrix_is_finite, matrix_is_symmetric, usize_to_f64,
};

use super::correlation::{
    cholesky_from_free, free_from_cholesky, free_parameter_count, is_correlation_matrix,
};
use super::likelihood::{initial_cut_points, initial_latent_response};
use super::restriction::{CovariateStructure, LoadingStructure};
use super::types::{AdaptiveBlock, BlockDiagnostics, IfaError, ModelVariant};

const CORRELATION_TOLERANCE: f64 = 1.0e-8;
const DEFAULT_SPATIAL_SHARE: f64 = 0.5;

/// Restriction matrices supplied at construction.
#[derive(Debug, Clone)]
pub struct Restrictions {
    /// `m x q` loading restriction `L`.
    pub loadings: Mat<f64>,
    /// `p x q` regression restriction `T`; all free when absent.
    pub covariates: Option<Mat<f64>>,
    /// Per-factor prior sd of the regression coefficients (`V_sd`); ones when absent.
    pub prior_scale: Option<Vec<f64>>,
}

impl Restrictions {
    #[must_use]
    pub const fn new(loadings: Mat<f64>) -> Self {
        Self {
            loadings,
            covariates: None,
            prior_scale: None,
        }
    }

    /// All loadings free.
    #[must_use]
    pub fn unrestricted(n_items: usize, n_factors: usize) -> Self {
        Self::new(Mat::from_fn(n_items, n_factors, |_, _| 1.0))
    }

    #[must_use]
    pub fn with_covariates(mut self, covariates: Mat<f64>, prior_scale: Vec<f64>) -> Self {
        self.covariates = Some(covariates);
        self.prior_scale = Some(prior_scale);
        self
    }
}

/// Starting values for the chain.
#[derive(Debug, Clone)]
pub struct InitialValues {
    pub theta: Mat<f64>,
    pub difficulty: Vec<f64>,
    pub discrimination: Mat<f64>,
    /// Identity when absent.
    pub correlation: Option<Mat<f64>>,
    /// Zeros when absent.
    pub regression: Option<Mat<f64>>,
    /// Spatial shares in `(0, 1)`; `0.5` when absent.
    pub spatial_share: Option<Vec<f64>>,
    /// Spatial ranges; the mean respondent distance when absent.
    pub spatial_range: Option<Vec<f64>>,
}

impl InitialValues {
    #[must_use]
    pub const fn new(theta: Mat<f64>, difficulty: Vec<f64>, discrimination: Mat<f64>) -> Self {
        Self {
            theta,
            difficulty,
            discrimination,
            correlation: None,
            regression: None,
            spatial_share: None,
            spatial_range: None,
        }
    }

    /// Zero traits and difficulties with all discriminations at `loading`.
    #[must_use]
    pub fn standard(n_respondents: usize, n_items: usize, n_factors: usize, loading: f64) -> Self {
        Self::new(
            Mat::zeros(n_respondents, n_factors),
            vec![0.0; n_items],
            Mat::from_fn(n_items, n_factors, |_, _| loading),
        )
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation: Mat<f64>) -> Self {
        self.correlation = Some(correlation);
        self
    }

    #[must_use]
    pub fn with_regression(mut self, regression: Mat<f64>) -> Self {
        self.regression = Some(regression);
        self
    }

    #[must_use]
    pub fn with_spatial(mut self, share: Vec<f64>, range: Vec<f64>) -> Self {
        self.spatial_share = Some(share);
        self.spatial_range = Some(range);
        self
    }
}

/// Initial covariance and scale of the adaptive proposals.
#[derive(Debug, Clone)]
pub struct AdaptiveInit {
    /// Covariance over all adaptive blocks stacked in block order; split
    /// block-diagonally. Identity when absent.
    pub covariance: Option<Mat<f64>>,
    pub scale: f64,
}

impl Default for AdaptiveInit {
    fn default() -> Self {
        Self {
            covariance: None,
            scale: 0.1,
        }
    }
}

/// Spatial kernel parameters, one per factor.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialParams {
    pub share: Vec<f64>,
    pub range: Vec<f64>,
}

impl SpatialParams {
    /// `[logit share, log range]`.
    #[must_use]
    pub fn to_unconstrained(&self) -> Vec<f64> {
        self.share
            .iter()
            .map(|s| (s / (1.0 - s)).ln())
            .chain(self.range.iter().map(|phi| phi.ln()))
            .collect()
    }

    /// Inverse of [`Self::to_unconstrained`]; `None` outside the support.
    #[must_use]
    pub fn from_unconstrained(values: &[f64]) -> Option<Self> {
        let n_factors = values.len() / 2;
        let share: Vec<f64> = values[..n_factors]
            .iter()
            .map(|x| 1.0 / (1.0 + (-x).exp()))
            .collect();
        let range: Vec<f64> = values[n_factors..].iter().map(|y| y.exp()).collect();
        let valid = share.iter().all(|s| *s > 0.0 && *s < 1.0)
            && range.iter().all(|phi| phi.is_finite() && *phi > 0.0);
        valid.then_some(Self { share, range })
    }

    fn is_valid(&self, n_factors: usize) -> bool {
        self.share.len() == n_factors
            && self.range.len() == n_factors
            && self.share.iter().all(|s| *s > 0.0 && *s < 1.0)
            && self.range.iter().all(|phi| phi.is_finite() && *phi > 0.0)
    }
}

/// Cached Gaussian prior of the traits.
///
/// Independent variants keep the `q x q` correlation; spatial variants keep
/// the joint `nq x nq` covariance of `vec(Theta)` in factor-major order
/// (index `k * n + i`).
#[derive(Debug, Clone)]
pub struct TraitPrior {
    /// Inverse Cholesky factor of the `q x q` correlation; empty when joint.
    chol_inv: Option<Mat<f64>>,
    precision: Mat<f64>,
    log_det: f64,
}

impl TraitPrior {
    /// Prior with covariance `lower lower'` shared by all respondents.
    #[must_use]
    pub fn independent(lower: &Mat<f64>) -> Self {
        let chol_inv = lower_triangular_inverse(lower);
        let precision = chol_inv.transpose() * chol_inv.as_ref();
        Self {
            chol_inv: Some(chol_inv),
            precision,
            log_det: log_det_from_cholesky(lower),
        }
    }

    /// Joint prior over all respondents.
    ///
    /// # Errors
    ///
    /// Returns `LinalgError` if the covariance cannot be factorized.
    pub fn joint(covariance: &Mat<f64>) -> Result<Self, LinalgError> {
        let factor = dense_llt_with_jitter(covariance)?;
        let dim = covariance.nrows();
        let log_det = log_det_from_cholesky(&factor.L().to_owned());
        let inverse = factor.solve(identity_matrix(dim).as_ref());
        let precision = Mat::from_fn(dim, dim, |row, col| {
            0.5 * (inverse[(row, col)] + inverse[(col, row)])
        });
        Ok(Self {
            chol_inv: None,
            precision,
            log_det,
        })
    }

    #[must_use]
    pub const fn is_joint(&self) -> bool {
        self.chol_inv.is_none()
    }

    /// Inverse covariance (`q x q` or `nq x nq`).
    #[must_use]
    pub const fn precision(&self) -> &Mat<f64> {
        &self.precision
    }

    #[must_use]
    pub const fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Log-density of `theta` up to the `2 pi` constant.
    #[must_use]
    pub fn log_density(&self, theta: &Mat<f64>, mean: &Mat<f64>) -> f64 {
        let n = theta.nrows();
        let q = theta.ncols();
        match &self.chol_inv {
            None => {
                let centered = Mat::from_fn(n * q, 1, |index, _| {
                    let (i, k) = (index % n, index / n);
                    theta[(i, k)] - mean[(i, k)]
                });
                let weighted = &self.precision * &centered;
                let quadratic: f64 = (0..n * q)
                    .map(|index| centered[(index, 0)] * weighted[(index, 0)])
                    .sum();
                -0.5 * (quadratic + self.log_det)
            }
            Some(chol_inv) => {
                let quadratic: f64 = (0..n)
                    .map(|i| {
                        let centered: Vec<f64> =
                            (0..q).map(|k| theta[(i, k)] - mean[(i, k)]).collect();
                        squared_norm_lower(chol_inv, &centered)
                    })
                    .sum();
                -0.5 * usize_to_f64(n).mul_add(self.log_det, quadratic)
            }
        }
    }
}

fn squared_norm_lower(lower: &Mat<f64>, values: &[f64]) -> f64 {
    (0..values.len())
        .map(|row| {
            let entry: f64 = (0..=row).map(|col| lower[(row, col)] * values[col]).sum();
            entry * entry
        })
        .sum()
}

/// Observed cell of an item: respondent and category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub respondent: usize,
    pub category: usize,
}

/// Immutable model description.
#[derive(Debug, Clone)]
pub struct IfaModel {
    variant: ModelVariant,
    n_respondents: usize,
    n_items: usize,
    n_factors: usize,
    n_categories: Vec<usize>,
    observed_by_item: Vec<Vec<Observation>>,
    observed_by_respondent: Vec<Vec<usize>>,
    loadings: LoadingStructure,
    covariates: Option<CovariateStructure>,
    prior_scale: Vec<f64>,
    predictors: Option<Mat<f64>>,
    prediction_predictors: Option<Mat<f64>>,
    predictor_crossprod: Option<Mat<f64>>,
    distances: Option<Mat<f64>>,
    n_prediction_points: usize,
}

impl IfaModel {
    /// # Errors
    ///
    /// Returns `IfaError` if inputs, restrictions or the variant's required
    /// components are missing or malformed.
    pub fn new(
        input: &IfaInput,
        restrictions: &Restrictions,
        variant: ModelVariant,
    ) -> Result<Self, IfaError> {
        input.validate()?;
        let n_respondents = input.n_respondents();
        let n_items = input.n_items();
        let n_factors = input.n_factors;

        check_shape(
            "loading restriction",
            &restrictions.loadings,
            n_items,
            n_factors,
        )?;
        let loadings = LoadingStructure::from_matrix(&restrictions.loadings)?;

        if variant.requires_predictors() && input.predictors().is_none() {
            return Err(IfaError::MissingComponent {
                variant,
                component: "a predictor matrix",
            });
        }
        if variant.is_spatial() && input.distances().is_none() {
            return Err(IfaError::MissingComponent {
                variant,
                component: "a distance matrix",
            });
        }

        let regression_active = input.predictors().is_some()
            && (variant.requires_predictors() || variant.is_spatial());
        if input.predictors().is_some() && !regression_active {
            log::debug!("predictors are ignored by the `{variant}` variant");
        }

        let (covariates, prior_scale, predictors, prediction_predictors) = if regression_active
            && let Some(all_predictors) = input.predictors()
        {
            let n_predictors = all_predictors.ncols();
            let covariates = match &restrictions.covariates {
                Some(matrix) => {
                    check_shape("covariate restriction", matrix, n_predictors, n_factors)?;
                    CovariateStructure::from_matrix(matrix)?
                }
                None => CovariateStructure::unrestricted(n_predictors, n_factors),
            };
            let prior_scale = restrictions
                .prior_scale
                .clone()
                .unwrap_or_else(|| vec![1.0; n_factors]);
            if prior_scale.len() != n_factors {
                return Err(IfaError::LengthMismatch {
                    what: "covariate prior scale",
                    expected: n_factors,
                    found: prior_scale.len(),
                });
            }
            if !prior_scale.iter().all(|sd| sd.is_finite() && *sd > 0.0) {
                return Err(IfaError::InvalidPriorScale("covariate prior scale"));
            }
            let observed_rows: Vec<usize> = (0..n_respondents).collect();
            let extra_rows: Vec<usize> = (n_respondents..all_predictors.nrows()).collect();
            (
                Some(covariates),
                prior_scale,
                Some(select_rows(all_predictors, &observed_rows)),
                Some(select_rows(all_predictors, &extra_rows)),
            )
        } else {
            (None, Vec::new(), None, None)
        };

        let distances = if variant.is_spatial() {
            input.distances().cloned()
        } else {
            None
        };
        let n_prediction_points = match variant {
            ModelVariant::CovariatePredictive => {
                prediction_predictors.as_ref().map_or(0, Mat::nrows)
            }
            ModelVariant::SpatialPredictive => distances
                .as_ref()
                .map_or(0, |d| d.nrows().saturating_sub(n_respondents)),
            _ => 0,
        };
        if variant == ModelVariant::SpatialPredictive
            && let Some(extra) = &prediction_predictors
            && extra.nrows() != n_prediction_points
        {
            return Err(IfaError::DimensionMismatch {
                what: "prediction predictors",
                expected_rows: n_prediction_points,
                expected_cols: extra.ncols(),
                rows: extra.nrows(),
                cols: extra.ncols(),
            });
        }

        let summaries = response_diagnostics(input.responses());
        let n_categories = summaries.iter().map(|summary| summary.n_categories()).collect();
        let responses = input.responses();
        let observed_by_item: Vec<Vec<Observation>> = (0..n_items)
            .map(|item| {
                (0..n_respondents)
                    .filter_map(|respondent| {
                        response_category(responses[(respondent, item)]).map(|category| {
                            Observation {
                                respondent,
                                category,
                            }
                        })
                    })
                    .collect()
            })
            .collect();
        let mut observed_by_respondent = vec![Vec::new(); n_respondents];
        for (item, observations) in observed_by_item.iter().enumerate() {
            for observation in observations {
                observed_by_respondent[observation.respondent].push(item);
            }
        }

        let predictor_crossprod = predictors.as_ref().map(crossprod);

        Ok(Self {
            variant,
            n_respondents,
            n_items,
            n_factors,
            n_categories,
            observed_by_item,
            observed_by_respondent,
            loadings,
            covariates,
            prior_scale,
            predictors,
            prediction_predictors,
            predictor_crossprod,
            distances,
            n_prediction_points,
        })
    }

    #[must_use]
    pub const fn variant(&self) -> ModelVariant {
        self.variant
    }

    #[must_use]
    pub const fn n_respondents(&self) -> usize {
        self.n_respondents
    }

    #[must_use]
    pub const fn n_items(&self) -> usize {
        self.n_items
    }

    #[must_use]
    pub const fn n_factors(&self) -> usize {
        self.n_factors
    }

    #[must_use]
    pub fn n_categories(&self, item: usize) -> usize {
        self.n_categories[item]
    }

    #[must_use]
    pub fn observations(&self, item: usize) -> &[Observation] {
        &self.observed_by_item[item]
    }

    #[must_use]
    pub fn items_answered_by(&self, respondent: usize) -> &[usize] {
        &self.observed_by_respondent[respondent]
    }

    #[must_use]
    pub const fn loadings(&self) -> &LoadingStructure {
        &self.loadings
    }

    #[must_use]
    pub const fn covariates(&self) -> Option<&CovariateStructure> {
        self.covariates.as_ref()
    }

    #[must_use]
    pub fn prior_scale(&self) -> &[f64] {
        &self.prior_scale
    }

    /// Predictor rows of the respondents.
    #[must_use]
    pub const fn predictors(&self) -> Option<&Mat<f64>> {
        self.predictors.as_ref()
    }

    /// Predictor rows of the prediction points.
    #[must_use]
    pub const fn prediction_predictors(&self) -> Option<&Mat<f64>> {
        self.prediction_predictors.as_ref()
    }

    /// `X'X` over the respondents.
    #[must_use]
    pub const fn predictor_crossprod(&self) -> Option<&Mat<f64>> {
        self.predictor_crossprod.as_ref()
    }

    #[must_use]
    pub const fn distances(&self) -> Option<&Mat<f64>> {
        self.distances.as_ref()
    }

    #[must_use]
    pub const fn n_prediction_points(&self) -> usize {
        self.n_prediction_points
    }

    #[must_use]
    pub const fn has_regression(&self) -> bool {
        self.covariates.is_some()
    }

    /// Adaptive blocks in index order.
    #[must_use]
    pub fn adaptive_blocks(&self) -> Vec<(AdaptiveBlock, usize)> {
        let mut blocks = Vec::new();
        let corr_dim = free_parameter_count(self.n_factors);
        if corr_dim > 0 {
            blocks.push((AdaptiveBlock::Correlation, corr_dim));
        }
        if self.variant.is_spatial() {
            blocks.push((AdaptiveBlock::Spatial, 2 * self.n_factors));
        }
        blocks
    }

    /// Trait prior for a candidate correlation factor and spatial parameters.
    ///
    /// Returns `None` if the implied covariance cannot be factorized.
    #[must_use]
    pub fn trait_prior(
        &self,
        corr_chol: &Mat<f64>,
        spatial: Option<&SpatialParams>,
    ) -> Option<TraitPrior> {
        match (self.distances.as_ref(), spatial) {
            (Some(distances), Some(spatial)) => {
                let locations = 0..self.n_respondents;
                let covariance = lmc_covariance(
                    distances,
                    corr_chol,
                    spatial,
                    locations.clone(),
                    locations,
                );
                TraitPrior::joint(&covariance).ok()
            }
            _ => Some(TraitPrior::independent(corr_chol)),
        }
    }

    /// Prior mean of the respondents' traits: `X B`, or zero.
    #[must_use]
    pub fn trait_prior_mean(&self, regression: Option<&Mat<f64>>) -> Mat<f64> {
        match (self.predictors.as_ref(), regression) {
            (Some(predictors), Some(coefficients)) => predictors * coefficients,
            _ => Mat::zeros(self.n_respondents, self.n_factors),
        }
    }
}

/// Cross-covariance of the traits at two location ranges under the linear
/// model of coregionalization.
///
/// Rows and columns are factor-major within each range. The nugget
/// `1 - share` applies only where the global location indices coincide.
#[must_use]
pub fn lmc_covariance(
    distances: &Mat<f64>,
    corr_chol: &Mat<f64>,
    spatial: &SpatialParams,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Mat<f64> {
    let q = corr_chol.ncols();
    let n_rows = rows.len();
    let n_cols = cols.len();
    let kernels: Vec<Mat<f64>> = (0..q)
        .map(|k| {
            let share = spatial.share[k];
            let range = spatial.range[k];
            Mat::from_fn(n_rows, n_cols, |a, b| {
                let i = rows.start + a;
                let j = cols.start + b;
                let nugget = if i == j { 1.0 - share } else { 0.0 };
                share.mul_add((-distances[(i, j)] / range).exp(), nugget)
            })
        })
        .collect();

    Mat::from_fn(q * n_rows, q * n_cols, |row, col| {
        let (k1, a) = (row / n_rows, row % n_rows);
        let (k2, b) = (col / n_cols, col % n_cols);
        (0..q)
            .map(|k| corr_chol[(k1, k)] * corr_chol[(k2, k)] * kernels[k][(a, b)])
            .sum::<f64>()
    })
}

/// One adaptive proposal and the block it tunes.
#[derive(Debug, Clone)]
pub struct AdaptiveBlockState {
    pub kind: AdaptiveBlock,
    pub proposal: AdaptiveProposal,
}

impl AdaptiveBlockState {
    #[must_use]
    pub fn diagnostics(&self) -> BlockDiagnostics {
        let stats = self.proposal.stats();
        BlockDiagnostics {
            block: self.kind,
            proposed: stats.proposed,
            accepted: stats.accepted,
            acceptance_rate: stats.acceptance_rate(),
            logscale: self.proposal.logscale(),
            invalid_candidates: self.proposal.invalid_candidates(),
            covariance_fallbacks: self.proposal.covariance_fallbacks(),
        }
    }
}

/// Mutable chain state.
#[derive(Debug, Clone)]
pub struct ModelState {
    pub(crate) theta: Mat<f64>,
    pub(crate) discrimination: Mat<f64>,
    pub(crate) restricted_discrimination: Mat<f64>,
    pub(crate) difficulty: Vec<f64>,
    pub(crate) cut_points: Vec<Vec<f64>>,
    pub(crate) latent: Mat<f64>,
    pub(crate) corr_free: Vec<f64>,
    pub(crate) corr_chol: Mat<f64>,
    pub(crate) regression: Option<Mat<f64>>,
    pub(crate) spatial: Option<SpatialParams>,
    pub(crate) prior_mean: Mat<f64>,
    pub(crate) trait_prior: TraitPrior,
    pub(crate) blocks: Vec<AdaptiveBlockState>,
    pub(crate) predicted_theta: Option<Mat<f64>>,
    pub(crate) truncation_fallbacks: usize,
}

impl ModelState {
    /// # Errors
    ///
    /// Returns `IfaError` if an initial value has the wrong shape or lies
    /// outside its support.
    pub fn new(
        model: &IfaModel,
        initial: InitialValues,
        adaptive: &AdaptiveInit,
    ) -> Result<Self, IfaError> {
        let n = model.n_respondents();
        let m = model.n_items();
        let q = model.n_factors();

        check_shape("initial theta", &initial.theta, n, q)?;
        check_shape("initial discrimination", &initial.discrimination, m, q)?;
        if initial.difficulty.len() != m {
            return Err(IfaError::LengthMismatch {
                what: "initial difficulty",
                expected: m,
                found: initial.difficulty.len(),
            });
        }
        if !matrix_is_finite(&initial.theta)
            || !matrix_is_finite(&initial.discrimination)
            || initial.difficulty.iter().any(|c| !c.is_finite())
        {
            return Err(IfaError::NonFiniteInitialValues("initial values"));
        }

        let correlation = initial.correlation.unwrap_or_else(|| identity_matrix(q));
        check_shape("initial correlation", &correlation, q, q)?;
        if !is_correlation_matrix(&correlation, CORRELATION_TOLERANCE) {
            return Err(IfaError::InvalidCorrelation);
        }
        let lower = crate::utils::cholesky_lower(&correlation)
            .map_err(|_| IfaError::InvalidCorrelation)?;
        let corr_free = free_from_cholesky(&lower);
        let corr_chol = cholesky_from_free(&corr_free, q)
            .ok_or(IfaError::InvalidCorrelation)?
            .lower;

        let regression = match model.covariates() {
            Some(structure) => {
                let coefficients = initial
                    .regression
                    .unwrap_or_else(|| Mat::zeros(structure.n_predictors(), q));
                check_shape(
                    "initial regression",
                    &coefficients,
                    structure.n_predictors(),
                    q,
                )?;
                if !matrix_is_finite(&coefficients) {
                    return Err(IfaError::NonFiniteInitialValues("initial regression coefficients"));
                }
                Some(structure.restrict(&coefficients))
            }
            None => None,
        };

        let spatial = if model.variant().is_spatial() {
            let default_range = model.distances().map_or(1.0, |d| mean_distance(d, n));
            let params = SpatialParams {
                share: initial
                    .spatial_share
                    .unwrap_or_else(|| vec![DEFAULT_SPATIAL_SHARE; q]),
                range: initial
                    .spatial_range
                    .unwrap_or_else(|| vec![default_range; q]),
            };
            if !params.is_valid(q) {
                return Err(IfaError::InvalidSpatialParameters);
            }
            Some(params)
        } else {
            None
        };

        let trait_prior = model
            .trait_prior(&corr_chol, spatial.as_ref())
            .ok_or(IfaError::SingularTraitPrior)?;
        let prior_mean = model.trait_prior_mean(regression.as_ref());

        let blocks = initial_blocks(model, &corr_free, spatial.as_ref(), adaptive)?;

        let discrimination = model.loadings().harmonize(&initial.discrimination);
        let restricted_discrimination = model.loadings().restrict(&discrimination);

        let cut_points: Vec<Vec<f64>> = (0..m)
            .map(|item| initial_cut_points(model.n_categories(item)))
            .collect();
        let mut latent = Mat::<f64>::zeros(n, m);
        for (item, cuts) in cut_points.iter().enumerate() {
            for observation in model.observations(item) {
                latent[(observation.respondent, item)] =
                    initial_latent_response(cuts, observation.category);
            }
        }

        Ok(Self {
            theta: initial.theta,
            discrimination,
            restricted_discrimination,
            difficulty: initial.difficulty,
            cut_points,
            latent,
            corr_free,
            corr_chol,
            regression,
            spatial,
            prior_mean,
            trait_prior,
            blocks,
            predicted_theta: None,
            truncation_fallbacks: 0,
        })
    }

    /// `n x q` latent traits.
    #[must_use]
    pub const fn theta(&self) -> &Mat<f64> {
        &self.theta
    }

    /// Unrestricted discriminations `A`.
    #[must_use]
    pub const fn discrimination(&self) -> &Mat<f64> {
        &self.discrimination
    }

    /// Restricted discriminations `LA` used by every stage.
    #[must_use]
    pub const fn restricted_discrimination(&self) -> &Mat<f64> {
        &self.restricted_discrimination
    }

    #[must_use]
    pub fn difficulty(&self) -> &[f64] {
        &self.difficulty
    }

    /// Cut points `[-inf, 0, ..., +inf]` of `item`.
    #[must_use]
    pub fn cut_points(&self, item: usize) -> &[f64] {
        &self.cut_points[item]
    }

    /// `n x m` augmented responses; missing cells hold their initial zero.
    #[must_use]
    pub const fn latent_responses(&self) -> &Mat<f64> {
        &self.latent
    }

    #[must_use]
    pub fn corr_free(&self) -> &[f64] {
        &self.corr_free
    }

    #[must_use]
    pub const fn corr_chol(&self) -> &Mat<f64> {
        &self.corr_chol
    }

    /// Realized trait correlation.
    #[must_use]
    pub fn correlation(&self) -> Mat<f64> {
        super::correlation::correlation_from_cholesky(&self.corr_chol)
    }

    #[must_use]
    pub const fn regression(&self) -> Option<&Mat<f64>> {
        self.regression.as_ref()
    }

    #[must_use]
    pub const fn spatial(&self) -> Option<&SpatialParams> {
        self.spatial.as_ref()
    }

    #[must_use]
    pub const fn trait_prior(&self) -> &TraitPrior {
        &self.trait_prior
    }

    #[must_use]
    pub const fn prior_mean(&self) -> &Mat<f64> {
        &self.prior_mean
    }

    #[must_use]
    pub fn adaptive_blocks(&self) -> &[AdaptiveBlockState] {
        &self.blocks
    }

    #[must_use]
    pub const fn predicted_theta(&self) -> Option<&Mat<f64>> {
        self.predicted_theta.as_ref()
    }

    #[must_use]
    pub const fn truncation_fallbacks(&self) -> usize {
        self.truncation_fallbacks
    }

    /// Recompute `LA` from `A`.
    pub(crate) fn refresh_restricted_discrimination(&mut self, model: &IfaModel) {
        self.restricted_discrimination = model.loadings().restrict(&self.discrimination);
    }

    /// Log-density of the current traits under the current prior.
    #[must_use]
    pub fn trait_log_density(&self) -> f64 {
        self.trait_prior.log_density(&self.theta, &self.prior_mean)
    }
}

fn initial_blocks(
    model: &IfaModel,
    corr_free: &[f64],
    spatial: Option<&SpatialParams>,
    adaptive: &AdaptiveInit,
) -> Result<Vec<AdaptiveBlockState>, IfaError> {
    if !(adaptive.scale.is_finite() && adaptive.scale > 0.0) {
        return Err(IfaError::InvalidAdaptiveScale(adaptive.scale));
    }
    let layout = model.adaptive_blocks();
    let total_dim: usize = layout.iter().map(|(_, dim)| dim).sum();
    if let Some(covariance) = &adaptive.covariance
        && (covariance.nrows() != total_dim
            || covariance.ncols() != total_dim
            || !matrix_is_finite(covariance)
            || !matrix_is_symmetric(covariance, CORRELATION_TOLERANCE))
    {
        return Err(IfaError::InvalidAdaptiveCovariance { dim: total_dim });
    }

    let mut offset = 0;
    let blocks = layout
        .into_iter()
        .map(|(kind, dim)| {
            let initial = match kind {
                AdaptiveBlock::Correlation => corr_free.to_vec(),
                AdaptiveBlock::Spatial => {
                    spatial.map_or_else(|| vec![0.0; dim], SpatialParams::to_unconstrained)
                }
            };
            let covariance = adaptive.covariance.as_ref().map_or_else(
                || identity_matrix(dim),
                |full| Mat::from_fn(dim, dim, |i, j| full[(offset + i, offset + j)]),
            );
            offset += dim;
            AdaptiveBlockState {
                kind,
                proposal: AdaptiveProposal::new(initial, covariance, adaptive.scale),
            }
        })
        .collect();
    Ok(blocks)
}

fn mean_distance(distances: &Mat<f64>, n: usize) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..n {
        for j in 0..i {
            total += distances[(i, j)];
            count += 1;
        }
    }
    if count == 0 || total <= 0.0 {
        1.0
    } else {
        total / usize_to_f64(count)
    }
}

fn check_shape(
    what: &'static str,
    matrix: &Mat<f64>,
    expected_rows: usize,
    expected_cols: usize,
) -> Result<(), IfaError> {
    if matrix.nrows() == expected_rows && matrix.ncols() == expected_cols {
        Ok(())
    } else {
        Err(IfaError::DimensionMismatch {
            what,
            expected_rows,
            expected_cols,
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use approx::assert_relative_eq;

    use crate::models::ifa::likelihood::category_of;

    #[test]
    fn initial_latent_responses_match_categories() {
        let responses = Mat::from_fn(6, 3, |i, j| match (i + j) % 4 {
            0 => 0.0,
            1 => 1.0,
            2 => 2.0,
            _ => f64::NAN,
        });
        let input = IfaInput::new(responses.clone(), 1);
        let (model, state) = build(
            &input,
            &Restrictions::unrestricted(3, 1),
            ModelVariant::Exploratory,
            InitialValues::standard(6, 3, 1, 0.5),
        );
        for item in 0..3 {
            assert_eq!(model.n_categories(item), 3);
            for observation in model.observations(item) {
                let z = state.latent_responses()[(observation.respondent, item)];
                assert_eq!(category_of(z, state.cut_points(item)), observation.category);
            }
        }
        assert_eq!(model.items_answered_by(3).len(), 3 - 1);
    }

    #[test]
    fn structural_zeros_and_ties_are_enforced_at_construction() {
        let input = binary_input(10, 3, 2);
        let loadings = Mat::from_fn(3, 2, |i, j| match (i, j) {
            (0, 1) => 0.0,
            (1, 0) | (2, 0) => 2.0,
            _ => 1.0,
        });
        let mut initial = InitialValues::standard(10, 3, 2, 0.5);
        initial.discrimination[(0, 1)] = 3.0;
        initial.discrimination[(1, 0)] = 1.0;
        initial.discrimination[(2, 0)] = 2.0;
        let (_, state) = build(
            &input,
            &Restrictions::new(loadings),
            ModelVariant::Exploratory,
            initial,
        );
        assert!(state.restricted_discrimination()[(0, 1)].abs() < f64::EPSILON);
        assert!(state.discrimination()[(0, 1)].abs() < f64::EPSILON);
        assert_relative_eq!(state.discrimination()[(1, 0)], 1.5);
        assert_relative_eq!(state.discrimination()[(2, 0)], 1.5);
    }

    #[test]
    fn covariate_variant_requires_predictors() {
        let input = binary_input(5, 2, 1);
        let err = IfaModel::new(
            &input,
            &Restrictions::unrestricted(2, 1),
            ModelVariant::Covariate,
        )
        .expect_err("predictors are required");
        assert!(matches!(err, IfaError::MissingComponent { .. }));
    }

    #[test]
    fn invalid_initial_correlation_is_rejected() {
        let input = binary_input(5, 2, 2);
        let model = IfaModel::new(
            &input,
            &Restrictions::unrestricted(2, 2),
            ModelVariant::Exploratory,
        )
        .expect("valid model");
        let initial = InitialValues::standard(5, 2, 2, 0.5)
            .with_correlation(Mat::from_fn(2, 2, |_, _| 1.0));
        let err = ModelState::new(&model, initial, &AdaptiveInit::default())
            .expect_err("singular correlation");
        assert_eq!(err, IfaError::InvalidCorrelation);
    }

    #[test]
    fn adaptive_covariance_is_split_block_diagonally() {
        let input = binary_input(6, 3, 2).with_distances(line_distances(6));
        let model = IfaModel::new(
            &input,
            &Restrictions::unrestricted(3, 2),
            ModelVariant::Spatial,
        )
        .expect("valid model");
        assert_eq!(
            model.adaptive_blocks(),
            vec![(AdaptiveBlock::Correlation, 1), (AdaptiveBlock::Spatial, 4)]
        );
        let covariance = Mat::from_fn(5, 5, |i, j| {
            if i == j { usize_to_f64(i + 1) } else { 0.0 }
        });
        let adaptive = AdaptiveInit {
            covariance: Some(covariance),
            scale: 0.5,
        };
        let state = ModelState::new(&model, InitialValues::standard(6, 3, 2, 0.5), &adaptive)
            .expect("valid state");
        let blocks = state.adaptive_blocks();
        assert_eq!(blocks.len(), 2);
        assert_relative_eq!(blocks[0].proposal.params_cov()[(0, 0)], 1.0);
        assert_relative_eq!(blocks[1].proposal.params_cov()[(0, 0)], 2.0);
        assert_relative_eq!(blocks[1].proposal.params_cov()[(3, 3)], 5.0);
        assert_relative_eq!(blocks[0].proposal.logscale(), 0.5_f64.ln());

        let wrong = AdaptiveInit {
            covariance: Some(identity_matrix(3)),
            scale: 0.5,
        };
        assert_eq!(
            ModelState::new(&model, InitialValues::standard(6, 3, 2, 0.5), &wrong).err(),
            Some(IfaError::InvalidAdaptiveCovariance { dim: 5 })
        );
    }

    #[test]
    fn lmc_covariance_has_unit_variances() {
        let distances = line_distances(4);
        let corr_chol = cholesky_from_free(&[0.5], 2).expect("valid").lower;
        let spatial = SpatialParams {
            share: vec![0.7, 0.4],
            range: vec![1.0, 2.0],
        };
        let covariance = lmc_covariance(&distances, &corr_chol, &spatial, 0..4, 0..4);
        assert_eq!(covariance.nrows(), 8);
        for idx in 0..8 {
            assert_relative_eq!(covariance[(idx, idx)], 1.0, epsilon = 1e-12);
        }
        // same location, different factors: the trait correlation
        assert_relative_eq!(covariance[(0, 4)], 0.5_f64.tanh(), epsilon = 1e-12);
        assert!(matrix_is_symmetric(&covariance, 1e-12));
    }

    #[test]
    fn spatial_params_round_trip_unconstrained() {
        let params = SpatialParams {
            share: vec![0.2, 0.9],
            range: vec![0.5, 3.0],
        };
        let recovered =
            SpatialParams::from_unconstrained(&params.to_unconstrained()).expect("in support");
        for (a, b) in recovered.share.iter().zip(&params.share) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        for (a, b) in recovered.range.iter().zip(&params.range) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        assert!(SpatialParams::from_unconstrained(&[800.0, 0.0]).is_none());
    }

    #[test]
    fn joint_and_independent_priors_agree_without_spatial_structure() {
        // with share -> 0 the joint prior factorizes over respondents
        let corr_chol = cholesky_from_free(&[0.3], 2).expect("valid").lower;
        let distances = line_distances(3);
        let spatial = SpatialParams {
            share: vec![1.0e-12, 1.0e-12],
            range: vec![1.0, 1.0],
        };
        let covariance = lmc_covariance(&distances, &corr_chol, &spatial, 0..3, 0..3);
        let joint = TraitPrior::joint(&covariance).expect("positive definite");
        let independent = TraitPrior::independent(&corr_chol);
        let theta = Mat::from_fn(3, 2, |i, j| 0.3 * usize_to_f64(i) - 0.2 * usize_to_f64(j));
        let mean = Mat::zeros(3, 2);
        assert_relative_eq!(
            joint.log_density(&theta, &mean),
            independent.log_density(&theta, &mean),
            epsilon = 1e-8
        );
    }
}
