//! # Model inputs
//!
//! Defines the container for an item response matrix together with the
//! optional respondent-level predictors and inter-respondent distances used
//! by the structured trait priors.
//!
//! Responses are category indices `0, 1, 2, ...` stored as `f64`; `NaN`
//! marks a missing response.
//!
//! # Examples
//!
//! ```
//! use faer::Mat;
//! use bayesian_ifa::IfaInput;
//!
//! let responses = Mat::from_fn(4, 3, |i, j| ((i + j) % 2) as f64);
//! let input = IfaInput::new(responses, 1);
//!
//! assert!(input.validate().is_ok());
//! ```
//!
//! ```
//! use faer::Mat;
//! use bayesian_ifa::IfaInput;
//!
//! let responses = Mat::from_fn(4, 3, |i, _| if i == 0 { 0.5 } else { 1.0 });
//! let input = IfaInput::new(responses, 1);
//!
//! assert!(input.validate().is_err());
//! ```

use faer::Mat;
use thiserror::Error;

use crate::utils::{matrix_is_finite, matrix_is_symmetric};

const DISTANCE_SYMMETRY_TOLERANCE: f64 = 1.0e-9;

/// Errors returned when validating model inputs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("response matrix must have at least one respondent and one item")]
    EmptyResponses,
    #[error("number of latent factors must be positive")]
    ZeroFactors,
    #[error("response ({row}, {col}) is {value}; responses must be non-negative integers or NaN")]
    InvalidCategory { row: usize, col: usize, value: f64 },
    #[error("predictor rows ({rows}) must be at least the number of respondents ({respondents})")]
    PredictorRows { rows: usize, respondents: usize },
    #[error("predictor matrix must have at least one column")]
    EmptyPredictors,
    #[error("predictor matrix contains non-finite values")]
    NonFinitePredictors,
    #[error("distance matrix must be square with at least {respondents} rows; found {rows}x{cols}")]
    DistanceShape {
        rows: usize,
        cols: usize,
        respondents: usize,
    },
    #[error("distance matrix contains non-finite values")]
    NonFiniteDistances,
    #[error("distance matrix contains negative values")]
    NegativeDistances,
    #[error("distance matrix must be symmetric")]
    AsymmetricDistances,
    #[error("predictor rows ({predictors}) must match distance rows ({distances})")]
    LocationMismatch { predictors: usize, distances: usize },
}

#[derive(Debug, Clone)]
pub struct IfaInput {
    pub responses: Mat<f64>,
    pub n_factors: usize,
    pub predictors: Option<Mat<f64>>,
    pub distances: Option<Mat<f64>>,
}

impl IfaInput {
    #[must_use]
    pub const fn new(responses: Mat<f64>, n_factors: usize) -> Self {
        Self {
            responses,
            n_factors,
            predictors: None,
            distances: None,
        }
    }

    /// Attach respondent predictors; rows beyond the respondents are
    /// prediction points.
    #[must_use]
    pub fn with_predictors(mut self, predictors: Mat<f64>) -> Self {
        self.predictors = Some(predictors);
        self
    }

    /// Attach a distance matrix over locations; rows beyond the respondents
    /// are prediction points.
    #[must_use]
    pub fn with_distances(self, distances: Mat<f64>) -> Self {
        Self {
            distances: Some(distances),
            ..self
        }
    }

    #[must_use]
    pub const fn responses(&self) -> &Mat<f64> {
        &self.responses
    }

    #[must_use]
    pub const fn predictors(&self) -> Option<&Mat<f64>> {
        self.predictors.as_ref()
    }

    #[must_use]
    pub const fn distances(&self) -> Option<&Mat<f64>> {
        self.distances.as_ref()
    }

    #[must_use]
    pub fn n_respondents(&self) -> usize {
        self.responses.nrows()
    }

    #[must_use]
    pub fn n_items(&self) -> usize {
        self.responses.ncols()
    }

    /// Number of prediction points carried by predictors or distances.
    #[must_use]
    pub fn n_prediction_points(&self) -> usize {
        let extra_rows = |rows: usize| rows.saturating_sub(self.n_respondents());
        self.distances
            .as_ref()
            .map(|d| extra_rows(d.nrows()))
            .or_else(|| self.predictors.as_ref().map(|x| extra_rows(x.nrows())))
            .unwrap_or(0)
    }

    /// Validate the response matrix and factor count only.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the responses are malformed.
    pub fn validate_core(&self) -> Result<(), InputError> {
        if self.responses.nrows() == 0 || self.responses.ncols() == 0 {
            return Err(InputError::EmptyResponses);
        }
        if self.n_factors == 0 {
            return Err(InputError::ZeroFactors);
        }
        for col in 0..self.responses.ncols() {
            for row in 0..self.responses.nrows() {
                let value = self.responses[(row, col)];
                if value.is_nan() {
                    continue;
                }
                if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
                    return Err(InputError::InvalidCategory { row, col, value });
                }
            }
        }
        Ok(())
    }

    /// Validate responses, predictors and distances.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if inputs are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        self.validate_core()?;
        let respondents = self.n_respondents();
        if let Some(predictors) = &self.predictors {
            if predictors.ncols() == 0 {
                return Err(InputError::EmptyPredictors);
            }
            if predictors.nrows() < respondents {
                return Err(InputError::PredictorRows {
                    rows: predictors.nrows(),
                    respondents,
                });
            }
            if !matrix_is_finite(predictors) {
                return Err(InputError::NonFinitePredictors);
            }
        }
        if let Some(distances) = &self.distances {
            if distances.nrows() != distances.ncols() || distances.nrows() < respondents {
                return Err(InputError::DistanceShape {
                    rows: distances.nrows(),
                    cols: distances.ncols(),
                    respondents,
                });
            }
            if !matrix_is_finite(distances) {
                return Err(InputError::NonFiniteDistances);
            }
            if (0..distances.nrows())
                .any(|i| (0..distances.ncols()).any(|j| distances[(i, j)] < 0.0))
            {
                return Err(InputError::NegativeDistances);
            }
            if !matrix_is_symmetric(distances, DISTANCE_SYMMETRY_TOLERANCE) {
                return Err(InputError::AsymmetricDistances);
            }
        }
        if let (Some(predictors), Some(distances)) = (&self.predictors, &self.distances)
            && predictors.nrows() != distances.nrows()
        {
            return Err(InputError::LocationMismatch {
                predictors: predictors.nrows(),
                distances: distances.nrows(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_responses(rows: usize, cols: usize) -> Mat<f64> {
        Mat::from_fn(rows, cols, |i, j| if (i + j) % 2 == 0 { 1.0 } else { 0.0 })
    }

    #[test]
    fn validate_accepts_missing_responses() {
        let responses = Mat::from_fn(3, 2, |i, _| if i == 1 { f64::NAN } else { 2.0 });
        assert!(IfaInput::new(responses, 1).validate().is_ok());
    }

    #[test]
    fn validate_rejects_fractional_category() {
        let responses = Mat::from_fn(2, 2, |i, j| if i == 1 && j == 0 { 1.5 } else { 0.0 });
        let err = IfaInput::new(responses, 1)
            .validate_core()
            .expect_err("fractional category should fail");
        assert_eq!(
            err,
            InputError::InvalidCategory {
                row: 1,
                col: 0,
                value: 1.5
            }
        );
    }

    #[test]
    fn validate_rejects_negative_and_infinite_categories() {
        let negative = Mat::from_fn(2, 1, |i, _| if i == 0 { -1.0 } else { 0.0 });
        assert!(matches!(
            IfaInput::new(negative, 1).validate_core(),
            Err(InputError::InvalidCategory { .. })
        ));
        let infinite = Mat::from_fn(2, 1, |i, _| if i == 0 { f64::INFINITY } else { 0.0 });
        assert!(matches!(
            IfaInput::new(infinite, 1).validate_core(),
            Err(InputError::InvalidCategory { .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_and_zero_factor_inputs() {
        let err = IfaInput::new(Mat::zeros(0, 3), 1)
            .validate_core()
            .expect_err("empty responses should fail");
        assert_eq!(err, InputError::EmptyResponses);
        let err = IfaInput::new(binary_responses(2, 2), 0)
            .validate_core()
            .expect_err("zero factors should fail");
        assert_eq!(err, InputError::ZeroFactors);
    }

    #[test]
    fn validate_rejects_short_predictors() {
        let input = IfaInput::new(binary_responses(4, 2), 1)
            .with_predictors(Mat::from_fn(3, 2, |_, _| 1.0));
        let err = input.validate().expect_err("short predictors should fail");
        assert_eq!(
            err,
            InputError::PredictorRows {
                rows: 3,
                respondents: 4
            }
        );
    }

    #[test]
    fn validate_rejects_malformed_distances() {
        let asymmetric = Mat::from_fn(3, 3, |i, j| if i < j { 1.0 } else { 0.0 });
        let input = IfaInput::new(binary_responses(3, 2), 1).with_distances(asymmetric);
        assert_eq!(input.validate(), Err(InputError::AsymmetricDistances));

        let negative = Mat::from_fn(3, 3, |i, j| if i == j { 0.0 } else { -1.0 });
        let input = IfaInput::new(binary_responses(3, 2), 1).with_distances(negative);
        assert_eq!(input.validate(), Err(InputError::NegativeDistances));

        let rectangular = Mat::from_fn(3, 2, |_, _| 1.0);
        let input = IfaInput::new(binary_responses(3, 2), 1).with_distances(rectangular);
        assert!(matches!(
            input.validate(),
            Err(InputError::DistanceShape { .. })
        ));
    }

    #[test]
    fn prediction_points_follow_extra_rows() {
        let distances = Mat::from_fn(5, 5, |i, j| {
            let gap = i.abs_diff(j);
            f64::from(u32::try_from(gap).unwrap_or(u32::MAX))
        });
        let input = IfaInput::new(binary_responses(3, 2), 1)
            .with_predictors(Mat::from_fn(5, 1, |_, _| 1.0))
            .with_distances(distances);
        assert!(input.validate().is_ok());
        assert_eq!(input.n_prediction_points(), 2);
    }

    #[test]
    fn validate_rejects_location_mismatch() {
        let distances = Mat::from_fn(3, 3, |i, j| if i == j { 0.0 } else { 1.0 });
        let input = IfaInput::new(binary_responses(3, 2), 1)
            .with_predictors(Mat::from_fn(4, 1, |_, _| 1.0))
            .with_distances(distances);
        assert_eq!(
            input.validate(),
            Err(InputError::LocationMismatch {
                predictors: 4,
                distances: 3
            })
        );
    }
}
