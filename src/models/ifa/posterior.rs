//! Posterior storage and summaries for the IFA sampler.

use faer::Mat;
use num_traits::ToPrimitive;

use crate::models::matrix_ops::elementwise_mean;
use crate::utils::usize_to_f64;

use super::types::{BlockDiagnostics, IfaSamplerDiagnostics};

/// A single recorded iteration.
#[derive(Debug, Clone)]
pub struct IfaPosteriorDraw {
    /// 1-based iteration the snapshot was taken at.
    pub iteration: usize,
    pub theta: Mat<f64>,
    pub difficulty: Vec<f64>,
    /// Restricted discriminations `LA`.
    pub discrimination: Mat<f64>,
    /// Full cut-point vectors per item, `[-inf, 0, ..., +inf]`.
    pub thresholds: Vec<Vec<f64>>,
    pub correlation: Mat<f64>,
    pub regression: Option<Mat<f64>>,
    pub spatial_share: Option<Vec<f64>>,
    pub spatial_range: Option<Vec<f64>>,
    pub predicted_theta: Option<Mat<f64>>,
    /// Augmented responses, when requested in the sampler configuration.
    pub latent_responses: Option<Mat<f64>>,
    pub adaptation: Vec<BlockDiagnostics>,
}

/// Recorded draws of one chain plus run diagnostics.
#[derive(Debug, Clone, Default)]
pub struct IfaPosteriorSamples {
    pub draws: Vec<IfaPosteriorDraw>,
    pub diagnostics: IfaSamplerDiagnostics,
}

impl IfaPosteriorSamples {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    /// Trace of one scalar extracted from every draw, in recording order.
    #[must_use]
    pub fn trace(&self, extract: impl Fn(&IfaPosteriorDraw) -> f64) -> Vec<f64> {
        self.draws.iter().map(extract).collect()
    }
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

/// Posterior summary of the recorded IFA draws.
#[derive(Debug, Clone, Default)]
pub struct IfaPosteriorSummary {
    pub difficulty: Vec<ParameterSummary>,
    /// Row-major over `(item, factor)`.
    pub discrimination: Vec<ParameterSummary>,
    /// Strictly lower-triangular correlations, row by row.
    pub correlation: Vec<ParameterSummary>,
    /// Row-major over `(predictor, factor)`; empty without regression.
    pub regression: Vec<ParameterSummary>,
    /// Posterior mean of every respondent's traits.
    pub theta_mean: Option<Mat<f64>>,
    pub predicted_theta_mean: Option<Mat<f64>>,
    pub draw_count: usize,
}

/// Compute posterior summaries for all stored parameter blocks.
#[must_use]
pub fn summarize_posterior(samples: &IfaPosteriorSamples) -> IfaPosteriorSummary {
    let draw_count = samples.len();
    let Some(first) = samples.draws.first() else {
        return IfaPosteriorSummary {
            draw_count,
            ..IfaPosteriorSummary::default()
        };
    };

    let difficulty = (0..first.difficulty.len())
        .map(|item| summarize_scalar(&samples.trace(|draw| draw.difficulty[item])))
        .collect();

    let (m, q) = (first.discrimination.nrows(), first.discrimination.ncols());
    let discrimination = (0..m * q)
        .map(|index| {
            summarize_scalar(&samples.trace(|draw| draw.discrimination[(index / q, index % q)]))
        })
        .collect();

    let correlation = (1..q)
        .flat_map(|row| (0..row).map(move |col| (row, col)))
        .map(|(row, col)| summarize_scalar(&samples.trace(|draw| draw.correlation[(row, col)])))
        .collect();

    let regression = first.regression.as_ref().map_or_else(Vec::new, |coefficients| {
        let cols = coefficients.ncols();
        (0..coefficients.nrows() * cols)
            .map(|index| {
                summarize_scalar(&samples.trace(|draw| {
                    draw.regression
                        .as_ref()
                        .map_or(f64::NAN, |b| b[(index / cols, index % cols)])
                }))
            })
            .collect()
    });

    let theta_mean = elementwise_mean(samples.draws.iter().map(|draw| &draw.theta));
    let predicted: Vec<&Mat<f64>> = samples
        .draws
        .iter()
        .filter_map(|draw| draw.predicted_theta.as_ref())
        .collect();
    let predicted_theta_mean = elementwise_mean(predicted.into_iter());

    IfaPosteriorSummary {
        difficulty,
        discrimination,
        correlation,
        regression,
        theta_mean,
        predicted_theta_mean,
        draw_count,
    }
}

#[must_use]
pub fn summarize_scalar(values: &[f64]) -> ParameterSummary {
    if values.is_empty() {
        return ParameterSummary::default();
    }

    let n = usize_to_f64(values.len());
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / n.max(1.0);

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    ParameterSummary {
        mean,
        std_dev: variance.sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}

/// Linearly interpolated percentile of already sorted values.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn draw(iteration: usize, value: f64) -> IfaPosteriorDraw {
        IfaPosteriorDraw {
            iteration,
            theta: Mat::from_fn(2, 2, |i, k| value + usize_to_f64(i + k)),
            difficulty: vec![value, -value],
            discrimination: Mat::from_fn(2, 2, |i, k| if i == k { value } else { 0.0 }),
            thresholds: vec![vec![f64::NEG_INFINITY, 0.0, f64::INFINITY]; 2],
            correlation: Mat::from_fn(2, 2, |i, k| if i == k { 1.0 } else { 0.1 * value }),
            regression: None,
            spatial_share: None,
            spatial_range: None,
            predicted_theta: None,
            latent_responses: None,
            adaptation: Vec::new(),
        }
    }

    #[test]
    fn summarize_empty_samples() {
        let summary = summarize_posterior(&IfaPosteriorSamples::default());
        assert_eq!(summary.draw_count, 0);
        assert!(summary.difficulty.is_empty());
        assert!(summary.theta_mean.is_none());
    }

    #[test]
    fn summarize_non_empty_samples() {
        let samples = IfaPosteriorSamples {
            draws: vec![draw(1, 1.0), draw(2, 3.0)],
            diagnostics: IfaSamplerDiagnostics::default(),
        };
        let summary = summarize_posterior(&samples);
        assert_eq!(summary.draw_count, 2);
        assert_eq!(summary.difficulty.len(), 2);
        assert_eq!(summary.discrimination.len(), 4);
        assert_eq!(summary.correlation.len(), 1);
        assert!(summary.regression.is_empty());
        assert_relative_eq!(summary.difficulty[0].mean, 2.0);
        assert_relative_eq!(summary.difficulty[1].mean, -2.0);
        assert_relative_eq!(summary.discrimination[1].std_dev, 0.0);
        assert_relative_eq!(summary.correlation[0].mean, 0.2, epsilon = 1e-12);
        let theta_mean = summary.theta_mean.expect("draws present");
        assert_relative_eq!(theta_mean[(1, 1)], 4.0);
        assert!(summary.predicted_theta_mean.is_none());
    }

    #[test]
    fn percentile_interpolates_between_order_statistics() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_relative_eq!(percentile(&sorted, 0.5), 1.5);
        assert_relative_eq!(percentile(&sorted, 1.0), 3.0);
        assert!(percentile(&[], 0.5).is_nan());
    }
}
