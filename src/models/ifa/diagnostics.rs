//! Chain diagnostics for recorded IFA draws.

use crate::utils::usize_to_f64;

use super::posterior::{IfaPosteriorDraw, IfaPosteriorSamples};
use super::types::IfaError;

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let denominator: f64 = series
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum();
    if denominator <= 0.0 {
        return 0.0;
    }

    let numerator: f64 = (0..n)
        .map(|idx| (series[idx] - mean) * (series[idx + lag] - mean))
        .sum();
    numerator / denominator
}

/// Effective sample size with the autocorrelation sum truncated at the
/// first non-positive lag.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Split-R-hat per scalar parameter across independent chains.
#[derive(Debug, Clone, Default)]
pub struct IfaConvergenceSummary {
    pub chain_count: usize,
    /// Draws per chain used after truncation to a common even length.
    pub draws_per_chain_used: usize,
    pub difficulty_split_rhat: Vec<f64>,
    /// Row-major over `(item, factor)`.
    pub discrimination_split_rhat: Vec<f64>,
    /// Strictly lower-triangular correlations, row by row.
    pub correlation_split_rhat: Vec<f64>,
    pub max_split_rhat: Option<f64>,
}

/// Split-R-hat for difficulties, discriminations and correlations.
///
/// Loadings are sign-identified only through the data and the restriction
/// pattern; chains that settle on mirrored solutions show up here as large
/// R-hat values for the affected items.
///
/// # Errors
///
/// Returns `IfaError` if fewer than two chains are given, a chain holds
/// fewer than four usable draws, or draw dimensions differ across chains.
pub fn summarize_multi_chain_convergence(
    chains: &[IfaPosteriorSamples],
) -> Result<IfaConvergenceSummary, IfaError> {
    if chains.len() < 2 {
        return Err(IfaError::InvalidChainCount {
            min: 2,
            found: chains.len(),
        });
    }
    let min_draws = chains
        .iter()
        .map(IfaPosteriorSamples::len)
        .min()
        .unwrap_or(0);
    let draws_per_chain_used = min_draws - (min_draws % 2);
    if draws_per_chain_used < 4 {
        return Err(IfaError::InsufficientChainDraws {
            minimum: 4,
            found: draws_per_chain_used,
        });
    }

    let first = chains
        .first()
        .and_then(|chain| chain.draws.first())
        .ok_or(IfaError::InsufficientChainDraws {
            minimum: 4,
            found: 0,
        })?;
    let m = first.difficulty.len();
    let (rows, q) = (first.discrimination.nrows(), first.discrimination.ncols());
    for chain in chains {
        for draw in chain.draws.iter().take(draws_per_chain_used) {
            if draw.difficulty.len() != m
                || draw.discrimination.nrows() != rows
                || draw.discrimination.ncols() != q
            {
                return Err(IfaError::InconsistentPosteriorDimensions);
            }
        }
    }

    let difficulty_split_rhat = (0..m)
        .map(|item| split_rhat_from_chains(chains, draws_per_chain_used, |draw| draw.difficulty[item]))
        .collect::<Result<Vec<_>, _>>()?;
    let discrimination_split_rhat = (0..rows * q)
        .map(|index| {
            split_rhat_from_chains(chains, draws_per_chain_used, |draw| {
                draw.discrimination[(index / q, index % q)]
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let correlation_split_rhat = (1..q)
        .flat_map(|row| (0..row).map(move |col| (row, col)))
        .map(|(row, col)| {
            split_rhat_from_chains(chains, draws_per_chain_used, |draw| draw.correlation[(row, col)])
        })
        .collect::<Result<Vec<_>, _>>()?;

    let max_split_rhat = difficulty_split_rhat
        .iter()
        .chain(&discrimination_split_rhat)
        .chain(&correlation_split_rhat)
        .copied()
        .max_by(f64::total_cmp);

    Ok(IfaConvergenceSummary {
        chain_count: chains.len(),
        draws_per_chain_used,
        difficulty_split_rhat,
        discrimination_split_rhat,
        correlation_split_rhat,
        max_split_rhat,
    })
}

fn split_rhat_from_chains<F>(
    chains: &[IfaPosteriorSamples],
    draws_per_chain_used: usize,
    extractor: F,
) -> Result<f64, IfaError>
where
    F: Fn(&IfaPosteriorDraw) -> f64,
{
    let half = draws_per_chain_used / 2;
    let mut split_chains = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        split_chains.push(chain.draws.iter().take(half).map(&extractor).collect());
        split_chains.push(
            chain
                .draws
                .iter()
                .skip(half)
                .take(half)
                .map(&extractor)
                .collect(),
        );
    }
    split_rhat(&split_chains)
}

/// Potential scale reduction of equally long scalar chains.
///
/// # Errors
///
/// Returns `IfaError` for fewer than two chains, chains shorter than two
/// draws, or chains of unequal length.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, IfaError> {
    if chains.len() < 2 {
        return Err(IfaError::InvalidChainCount {
            min: 2,
            found: chains.len(),
        });
    }
    let n = chains.first().map_or(0, Vec::len);
    if n < 2 {
        return Err(IfaError::InsufficientChainDraws {
            minimum: 2,
            found: n,
        });
    }
    if chains.iter().any(|chain| chain.len() != n) {
        return Err(IfaError::InconsistentPosteriorDimensions);
    }

    let n_f64 = usize_to_f64(n);
    let chain_means: Vec<f64> = chains
        .iter()
        .map(|chain| chain.iter().sum::<f64>() / n_f64)
        .collect();
    let within = chains
        .iter()
        .zip(&chain_means)
        .map(|(chain, mean)| sample_variance(chain, *mean))
        .sum::<f64>()
        / usize_to_f64(chains.len());
    let mean_of_means = chain_means.iter().sum::<f64>() / usize_to_f64(chains.len());
    let between = n_f64
        * chain_means
            .iter()
            .map(|mean| (mean - mean_of_means).powi(2))
            .sum::<f64>()
        / usize_to_f64(chains.len() - 1);

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return Ok(1.0);
    }
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    if !var_plus.is_finite() || var_plus <= 0.0 {
        return Ok(1.0);
    }
    Ok((var_plus / within).sqrt().max(1.0))
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / usize_to_f64(values.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    use crate::models::ifa::types::IfaSamplerDiagnostics;

    fn chain(offset: f64, len: usize) -> IfaPosteriorSamples {
        let draws = (0..len)
            .map(|iteration| {
                let wiggle = if iteration % 2 == 0 { 0.1 } else { -0.1 };
                IfaPosteriorDraw {
                    iteration: iteration + 1,
                    theta: Mat::zeros(2, 1),
                    difficulty: vec![offset + wiggle],
                    discrimination: Mat::from_fn(1, 1, |_, _| 1.0 + wiggle),
                    thresholds: vec![vec![f64::NEG_INFINITY, 0.0, f64::INFINITY]],
                    correlation: Mat::from_fn(1, 1, |_, _| 1.0),
                    regression: None,
                    spatial_share: None,
                    spatial_range: None,
                    predicted_theta: None,
                    latent_responses: None,
                    adaptation: Vec::new(),
                }
            })
            .collect();
        IfaPosteriorSamples {
            draws,
            diagnostics: IfaSamplerDiagnostics::default(),
        }
    }

    #[test]
    fn autocorrelation_is_zero_for_invalid_lag() {
        let values = [1.0, 2.0, 3.0];
        assert!(autocorrelation(&values, 3).abs() < f64::EPSILON);
        assert!(autocorrelation(&[2.0, 2.0, 2.0], 1).abs() < f64::EPSILON);
    }

    #[test]
    fn ess_bounded_by_chain_length() {
        let values = [1.0, 1.5, 2.0, 2.5, 3.0];
        let ess = effective_sample_size(&values);
        assert!(ess <= 5.0);
        assert!(ess > 0.0);

        let alternating: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((effective_sample_size(&alternating) - 100.0).abs() < 1e-12);
    }

    #[test]
    fn agreeing_chains_have_unit_rhat() {
        let summary =
            summarize_multi_chain_convergence(&[chain(0.0, 20), chain(0.0, 21)]).expect("valid");
        assert_eq!(summary.chain_count, 2);
        assert_eq!(summary.draws_per_chain_used, 20);
        assert!(summary.correlation_split_rhat.is_empty());
        assert!((summary.difficulty_split_rhat[0] - 1.0).abs() < 0.05);
    }

    #[test]
    fn separated_chains_have_large_rhat() {
        let summary =
            summarize_multi_chain_convergence(&[chain(0.0, 20), chain(5.0, 20)]).expect("valid");
        assert!(summary.difficulty_split_rhat[0] > 2.0);
        assert!(summary.max_split_rhat.is_some_and(|value| value > 2.0));
    }

    #[test]
    fn convergence_requires_two_chains() {
        assert!(matches!(
            summarize_multi_chain_convergence(&[chain(0.0, 10)]),
            Err(IfaError::InvalidChainCount { .. })
        ));
        assert!(matches!(
            summarize_multi_chain_convergence(&[chain(0.0, 3), chain(0.0, 3)]),
            Err(IfaError::InsufficientChainDraws { .. })
        ));
    }
}
