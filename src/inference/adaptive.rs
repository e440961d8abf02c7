//! Adaptive random-walk Metropolis with diminishing Robbins–Monro adaptation.
//!
//! The proposal for a block of unconstrained parameters is
//! `N(params, exp(logscale) * params_cov)`. After every step, accepted or not,
//! the log-scale moves toward the target acceptance rate and the running
//! mean/covariance absorb the current point, all with step size
//! `gamma_t = min(1, C / t^alpha)`. Because `gamma_t <= 1`, the covariance
//! update is a convex combination of positive semi-definite matrices and stays
//! positive semi-definite.

use faer::Mat;
use rand::RngExt;
use rand::rngs::StdRng;

use super::{InferenceError, ProposalStats};
use crate::utils::{cholesky_lower, identity_matrix, sample_standard_normal, usize_to_f64};

/// Robbins–Monro constants shared by all adaptive blocks.
#[derive(Debug, Clone, Copy)]
pub struct AdaptationConfig {
    /// Step-size constant `C`.
    pub step_constant: f64,
    /// Decay exponent `alpha` of the step size.
    pub decay_exponent: f64,
    /// Target acceptance rate.
    pub target: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            step_constant: 0.7,
            decay_exponent: 0.8,
            target: 0.234,
        }
    }
}

impl AdaptationConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if a constant is outside its admissible range.
    pub fn validate(self) -> Result<(), InferenceError> {
        if !(self.step_constant.is_finite() && self.step_constant > 0.0) {
            return Err(InferenceError::InvalidStepConstant(self.step_constant));
        }
        if !(self.decay_exponent > 0.0 && self.decay_exponent <= 1.0) {
            return Err(InferenceError::InvalidDecayExponent(self.decay_exponent));
        }
        if !(self.target > 0.0 && self.target < 1.0) {
            return Err(InferenceError::InvalidTargetAcceptance(self.target));
        }
        Ok(())
    }

    /// Step size for the `step`-th (1-based) adaptation.
    #[must_use]
    pub fn step_size(self, step: usize) -> f64 {
        (self.step_constant / usize_to_f64(step.max(1)).powf(self.decay_exponent)).min(1.0)
    }
}

/// Result of one adaptive Metropolis step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalOutcome {
    pub accepted: bool,
    /// Metropolis acceptance probability of the candidate (zero if invalid).
    pub acceptance_probability: f64,
    /// Candidate was outside the support (e.g. not positive definite).
    pub invalid_candidate: bool,
    /// Proposal fell back to a scaled identity covariance.
    pub used_fallback: bool,
}

/// Adaptive proposal state for one parameter block.
#[derive(Debug, Clone)]
pub struct AdaptiveProposal {
    params: Vec<f64>,
    params_mean: Vec<f64>,
    params_cov: Mat<f64>,
    logscale: f64,
    adaptations: usize,
    stats: ProposalStats,
    invalid_candidates: usize,
    covariance_fallbacks: usize,
}

impl AdaptiveProposal {
    /// Start at `initial` with proposal covariance `scale * initial_cov`.
    #[must_use]
    pub fn new(initial: Vec<f64>, initial_cov: Mat<f64>, scale: f64) -> Self {
        Self {
            params_mean: initial.clone(),
            params: initial,
            params_cov: initial_cov,
            logscale: scale.ln(),
            adaptations: 0,
            stats: ProposalStats::default(),
            invalid_candidates: 0,
            covariance_fallbacks: 0,
        }
    }

    /// Start at `initial` with an identity covariance.
    #[must_use]
    pub fn with_identity(initial: Vec<f64>, scale: f64) -> Self {
        let dim = initial.len();
        Self::new(initial, identity_matrix(dim), scale)
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    #[must_use]
    pub fn params_mean(&self) -> &[f64] {
        &self.params_mean
    }

    #[must_use]
    pub const fn params_cov(&self) -> &Mat<f64> {
        &self.params_cov
    }

    #[must_use]
    pub const fn logscale(&self) -> f64 {
        self.logscale
    }

    #[must_use]
    pub const fn stats(&self) -> ProposalStats {
        self.stats
    }

    #[must_use]
    pub const fn invalid_candidates(&self) -> usize {
        self.invalid_candidates
    }

    #[must_use]
    pub const fn covariance_fallbacks(&self) -> usize {
        self.covariance_fallbacks
    }

    /// Draw a candidate around the current point.
    ///
    /// Returns the candidate and whether the scaled-identity fallback was used.
    pub fn propose(&self, rng: &mut StdRng) -> (Vec<f64>, bool) {
        let dim = self.dim();
        let spread = (0.5 * self.logscale).exp();
        let noise: Vec<f64> = (0..dim).map(|_| sample_standard_normal(rng)).collect();

        let (factor, used_fallback) = match cholesky_lower(&self.params_cov) {
            Ok(lower) => (lower, false),
            Err(_) => (identity_matrix(dim), true),
        };

        let candidate = (0..dim)
            .map(|row| {
                let shift = (0..=row)
                    .map(|col| factor[(row, col)] * noise[col])
                    .sum::<f64>();
                spread.mul_add(shift, self.params[row])
            })
            .collect();
        (candidate, used_fallback)
    }

    /// One Metropolis step followed by one adaptation.
    ///
    /// `current_log_target` is the log target at the current point under the
    /// rest of the current state; `log_target` evaluates a candidate and
    /// returns `None` when the candidate lies outside the support, which is
    /// treated as a zero acceptance probability.
    pub fn step<F>(
        &mut self,
        rng: &mut StdRng,
        config: AdaptationConfig,
        current_log_target: f64,
        log_target: F,
    ) -> ProposalOutcome
    where
        F: FnOnce(&[f64]) -> Option<f64>,
    {
        let (candidate, used_fallback) = self.propose(rng);
        if used_fallback {
            self.covariance_fallbacks += 1;
            if self.covariance_fallbacks == 1 {
                log::warn!(
                    "adaptive covariance of a {}-dimensional block is singular; using scaled identity",
                    self.dim()
                );
            }
        }

        let candidate_log_target = log_target(&candidate).filter(|value| !value.is_nan());
        let invalid_candidate = candidate_log_target.is_none();
        let acceptance_probability = candidate_log_target.map_or(0.0, |candidate_value| {
            let log_ratio = candidate_value - current_log_target;
            if log_ratio >= 0.0 || current_log_target == f64::NEG_INFINITY {
                1.0
            } else {
                log_ratio.exp()
            }
        });
        let accepted = acceptance_probability > 0.0
            && (acceptance_probability >= 1.0 || rng.random::<f64>() < acceptance_probability);

        if invalid_candidate {
            self.invalid_candidates += 1;
        }
        if accepted {
            self.params = candidate;
        }
        self.stats.record(accepted);
        self.adapt(config, acceptance_probability);

        ProposalOutcome {
            accepted,
            acceptance_probability,
            invalid_candidate,
            used_fallback,
        }
    }

    fn adapt(&mut self, config: AdaptationConfig, acceptance_probability: f64) {
        self.adaptations += 1;
        let gamma = config.step_size(self.adaptations);
        self.logscale = gamma.mul_add(acceptance_probability - config.target, self.logscale);

        let dim = self.dim();
        let centered: Vec<f64> = self
            .params
            .iter()
            .zip(&self.params_mean)
            .map(|(value, mean)| value - mean)
            .collect();
        for row in 0..dim {
            self.params_mean[row] = gamma.mul_add(centered[row], self.params_mean[row]);
            for col in 0..dim {
                let current = self.params_cov[(row, col)];
                self.params_cov[(row, col)] =
                    gamma.mul_add(centered[row] * centered[col] - current, current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn standard_normal_log_density(point: &[f64]) -> f64 {
        -0.5 * point.iter().map(|x| x * x).sum::<f64>()
    }

    #[test]
    fn config_validation_rejects_out_of_range_constants() {
        let config = AdaptationConfig {
            decay_exponent: 1.5,
            ..AdaptationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(InferenceError::InvalidDecayExponent(_))
        ));
        let config = AdaptationConfig {
            target: 1.0,
            ..AdaptationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(InferenceError::InvalidTargetAcceptance(_))
        ));
    }

    #[test]
    fn step_size_decays_and_is_capped() {
        let config = AdaptationConfig {
            step_constant: 5.0,
            decay_exponent: 0.7,
            target: 0.3,
        };
        assert!((config.step_size(1) - 1.0).abs() < f64::EPSILON);
        assert!(config.step_size(1_000) < config.step_size(100));
    }

    #[test]
    fn acceptance_rate_converges_to_target() {
        let config = AdaptationConfig {
            step_constant: 1.0,
            decay_exponent: 0.66,
            target: 0.3,
        };
        let mut proposal = AdaptiveProposal::with_identity(vec![0.5, -0.5], 0.01);
        let mut rng = StdRng::seed_from_u64(2_024);

        let mut late = ProposalStats::default();
        for iteration in 0..20_000 {
            let current = standard_normal_log_density(proposal.params());
            let outcome = proposal.step(&mut rng, config, current, |candidate| {
                Some(standard_normal_log_density(candidate))
            });
            if iteration >= 10_000 {
                late.record(outcome.accepted);
            }
        }

        assert!((late.acceptance_rate() - config.target).abs() < 0.06);
        assert!(proposal.logscale().is_finite());
    }

    #[test]
    fn running_covariance_stays_positive_semi_definite() {
        let config = AdaptationConfig::default();
        let mut proposal = AdaptiveProposal::with_identity(vec![0.0, 0.0, 0.0], 0.5);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..2_000 {
            let current = standard_normal_log_density(proposal.params());
            let _ = proposal.step(&mut rng, config, current, |candidate| {
                Some(standard_normal_log_density(candidate))
            });
        }
        let cov = proposal.params_cov();
        for idx in 0..3 {
            assert!(cov[(idx, idx)] >= 0.0);
        }
        let jittered = Mat::from_fn(3, 3, |i, j| {
            if i == j { cov[(i, j)] + 1.0e-9 } else { cov[(i, j)] }
        });
        assert!(cholesky_lower(&jittered).is_ok());
    }

    #[test]
    fn invalid_candidates_are_rejected_and_counted() {
        let config = AdaptationConfig::default();
        let mut proposal = AdaptiveProposal::with_identity(vec![1.0], 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = proposal.step(&mut rng, config, 0.0, |_| None);
        assert!(!outcome.accepted);
        assert!(outcome.invalid_candidate);
        assert!(outcome.acceptance_probability.abs() < f64::EPSILON);
        assert!((proposal.params()[0] - 1.0).abs() < f64::EPSILON);
        assert_eq!(proposal.invalid_candidates(), 1);
        assert!(proposal.logscale() < 0.0);
    }

    #[test]
    fn singular_covariance_falls_back_to_identity() {
        let config = AdaptationConfig::default();
        let mut proposal = AdaptiveProposal::new(vec![0.0, 0.0], Mat::zeros(2, 2), 1.0);
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = proposal.step(&mut rng, config, 0.0, |candidate| {
            Some(standard_normal_log_density(candidate))
        });
        assert!(outcome.used_fallback);
        assert_eq!(proposal.covariance_fallbacks(), 1);
    }
}
