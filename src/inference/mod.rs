//! Reusable inference and MCMC utility types.

use thiserror::Error;

use crate::utils::usize_to_f64;

pub mod adaptive;

pub use adaptive::{AdaptationConfig, AdaptiveProposal, ProposalOutcome};

/// Errors for generic MCMC configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum InferenceError {
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("burn-in ({burn_in}) must be smaller than iterations ({iterations})")]
    InvalidBurnIn { burn_in: usize, iterations: usize },
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("adaptation step constant must be positive and finite; found {0}")]
    InvalidStepConstant(f64),
    #[error("adaptation decay exponent must lie in (0, 1]; found {0}")]
    InvalidDecayExponent(f64),
    #[error("target acceptance rate must lie in (0, 1); found {0}")]
    InvalidTargetAcceptance(f64),
}

/// Generic MCMC schedule.
///
/// No draws are discarded unless `burn_in` is set explicitly.
#[derive(Debug, Clone, Copy)]
pub struct McmcConfig {
    pub iterations: usize,
    pub burn_in: usize,
    pub thin: usize,
    pub seed: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            iterations: 2_000,
            burn_in: 0,
            thin: 1,
            seed: 42,
        }
    }
}

impl McmcConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub const fn validate(self) -> Result<(), InferenceError> {
        if self.iterations == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.burn_in >= self.iterations {
            return Err(InferenceError::InvalidBurnIn {
                burn_in: self.burn_in,
                iterations: self.iterations,
            });
        }
        if self.thin == 0 {
            return Err(InferenceError::InvalidThinning);
        }
        Ok(())
    }

    /// Number of retained draws implied by this configuration.
    #[must_use]
    pub const fn retained_draws(self) -> usize {
        (self.iterations - self.burn_in) / self.thin
    }

    /// Whether the 1-based `iteration` lands on a recording boundary.
    #[must_use]
    pub const fn records(self, iteration: usize) -> bool {
        iteration > self.burn_in && (iteration - self.burn_in).is_multiple_of(self.thin)
    }
}

/// Proposal counters for a single Metropolis-Hastings block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}
