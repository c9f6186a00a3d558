//! Rating provider trait and implementations
//!
//! The provider is the single source of rating updates after a match. It is a
//! pure function of the two input ratings and its fixed configuration.

use skillratings::glicko2::{glicko2, Glicko2Config};
use skillratings::Outcomes;
use std::sync::Mutex;
use tracing::debug;

use crate::config::RatingSettings;
use crate::error::{LadderError, Result};
use crate::types::Rating;

/// Computes post-match ratings for a decided 1v1 match
pub trait RatingProvider: Send + Sync {
    /// Return `(new_winner, new_loser)`. Callers pass the actual winner first.
    fn compute_outcome(&self, winner: &Rating, loser: &Rating) -> Result<(Rating, Rating)>;

    /// Rating assigned to newly registered players
    fn initial_rating(&self) -> Rating;
}

/// Glicko-2 provider backed by the skillratings crate
#[derive(Debug, Clone)]
pub struct Glicko2RatingProvider {
    config: Glicko2Config,
    initial: Rating,
    max_phi: f64,
}

impl Glicko2RatingProvider {
    pub fn new(settings: &RatingSettings) -> Result<Self> {
        settings
            .validate()
            .map_err(|error| LadderError::ConfigurationError {
                message: error.to_string(),
            })?;

        Ok(Self {
            config: Glicko2Config {
                tau: settings.tau,
                convergence_tolerance: settings.convergence_tolerance,
            },
            initial: settings.initial_rating(),
            max_phi: settings.max_phi,
        })
    }

    fn check_input(&self, role: &str, rating: &Rating) -> Result<()> {
        if !rating.is_finite() || rating.phi <= 0.0 || rating.sigma <= 0.0 {
            return Err(LadderError::RatingCalculationFailed {
                reason: format!("{} rating {:?} is not a valid Glicko-2 rating", role, rating),
            }
            .into());
        }
        Ok(())
    }

    fn finish(&self, role: &str, rating: Rating) -> Result<Rating> {
        if !rating.is_finite() {
            return Err(LadderError::RatingCalculationFailed {
                reason: format!("{} rating did not converge: {:?}", role, rating),
            }
            .into());
        }
        Ok(Rating {
            phi: rating.phi.min(self.max_phi),
            ..rating
        })
    }
}

impl Default for Glicko2RatingProvider {
    fn default() -> Self {
        Self {
            config: Glicko2Config::new(),
            initial: Rating::default(),
            max_phi: 350.0,
        }
    }
}

impl RatingProvider for Glicko2RatingProvider {
    fn compute_outcome(&self, winner: &Rating, loser: &Rating) -> Result<(Rating, Rating)> {
        self.check_input("Winner", winner)?;
        self.check_input("Loser", loser)?;

        let (new_winner, new_loser) = glicko2(
            &(*winner).into(),
            &(*loser).into(),
            &Outcomes::WIN,
            &self.config,
        );

        let new_winner = self.finish("Winner", new_winner.into())?;
        let new_loser = self.finish("Loser", new_loser.into())?;

        debug!(
            "Glicko-2 update: winner {} -> {}, loser {} -> {}",
            winner, new_winner, loser, new_loser
        );

        Ok((new_winner, new_loser))
    }

    fn initial_rating(&self) -> Rating {
        self.initial
    }
}

/// Provider for tests: shifts mu by a fixed step and records every call
#[derive(Debug, Default)]
pub struct MockRatingProvider {
    pub step: f64,
    calls: Mutex<Vec<(Rating, Rating)>>,
}

impl MockRatingProvider {
    pub fn new(step: f64) -> Self {
        Self {
            step,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every `(winner, loser)` pair seen so far
    pub fn calls(&self) -> Vec<(Rating, Rating)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

impl RatingProvider for MockRatingProvider {
    fn compute_outcome(&self, winner: &Rating, loser: &Rating) -> Result<(Rating, Rating)> {
        self.calls
            .lock()
            .map_err(|_| LadderError::InternalError {
                message: "Failed to acquire mock provider lock".to_string(),
            })?
            .push((*winner, *loser));

        Ok((
            Rating {
                mu: winner.mu + self.step,
                ..*winner
            },
            Rating {
                mu: loser.mu - self.step,
                ..*loser
            },
        ))
    }

    fn initial_rating(&self) -> Rating {
        Rating::default()
    }
}
