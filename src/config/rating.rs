//! Rating system configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::Rating;

/// Glicko-2 parameters and rating bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingSettings {
    /// Rating assigned to newly registered players
    pub initial_mu: f64,
    pub initial_phi: f64,
    pub initial_sigma: f64,
    /// Upper bound on phi after any update or decay
    pub max_phi: f64,
    /// System constant constraining volatility change
    pub tau: f64,
    /// Convergence tolerance of the volatility iteration
    pub convergence_tolerance: f64,
}

impl Default for RatingSettings {
    fn default() -> Self {
        Self {
            initial_mu: 1500.0,
            initial_phi: 350.0,
            initial_sigma: 0.06,
            max_phi: 350.0,
            tau: 0.5,
            convergence_tolerance: 0.000_001,
        }
    }
}

impl RatingSettings {
    pub fn initial_rating(&self) -> Rating {
        Rating::new(self.initial_mu, self.initial_phi, self.initial_sigma)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.initial_rating().is_finite() {
            return Err(anyhow!("Initial rating must be finite"));
        }
        if !(self.max_phi > 0.0) {
            return Err(anyhow!("Max phi must be positive"));
        }
        if self.initial_phi <= 0.0 || self.initial_phi > self.max_phi {
            return Err(anyhow!(
                "Initial phi must be in (0, {}], got {}",
                self.max_phi,
                self.initial_phi
            ));
        }
        if self.initial_sigma <= 0.0 {
            return Err(anyhow!("Initial sigma must be positive"));
        }
        if !(self.tau > 0.0) {
            return Err(anyhow!("Glicko-2 tau must be positive"));
        }
        if !(self.convergence_tolerance > 0.0) {
            return Err(anyhow!("Convergence tolerance must be positive"));
        }
        Ok(())
    }
}
