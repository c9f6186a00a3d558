//! Rank tier configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A named tier and the badge (role) that marks it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankTierSettings {
    pub name: String,
    #[serde(default)]
    pub role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RanksSettings {
    /// Ascending mu boundaries between consecutive tiers
    pub thresholds: Vec<f64>,
    /// One more tier than thresholds, lowest first
    pub tiers: Vec<RankTierSettings>,
    /// First-to-N goal per tier, same length as tiers
    pub goals: Vec<u32>,
    /// Players with phi at or above this are still in placements
    pub placement_phi: f64,
    pub placement_role_id: Option<String>,
}

impl Default for RanksSettings {
    fn default() -> Self {
        let tiers = ["Bronze", "Silver", "Gold", "Platinum", "Diamond", "Legend"]
            .into_iter()
            .map(|name| RankTierSettings {
                name: name.to_string(),
                role_id: None,
            })
            .collect();
        Self {
            thresholds: vec![500.0, 1000.0, 1500.0, 2000.0, 2500.0],
            tiers,
            goals: vec![5, 7, 9, 11, 13, 15],
            placement_phi: 150.0,
            placement_role_id: None,
        }
    }
}

impl RanksSettings {
    pub fn validate(&self) -> Result<()> {
        if self.tiers.len() != self.thresholds.len() + 1 {
            return Err(anyhow!(
                "Expected {} rank tiers for {} thresholds, got {}",
                self.thresholds.len() + 1,
                self.thresholds.len(),
                self.tiers.len()
            ));
        }
        if self.goals.len() != self.tiers.len() {
            return Err(anyhow!(
                "Expected one match goal per rank tier ({}), got {}",
                self.tiers.len(),
                self.goals.len()
            ));
        }
        if self.thresholds.windows(2).any(|pair| !(pair[0] < pair[1])) {
            return Err(anyhow!("Rank thresholds must be strictly ascending"));
        }
        if self.goals.iter().any(|goal| *goal == 0) {
            return Err(anyhow!("Match goals must be greater than 0"));
        }
        if !(self.placement_phi > 0.0) {
            return Err(anyhow!("Placement phi must be positive"));
        }
        Ok(())
    }
}
