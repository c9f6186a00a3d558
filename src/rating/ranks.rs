//! Rank tiers, match goals and badge changes

use chrono::{DateTime, Utc};

use crate::config::RanksSettings;
use crate::types::{PlayerId, RankChanged, Rating};

/// Position of a player on the rank ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// Uncertainty is still too high to place the player
    Placement,
    /// Index into the configured tiers, lowest first
    Tier(usize),
}

#[derive(Debug, Clone)]
pub struct RankTable {
    settings: RanksSettings,
}

impl RankTable {
    pub fn new(settings: RanksSettings) -> Self {
        Self { settings }
    }

    /// Number of thresholds at or below `mu`
    pub fn tier_index(&self, mu: f64) -> usize {
        self.settings
            .thresholds
            .partition_point(|threshold| *threshold <= mu)
    }

    pub fn rank_of(&self, rating: &Rating) -> Rank {
        if rating.phi >= self.settings.placement_phi {
            Rank::Placement
        } else {
            Rank::Tier(self.tier_index(rating.mu))
        }
    }

    /// True when a rating is settled enough for the leaderboard
    pub fn is_placed(&self, rating: &Rating) -> bool {
        rating.phi < self.settings.placement_phi
    }

    pub fn name(&self, rank: Rank) -> &str {
        match rank {
            Rank::Placement => "Placements",
            Rank::Tier(index) => self
                .settings
                .tiers
                .get(index)
                .map(|tier| tier.name.as_str())
                .unwrap_or("Unknown"),
        }
    }

    pub fn role_id(&self, rank: Rank) -> Option<&str> {
        match rank {
            Rank::Placement => self.settings.placement_role_id.as_deref(),
            Rank::Tier(index) => self
                .settings
                .tiers
                .get(index)
                .and_then(|tier| tier.role_id.as_deref()),
        }
    }

    /// First-to-N goal for a match, from the tiers of both players' mu
    pub fn match_goal(&self, first: &Rating, second: &Rating) -> u32 {
        let combined = self.tier_index(first.mu) + self.tier_index(second.mu);
        let index = ((combined + 1) >> 1).min(self.settings.goals.len().saturating_sub(1));
        self.settings.goals.get(index).copied().unwrap_or(1)
    }

    /// Human readable description of a rank transition, `None` when unchanged
    pub fn describe_change(&self, old: Rank, new: Rank) -> Option<String> {
        match (old, new) {
            _ if old == new => None,
            (Rank::Placement, Rank::Tier(_)) => Some(format!("Placed into {}", self.name(new))),
            (Rank::Tier(_), Rank::Placement) => Some("Rank lost, back to placement".to_string()),
            (Rank::Tier(before), Rank::Tier(after)) if after > before => {
                Some(format!("Promoted to {}", self.name(new)))
            }
            _ => Some(format!("Demoted to {}", self.name(new))),
        }
    }

    /// Badge update event for a rating change that crossed a rank boundary
    pub fn rank_change(
        &self,
        player_id: &PlayerId,
        old_rating: &Rating,
        new_rating: &Rating,
        timestamp: DateTime<Utc>,
    ) -> Option<RankChanged> {
        let old = self.rank_of(old_rating);
        let new = self.rank_of(new_rating);
        let description = self.describe_change(old, new)?;

        Some(RankChanged {
            player_id: player_id.clone(),
            old_rank: self.name(old).to_string(),
            new_rank: self.name(new).to_string(),
            old_role_id: self.role_id(old).map(str::to_string),
            new_role_id: self.role_id(new).map(str::to_string),
            description,
            timestamp,
        })
    }
}

impl Default for RankTable {
    fn default() -> Self {
        Self::new(RanksSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(mu: f64) -> Rating {
        Rating::new(mu, 60.0, 0.06)
    }

    #[test]
    fn test_tier_boundaries() {
        let table = RankTable::default();
        assert_eq!(table.tier_index(0.0), 0);
        assert_eq!(table.tier_index(499.9), 0);
        assert_eq!(table.tier_index(500.0), 1);
        assert_eq!(table.tier_index(1500.0), 3);
        assert_eq!(table.tier_index(9000.0), 5);
        assert_eq!(table.name(table.rank_of(&placed(1700.0))), "Platinum");
    }

    #[test]
    fn test_high_uncertainty_is_placement() {
        let table = RankTable::default();
        assert_eq!(table.rank_of(&Rating::new(2600.0, 150.0, 0.06)), Rank::Placement);
        assert_eq!(table.rank_of(&Rating::new(2600.0, 149.0, 0.06)), Rank::Tier(5));
    }

    #[test]
    fn test_match_goal_rounds_up_between_tiers() {
        let table = RankTable::default();
        // Bronze vs Bronze
        assert_eq!(table.match_goal(&placed(100.0), &placed(200.0)), 5);
        // Bronze (0) vs Silver (1) rounds up to Silver's goal
        assert_eq!(table.match_goal(&placed(100.0), &placed(700.0)), 7);
        // Legend vs Legend
        assert_eq!(table.match_goal(&placed(3000.0), &placed(2800.0)), 15);
        // Fresh players: mu 1500 is Platinum regardless of phi
        assert_eq!(table.match_goal(&Rating::default(), &Rating::default()), 11);
    }

    #[test]
    fn test_describe_change() {
        let table = RankTable::default();
        assert_eq!(table.describe_change(Rank::Tier(2), Rank::Tier(2)), None);
        assert_eq!(
            table.describe_change(Rank::Placement, Rank::Tier(2)).unwrap(),
            "Placed into Gold"
        );
        assert_eq!(
            table.describe_change(Rank::Tier(2), Rank::Placement).unwrap(),
            "Rank lost, back to placement"
        );
        assert_eq!(
            table.describe_change(Rank::Tier(2), Rank::Tier(3)).unwrap(),
            "Promoted to Platinum"
        );
        assert_eq!(
            table.describe_change(Rank::Tier(3), Rank::Tier(1)).unwrap(),
            "Demoted to Silver"
        );
    }

    #[test]
    fn test_rank_change_event_carries_roles() {
        let mut settings = RanksSettings::default();
        settings.tiers[2].role_id = Some("role-gold".to_string());
        settings.tiers[3].role_id = Some("role-platinum".to_string());
        let table = RankTable::new(settings);

        let event = table
            .rank_change(
                &"alice".to_string(),
                &placed(1490.0),
                &placed(1510.0),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(event.old_role_id.as_deref(), Some("role-gold"));
        assert_eq!(event.new_role_id.as_deref(), Some("role-platinum"));
        assert_eq!(event.description, "Promoted to Platinum");

        assert!(table
            .rank_change(&"bob".to_string(), &placed(1510.0), &placed(1520.0), Utc::now())
            .is_none());
    }
}
