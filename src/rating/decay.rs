//! Uncertainty growth between rating periods

use crate::types::Rating;

/// `min(max_phi, sqrt(phi^2 + periods * rate))`
pub fn decayed_phi(phi: f64, periods: i64, rate: f64, max_phi: f64) -> f64 {
    if periods <= 0 {
        return phi.min(max_phi);
    }
    (phi * phi + periods as f64 * rate).sqrt().min(max_phi)
}

/// Apply `periods` rating periods of inactivity to a rating
pub fn decay_rating(rating: &Rating, periods: i64, rate: f64, max_phi: f64) -> Rating {
    Rating {
        phi: decayed_phi(rating.phi, periods, rate, max_phi),
        ..*rating
    }
}
