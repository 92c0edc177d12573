//! Scoring and categorization. Pure functions, no I/O.

use serde::{Deserialize, Serialize};

use super::model::{CategoryBand, ScoringRule};

/// Score and category for a completed answer vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub total_score: u32,
    pub category: String,
    pub interpretation: String,
}

/// Reduce an answer vector to a total score. Saturates at `u32::MAX`.
pub fn total_score(rule: ScoringRule, answers: &[u32]) -> u32 {
    match rule {
        ScoringRule::Sum => answers.iter().fold(0u32, |acc, a| acc.saturating_add(*a)),
    }
}

/// First band (in ascending order) whose bound covers `total`.
pub fn categorize(bands: &[CategoryBand], total: u32) -> Option<&CategoryBand> {
    bands.iter().find(|band| band.contains(total))
}

pub(crate) fn assess(rule: ScoringRule, bands: &[CategoryBand], answers: &[u32]) -> Assessment {
    let total = total_score(rule, answers);
    match categorize(bands, total) {
        Some(band) => Assessment {
            total_score: total,
            category: band.label.clone(),
            interpretation: band.interpretation.clone(),
        },
        // Unreachable for registry-validated band tables.
        None => Assessment {
            total_score: total,
            category: "uncategorized".to_string(),
            interpretation: String::new(),
        },
    }
}
