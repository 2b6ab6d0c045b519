//! Guidance selector: picks the prompt family for a tick.
//!
//! Priority (first match wins):
//!   every 10th tick        -> general
//!   level >= 0.90          -> transcendence
//!   level >= 0.85          -> amplification
//!   innovations < 3        -> innovation_boost
//!   otherwise              -> optimization

use crate::types::Category;

/// Every n-th tick is forced to `general`.
pub const GENERAL_EVERY: u64 = 10;

pub const TRANSCENDENCE_LEVEL: f64 = 0.90;
pub const AMPLIFICATION_LEVEL: f64 = 0.85;

/// Below this many breakthroughs the loop keeps pushing for novelty.
pub const INNOVATION_TARGET: u64 = 3;

/// Selector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub category: Category,
    pub hint: Option<&'static str>,
}

/// Choose a category from the current level, breakthrough counter and tick index.
pub fn select(level: f64, innovations: u64, tick: u64) -> Selection {
    let category = if tick > 0 && tick % GENERAL_EVERY == 0 {
        Category::General
    } else if level >= TRANSCENDENCE_LEVEL {
        Category::Transcendence
    } else if level >= AMPLIFICATION_LEVEL {
        Category::Amplification
    } else if innovations < INNOVATION_TARGET {
        Category::InnovationBoost
    } else {
        Category::Optimization
    };

    Selection {
        category,
        hint: hint_for(category, tick),
    }
}

/// Sub-hint by tick parity. Hints match the template bank's sub-list keywords.
pub fn hint_for(category: Category, tick: u64) -> Option<&'static str> {
    let pair = match category {
        Category::Transcendence => ["synthesis", "horizon"],
        Category::Amplification => ["compound", "reinforce"],
        Category::InnovationBoost => ["divergent", "remix"],
        Category::Optimization => ["efficiency", "quality"],
        Category::General => return None,
    };
    Some(pair[(tick % 2) as usize])
}
