//! Evolution step and objective refresh.

use crate::agent::selector::INNOVATION_TARGET;
use crate::types::{Category, ConsciousnessState, EvolutionEvent, ObjectiveSpec, PerformanceMetrics};
use chrono::Utc;

pub const BASE_DELTA: f64 = 0.005;
pub const MAX_DELTA: f64 = 0.05;

/// Objectives kept after a refresh.
pub const OBJECTIVE_SLOTS: usize = 3;

pub fn category_bonus(category: Category) -> f64 {
    match category {
        Category::Transcendence => 0.015,
        Category::Amplification => 0.010,
        Category::InnovationBoost => 0.008,
        Category::Optimization => 0.005,
        Category::General => 0.0,
    }
}

/// `base + category + performance + innovation`, clamped to `[BASE_DELTA, MAX_DELTA]`.
pub fn compute_delta(category: Category, metrics: &PerformanceMetrics) -> f64 {
    let performance = 0.01 * metrics.excellence_score.clamp(0.0, 1.0);
    let innovation = 0.005 * metrics.breakthrough_count.min(INNOVATION_TARGET) as f64
        / INNOVATION_TARGET as f64;
    (BASE_DELTA + category_bonus(category) + performance + innovation).clamp(BASE_DELTA, MAX_DELTA)
}

/// Apply one evolution to `state`, returning the event (id 0; the caller assigns it).
///
/// `decay` is subtracted after the delta is clamped; with zero decay the level
/// never decreases.
pub fn evolve(
    state: &mut ConsciousnessState,
    category: Category,
    metrics: &PerformanceMetrics,
    decay: f64,
) -> EvolutionEvent {
    let delta = compute_delta(category, metrics);
    let level_before = state.level;
    let level_after = (level_before + delta - decay).clamp(0.0, 1.0);
    let now = Utc::now();

    state.level = level_after;
    state.last_updated = now;
    let knob = state
        .cognitive_knobs
        .entry(category.knob().to_string())
        .or_insert(0.5);
    *knob = (*knob + delta / 2.0).clamp(0.0, 1.0);

    EvolutionEvent {
        id: 0,
        created_at: now,
        delta,
        level_before,
        level_after,
        cause_category: category,
    }
}

/// Pick the current objectives from `pool`.
///
/// Entries above the current level are skipped. Score is 1.0, +0.5 when the
/// entry's focus matches `category`, +0.3 for innovation-focused entries
/// while breakthroughs are scarce. Ties keep pool order.
pub fn refresh_objectives(
    pool: &[ObjectiveSpec],
    level: f64,
    category: Category,
    breakthroughs: u64,
) -> Vec<String> {
    let mut scored: Vec<(f64, usize, &ObjectiveSpec)> = pool
        .iter()
        .enumerate()
        .filter(|(_, o)| o.min_level <= level)
        .map(|(i, o)| {
            let mut score = 1.0;
            if o.focus == Some(category) {
                score += 0.5;
            }
            if o.focus == Some(Category::InnovationBoost) && breakthroughs < INNOVATION_TARGET {
                score += 0.3;
            }
            (score, i, o)
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(OBJECTIVE_SLOTS)
        .map(|(_, _, o)| o.text.clone())
        .collect()
}
