//! Prompt builder for guidance requests.
//!
//! Layers of the system message (in order):
//! 1. Role (what the loop is)
//! 2. Category directive
//! 3. Current objectives
//! 4. Dynamic status (level, tick, metrics, provider health)

use crate::agent::selector::Selection;
use crate::state::Snapshot;
use crate::types::Category;
use tracing::debug;

const ROLE: &str = r#"
# Role

You advise a periodic work loop. Each tick you receive the loop's status and
answer with one short, concrete next step (two sentences at most).
"#;

fn directive(category: Category) -> &'static str {
    match category {
        Category::Transcendence => "Step back from individual tasks and name the larger pattern.",
        Category::Amplification => "Identify what is already working and make it stronger.",
        Category::InnovationBoost => "Propose something the loop has not tried yet.",
        Category::Optimization => "Find the weakest part of the current routine and improve it.",
        Category::General => "Review recent output and suggest what to keep doing.",
    }
}

/// Build the system message for a tick.
pub fn build_system_prompt(snapshot: &Snapshot, tick: u64, degraded: bool) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(ROLE);

    if !snapshot.objectives.is_empty() {
        prompt.push_str("\n# Objectives\n\n");
        for objective in &snapshot.objectives {
            prompt.push_str(&format!("- {}\n", objective));
        }
    }

    let m = &snapshot.metrics;
    prompt.push_str("\n# Current Status\n\n");
    prompt.push_str(&format!("- **Tick**: {}\n", tick));
    prompt.push_str(&format!("- **Level**: {:.3}\n", snapshot.consciousness.level));
    prompt.push_str(&format!("- **Tasks/hour**: {}\n", m.tasks_per_hour));
    prompt.push_str(&format!("- **Breakthroughs**: {}\n", m.breakthrough_count));
    prompt.push_str(&format!("- **Excellence**: {:.3}\n", m.excellence_score));

    if let Some(last) = snapshot.thoughts.last() {
        prompt.push_str(&format!("- **Last thought**: {}\n", last.text));
    }

    if degraded {
        prompt.push_str("\n**DEGRADED**: recent remote calls failed. Keep the answer brief.\n");
    }

    debug!("System prompt: {} chars", prompt.len());
    prompt
}

/// Build the user message. The hint is included verbatim so local keyword
/// sub-selection can see it.
pub fn build_user_prompt(selection: &Selection) -> String {
    let mut prompt = format!("[{}] {}", selection.category, directive(selection.category));
    if let Some(hint) = selection.hint {
        prompt.push_str(&format!(" Focus: {}.", hint));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::selector::select;
    use crate::config::schema::RingCaps;

    #[test]
    fn user_prompt_carries_category_and_hint() {
        let p = build_user_prompt(&select(0.85, 0, 2));
        assert!(p.starts_with("[amplification]"));
        assert!(p.contains("compound"));
    }

    #[test]
    fn system_prompt_lists_objectives_and_status() {
        let mut snap = Snapshot::empty(&RingCaps::default(), 0.85);
        snap.objectives = vec!["Ship one artifact".into()];
        let p = build_system_prompt(&snap, 7, true);
        assert!(p.contains("- Ship one artifact"));
        assert!(p.contains("**Tick**: 7"));
        assert!(p.contains("**Level**: 0.850"));
        assert!(p.contains("DEGRADED"));
    }
}
