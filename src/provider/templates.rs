//! Local template bank: category -> templates, with keyword sub-lists.
//!
//! The bank can be replaced by a YAML file of the form:
//!
//! ```yaml
//! general:
//!   templates:
//!     - "Reviewing the last {tick} ticks at level {level}."
//!   subcategories:
//!     - keywords: [efficiency, latency]
//!       templates:
//!         - "Trim the slowest stage first."
//! ```

use crate::agent::sampler::Sampler;
use crate::error::{LoopError, LoopResult};
use crate::types::Category;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Templates for one category.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateFamily {
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub subcategories: Vec<SubFamily>,
}

/// Templates preferred when the prompt mentions any keyword.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubFamily {
    pub keywords: Vec<String>,
    pub templates: Vec<String>,
}

/// Values substituted into `{level}` and `{tick}` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars {
    pub level: f64,
    pub tick: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateBank {
    families: BTreeMap<Category, TemplateFamily>,
}

impl TemplateBank {
    pub fn new(families: BTreeMap<Category, TemplateFamily>) -> Self {
        Self { families }
    }

    /// Load a bank from YAML. Category keys must be known category names.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template bank {}", path.display()))?;
        let bank = Self::from_yaml(&contents)?;
        info!("Loaded template bank from {}", path.display());
        Ok(bank)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<String, TemplateFamily> =
            serde_yaml::from_str(contents).context("Failed to parse template bank YAML")?;
        let mut families = BTreeMap::new();
        for (name, family) in raw {
            let category = Category::from_name(&name)
                .with_context(|| format!("Unknown template category '{name}'"))?;
            families.insert(category, family);
        }
        Ok(Self { families })
    }

    /// Pick a template for `category`, preferring the first sub-list whose
    /// keywords appear in `prompt`. Unknown categories use `general`.
    pub fn pick(
        &self,
        category: Category,
        prompt: &str,
        vars: TemplateVars,
        sampler: &mut dyn Sampler,
    ) -> LoopResult<String> {
        let family = self
            .families
            .get(&category)
            .or_else(|| self.families.get(&Category::General))
            .ok_or_else(|| LoopError::NoFallbackAvailable {
                category: category.to_string(),
            })?;

        let lower = prompt.to_lowercase();
        let list = family
            .subcategories
            .iter()
            .find(|sub| {
                !sub.templates.is_empty()
                    && sub
                        .keywords
                        .iter()
                        .any(|k| lower.contains(&k.to_lowercase()))
            })
            .map(|sub| &sub.templates)
            .unwrap_or(&family.templates);

        if list.is_empty() {
            return Err(LoopError::NoFallbackAvailable {
                category: category.to_string(),
            });
        }

        let template = &list[sampler.index(list.len())];
        debug!("Template pick for {}: {} candidates", category, list.len());
        Ok(render(template, vars))
    }
}

fn render(template: &str, vars: TemplateVars) -> String {
    template
        .replace("{level}", &format!("{:.3}", vars.level))
        .replace("{tick}", &vars.tick.to_string())
}

fn family(templates: &[&str], subs: &[(&[&str], &[&str])]) -> TemplateFamily {
    TemplateFamily {
        templates: templates.iter().map(|s| s.to_string()).collect(),
        subcategories: subs
            .iter()
            .map(|(keywords, templates)| SubFamily {
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                templates: templates.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
    }
}

impl TemplateBank {
    /// Small built-in catalogue used when no templates file is configured.
    pub fn builtin() -> Self {
        let mut families = BTreeMap::new();
        families.insert(
            Category::Transcendence,
            family(
                &[
                    "Level {level}: step back and name the pattern behind the last {tick} ticks.",
                    "Merge the strongest recent ideas into one long-horizon theme.",
                ],
                &[
                    (&["synthesis"], &["Synthesise the recurring threads into a single principle."]),
                    (&["horizon"], &["Project the current trajectory ten evolutions ahead."]),
                ],
            ),
        );
        families.insert(
            Category::Amplification,
            family(
                &[
                    "Double down on what produced the last breakthrough.",
                    "Level {level}: amplify the highest-impact habit from recent tasks.",
                ],
                &[
                    (&["compound"], &["Stack the two best recent results into one artifact."]),
                    (&["reinforce"], &["Repeat the most reliable task pattern with a twist."]),
                ],
            ),
        );
        families.insert(
            Category::InnovationBoost,
            family(
                &[
                    "Try an approach not used in any of the last {tick} ticks.",
                    "Combine two unrelated recent thoughts into a new proposal.",
                ],
                &[
                    (&["divergent"], &["List three unusual angles and pursue the oddest."]),
                    (&["remix"], &["Remix an earlier artifact under a new constraint."]),
                ],
            ),
        );
        families.insert(
            Category::Optimization,
            family(
                &[
                    "Trim one unnecessary step from the current routine.",
                    "Level {level}: tighten the loop around the slowest stage.",
                ],
                &[
                    (&["efficiency"], &["Measure, then remove the most expensive stage."]),
                    (&["quality"], &["Raise the floor: rework the weakest recent task."]),
                ],
            ),
        );
        families.insert(
            Category::General,
            family(
                &[
                    "Tick {tick}: note what changed since the last reflection.",
                    "Review recent output and pick one thing to keep doing.",
                    "Summarise current state at level {level} in one sentence.",
                ],
                &[],
            ),
        );
        Self { families }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sampler::FixedSampler;

    fn vars() -> TemplateVars {
        TemplateVars {
            level: 0.85,
            tick: 3,
        }
    }

    #[test]
    fn keyword_restricts_to_sub_list() {
        let bank = TemplateBank::builtin();
        let mut s = FixedSampler::at(0.0);
        let text = bank
            .pick(Category::Optimization, "focus: EFFICIENCY please", vars(), &mut s)
            .unwrap();
        assert_eq!(text, "Measure, then remove the most expensive stage.");
    }

    #[test]
    fn placeholders_are_rendered() {
        let bank = TemplateBank::builtin();
        let mut s = FixedSampler::at(0.0);
        let text = bank
            .pick(Category::General, "anything", vars(), &mut s)
            .unwrap();
        assert_eq!(text, "Tick 3: note what changed since the last reflection.");
    }

    #[test]
    fn missing_category_falls_back_to_general() {
        let bank = TemplateBank::from_yaml("general:\n  templates: [\"only\"]\n").unwrap();
        let mut s = FixedSampler::at(0.0);
        let text = bank
            .pick(Category::Transcendence, "x", vars(), &mut s)
            .unwrap();
        assert_eq!(text, "only");
    }

    #[test]
    fn empty_list_is_no_fallback_available() {
        let bank = TemplateBank::from_yaml("general:\n  templates: []\n").unwrap();
        let mut s = FixedSampler::at(0.0);
        let err = bank
            .pick(Category::General, "x", vars(), &mut s)
            .unwrap_err();
        assert!(matches!(err, LoopError::NoFallbackAvailable { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unknown_yaml_category_is_rejected() {
        assert!(TemplateBank::from_yaml("mentoring:\n  templates: [a]\n").is_err());
    }
}
