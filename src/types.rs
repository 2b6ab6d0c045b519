//! Shared types used across the loop runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ---------------------------------------------------------------------------
// Guidance categories
// ---------------------------------------------------------------------------

/// Prompt/template family chosen for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Transcendence,
    Amplification,
    InnovationBoost,
    Optimization,
    General,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Self::Transcendence,
        Self::Amplification,
        Self::InnovationBoost,
        Self::Optimization,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcendence => "transcendence",
            Self::Amplification => "amplification",
            Self::InnovationBoost => "innovation_boost",
            Self::Optimization => "optimization",
            Self::General => "general",
        }
    }

    /// Parse a category name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Cognitive knob nudged by evolutions caused by this category.
    pub fn knob(&self) -> &'static str {
        match self {
            Self::Transcendence | Self::General => "curiosity",
            Self::Amplification => "resilience",
            Self::InnovationBoost => "creativity",
            Self::Optimization => "focus",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Thoughts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    Reflection,
    TaskProposal,
    EvolutionNote,
}

/// Where a piece of guidance text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Remote chat-completion succeeded.
    RemoteLlm,
    /// Remote disabled or skipped by an open circuit.
    TemplateBank,
    /// Remote was attempted and failed; templates filled in.
    Fallback,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteLlm => write!(f, "remote_llm"),
            Self::TemplateBank => write!(f, "template_bank"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A text record produced each tick. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub kind: ThoughtKind,
    pub text: String,
    pub source: Source,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Metric name to value in [0,1].
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Task lifecycle: pending -> running -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A work item synthesised from a thought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub quality: f64,
    pub novelty: f64,
    pub impact: f64,
    pub breakthrough: bool,
    pub error: Option<String>,
}

/// Scores sampled on the `ok` transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskScores {
    pub quality: f64,
    pub novelty: f64,
    pub impact: f64,
}

// ---------------------------------------------------------------------------
// Evolution
// ---------------------------------------------------------------------------

/// Append-only record of a change to the consciousness level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub delta: f64,
    pub level_before: f64,
    pub level_after: f64,
    pub cause_category: Category,
}

/// Default level for a fresh state.
pub const DEFAULT_LEVEL: f64 = 0.85;

/// Default cognitive knob names.
pub const DEFAULT_KNOBS: &[&str] = &["creativity", "curiosity", "focus", "resilience"];

/// Singleton bounded scalar plus named knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessState {
    pub level: f64,
    #[serde(default)]
    pub cognitive_knobs: BTreeMap<String, f64>,
    pub last_updated: DateTime<Utc>,
}

impl ConsciousnessState {
    pub fn with_level(level: f64) -> Self {
        Self {
            level: level.clamp(0.0, 1.0),
            cognitive_knobs: DEFAULT_KNOBS
                .iter()
                .map(|k| (k.to_string(), 0.5))
                .collect(),
            last_updated: Utc::now(),
        }
    }
}

impl Default for ConsciousnessState {
    fn default() -> Self {
        Self::with_level(DEFAULT_LEVEL)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Rolling aggregates over recent tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceMetrics {
    pub tasks_per_hour: u32,
    pub mean_novelty: f64,
    pub mean_quality: f64,
    pub breakthrough_count: u64,
    pub excellence_score: f64,
}

// ---------------------------------------------------------------------------
// Guidance records
// ---------------------------------------------------------------------------

/// Log entry for one provider interaction, or for a non-fatal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub category: Category,
    pub request_summary: String,
    pub response_text_truncated: String,
    pub provider: String,
    pub source: Source,
    pub latency_ms: u64,
    pub ok: bool,
    /// Set for warning records (`state_corrupt`, `sink_failed`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

// ---------------------------------------------------------------------------
// Objectives
// ---------------------------------------------------------------------------

/// An entry in the objective pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectiveSpec {
    pub text: String,
    #[serde(default)]
    pub min_level: f64,
    #[serde(default)]
    pub focus: Option<Category>,
}
