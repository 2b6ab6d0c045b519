//! Configuration schema for aether.toml.
//!
//! Every table rejects unknown keys, so a typo fails at startup instead of
//! silently falling back to a default.

use crate::config::secrets::Secret;
use crate::types::{Category, ObjectiveSpec, DEFAULT_LEVEL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which guidance provider variant to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Remote chat-completion only (templates still cover failures).
    Remote,
    /// Template bank only; no network calls.
    Local,
    /// Remote when credentials are configured, templates otherwise.
    Auto,
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    pub provider: ProviderMode,

    /// Full chat-completions URL.
    pub endpoint_url: String,

    pub model_id: String,

    pub api_key: Secret,

    /// Seed for every sampler. Unseeded runs draw from OS entropy.
    pub seed: Option<u64>,

    pub max_tokens: u32,

    pub temperature: f64,

    pub cadences: Cadences,
    pub ring_caps: RingCaps,
    pub sinks: Sinks,
    pub thresholds: Thresholds,
    pub paths: Paths,
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub distributions: Distributions,
    pub evolution: Evolution,
    pub vcs: Vcs,

    /// Objective pool. Empty means the built-in pool.
    pub objectives: Vec<ObjectiveSpec>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            provider: ProviderMode::Auto,
            endpoint_url: "https://api.openai.com/v1/chat/completions".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: Secret::default(),
            seed: None,
            max_tokens: 400,
            temperature: 0.8,
            cadences: Cadences::default(),
            ring_caps: RingCaps::default(),
            sinks: Sinks::default(),
            thresholds: Thresholds::default(),
            paths: Paths::default(),
            timeouts: Timeouts::default(),
            limits: Limits::default(),
            distributions: Distributions::default(),
            evolution: Evolution::default(),
            vcs: Vcs::default(),
            objectives: Vec::new(),
        }
    }
}

/// Tick cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Cadences {
    pub thought_every_s: f64,
    pub task_every_n_ticks: u64,
    pub evolution_every_n_ticks: u64,
    pub objectives_refresh_every_n_ticks: u64,
    pub snapshot_flush_every_n_ticks: u64,
}

impl Default for Cadences {
    fn default() -> Self {
        Self {
            thought_every_s: 6.0,
            task_every_n_ticks: 3,
            evolution_every_n_ticks: 5,
            objectives_refresh_every_n_ticks: 10,
            snapshot_flush_every_n_ticks: 1,
        }
    }
}

impl Cadences {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(self.thought_every_s)
    }
}

/// Ring buffer capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingCaps {
    pub thoughts: usize,
    pub tasks: usize,
    pub evolutions: usize,
    pub guidance: usize,
}

impl Default for RingCaps {
    fn default() -> Self {
        Self {
            thoughts: 60,
            tasks: 40,
            evolutions: 15,
            guidance: 20,
        }
    }
}

/// Side-effect sink switches and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Sinks {
    pub file: bool,
    pub vcs: bool,
    pub webhook: bool,
    pub media: bool,
    pub webhook_url: Secret,
    pub media_endpoint_url: String,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            file: true,
            vcs: false,
            webhook: false,
            media: false,
            webhook_url: Secret::default(),
            media_endpoint_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub breakthrough: f64,
    pub circuit_breaker_failures: u32,
    pub circuit_breaker_cooldown_s: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            breakthrough: 0.85,
            circuit_breaker_failures: 5,
            circuit_breaker_cooldown_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub state_file: String,
    pub artifacts_root: String,
    /// Optional YAML template bank replacing the built-in catalogue.
    pub templates_file: Option<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_file: "~/.aether/state.json".into(),
            artifacts_root: "~/.aether/artifacts".into(),
            templates_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub remote_s: u64,
    pub webhook_s: u64,
    pub webhook_retry_delay_ms: u64,
    pub task_max_ms: u64,
    pub shutdown_flush_ms: u64,
    pub tick_budget_s: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            remote_s: 30,
            webhook_s: 10,
            webhook_retry_delay_ms: 1000,
            task_max_ms: 4000,
            shutdown_flush_ms: 2000,
            tick_budget_s: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Bound on thought text taken from a response.
    pub max_response_chars: usize,
    /// Bound on the response kept in the guidance record.
    pub record_response_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_response_chars: 500,
            record_response_chars: 4000,
        }
    }
}

/// Uniform sampling ranges, `[lo, hi]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Distributions {
    pub quality: [f64; 2],
    pub novelty: [f64; 2],
    pub impact: [f64; 2],
    /// Simulated task work, milliseconds.
    pub work_ms: [u64; 2],
}

impl Default for Distributions {
    fn default() -> Self {
        Self {
            quality: [0.6, 1.0],
            novelty: [0.5, 1.0],
            impact: [0.4, 1.0],
            work_ms: [500, 3000],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Evolution {
    pub initial_level: f64,
    /// Subtracted on every evolution. Zero keeps the level non-decreasing.
    pub decay: f64,
}

impl Default for Evolution {
    fn default() -> Self {
        Self {
            initial_level: DEFAULT_LEVEL,
            decay: 0.0,
        }
    }
}

/// Version-control sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Vcs {
    /// Working tree to commit in. Empty means the artifacts root.
    pub repo_path: String,
    pub remote: String,
    pub branch: String,
    pub push: bool,
    /// Placeholders: `{kind}`, `{id}`, `{title}`.
    pub message_template: String,
}

impl Default for Vcs {
    fn default() -> Self {
        Self {
            repo_path: String::new(),
            remote: "origin".into(),
            branch: "main".into(),
            push: true,
            message_template: "aether: {kind} #{id} {title}".into(),
        }
    }
}

impl LoopConfig {
    /// Resolve a path that may contain `~`.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).into_owned())
    }

    pub fn resolved_state_file(&self) -> PathBuf {
        self.resolve_path(&self.paths.state_file)
    }

    pub fn resolved_artifacts_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.artifacts_root)
    }

    pub fn resolved_templates_file(&self) -> Option<PathBuf> {
        self.paths
            .templates_file
            .as_deref()
            .map(|p| self.resolve_path(p))
    }

    /// Working tree for the vcs sink.
    pub fn resolved_vcs_repo(&self) -> PathBuf {
        if self.vcs.repo_path.is_empty() {
            self.resolved_artifacts_root()
        } else {
            self.resolve_path(&self.vcs.repo_path)
        }
    }

    /// Whether the remote variant should be attempted at all.
    pub fn remote_enabled(&self) -> bool {
        match self.provider {
            ProviderMode::Remote => true,
            ProviderMode::Local => false,
            ProviderMode::Auto => !self.api_key.is_empty() && !self.endpoint_url.is_empty(),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.remote_s)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.thresholds.circuit_breaker_cooldown_s)
    }

    /// Move default paths under `home` when a non-default home is in use.
    /// Explicitly configured paths are left alone.
    pub fn rebase_home(&mut self, home: &Path) {
        let defaults = Paths::default();
        if self.paths.state_file == defaults.state_file {
            self.paths.state_file = home.join("state.json").display().to_string();
        }
        if self.paths.artifacts_root == defaults.artifacts_root {
            self.paths.artifacts_root = home.join("artifacts").display().to_string();
        }
    }

    /// Built-in objective pool used when none is configured.
    pub fn objective_pool(&self) -> Vec<ObjectiveSpec> {
        if !self.objectives.is_empty() {
            return self.objectives.clone();
        }
        let entry = |text: &str, min_level: f64, focus: Option<Category>| ObjectiveSpec {
            text: text.into(),
            min_level,
            focus,
        };
        vec![
            entry("Stabilise the tick pipeline", 0.0, Some(Category::Optimization)),
            entry("Produce one novel artifact", 0.0, Some(Category::InnovationBoost)),
            entry("Review recent reflections", 0.0, Some(Category::General)),
            entry("Raise mean task quality", 0.5, Some(Category::Optimization)),
            entry("Compound recent breakthroughs", 0.8, Some(Category::Amplification)),
            entry("Widen the idea search space", 0.8, Some(Category::InnovationBoost)),
            entry("Synthesise long-horizon themes", 0.9, Some(Category::Transcendence)),
            entry("Consolidate knob settings", 0.9, None),
        ]
    }
}
