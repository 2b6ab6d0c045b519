pub mod schema;
pub mod secrets;

pub use schema::{LoopConfig, ProviderMode};
pub use secrets::{redact_line, RedactingStderr, Secret};

use crate::error::{LoopError, LoopResult};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "AETHER_";

/// Default home directory (~/.aether).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".aether"))
        .unwrap_or_else(|| PathBuf::from(".aether"))
}

/// Load config from the given path, or return defaults.
pub fn load_config(path: &Path) -> LoopResult<LoopConfig> {
    if !path.exists() {
        return Ok(LoopConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| {
        LoopError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config(&contents)
}

/// Parse TOML text into a config. Unknown keys are rejected.
pub fn parse_config(contents: &str) -> LoopResult<LoopConfig> {
    toml::from_str(contents).map_err(|e| LoopError::ConfigInvalid(e.to_string()))
}

/// Load file config, overlay `AETHER_*` environment variables, and validate.
pub fn resolve_config(
    path: &Path,
    vars: impl IntoIterator<Item = (String, String)>,
) -> LoopResult<LoopConfig> {
    let mut config = load_config(path)?;
    apply_env(&mut config, vars)?;
    validate(&config)?;
    Ok(config)
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &LoopConfig, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

/// Overlay recognised `AETHER_*` variables; any other `AETHER_*` name is an error.
pub fn apply_env(
    config: &mut LoopConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> LoopResult<()> {
    for (key, value) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match name {
            "PROVIDER" => {
                config.provider = match value.as_str() {
                    "remote" => ProviderMode::Remote,
                    "local" => ProviderMode::Local,
                    "auto" => ProviderMode::Auto,
                    other => {
                        return Err(LoopError::ConfigInvalid(format!(
                            "{key}: unknown provider '{other}'"
                        )))
                    }
                }
            }
            "ENDPOINT_URL" => config.endpoint_url = value,
            "MODEL_ID" => config.model_id = value,
            "API_KEY" => config.api_key = Secret::new(value),
            "WEBHOOK_URL" => config.sinks.webhook_url = Secret::new(value),
            "MEDIA_URL" => config.sinks.media_endpoint_url = value,
            "STATE_FILE" => config.paths.state_file = value,
            "ARTIFACTS_ROOT" => config.paths.artifacts_root = value,
            "TEMPLATES_FILE" => config.paths.templates_file = Some(value),
            "SEED" => {
                let seed = value.parse::<u64>().map_err(|e| {
                    LoopError::ConfigInvalid(format!("{key}: {e}"))
                })?;
                config.seed = Some(seed);
            }
            _ => {
                return Err(LoopError::ConfigInvalid(format!(
                    "unrecognised environment variable {key}"
                )))
            }
        }
    }
    Ok(())
}

fn check_range(name: &str, range: [f64; 2]) -> LoopResult<()> {
    let [lo, hi] = range;
    if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
        return Err(LoopError::ConfigInvalid(format!(
            "distributions.{name} must satisfy 0 <= lo <= hi <= 1, got [{lo}, {hi}]"
        )));
    }
    Ok(())
}

/// Validate cross-field constraints.
pub fn validate(config: &LoopConfig) -> LoopResult<()> {
    let invalid = |msg: &str| Err(LoopError::ConfigInvalid(msg.to_string()));

    let c = &config.cadences;
    if !(c.thought_every_s.is_finite() && c.thought_every_s > 0.0) {
        return invalid("cadences.thought_every_s must be positive");
    }
    if c.task_every_n_ticks == 0
        || c.evolution_every_n_ticks == 0
        || c.objectives_refresh_every_n_ticks == 0
        || c.snapshot_flush_every_n_ticks == 0
    {
        return invalid("tick cadences must be at least 1");
    }

    let caps = &config.ring_caps;
    if caps.thoughts == 0 || caps.tasks == 0 || caps.evolutions == 0 || caps.guidance == 0 {
        return invalid("ring_caps must be at least 1");
    }

    if !(0.0..=1.0).contains(&config.thresholds.breakthrough) {
        return invalid("thresholds.breakthrough must lie in [0,1]");
    }
    if config.thresholds.circuit_breaker_failures == 0 {
        return invalid("thresholds.circuit_breaker_failures must be at least 1");
    }

    check_range("quality", config.distributions.quality)?;
    check_range("novelty", config.distributions.novelty)?;
    check_range("impact", config.distributions.impact)?;
    let [lo, hi] = config.distributions.work_ms;
    if lo > hi {
        return invalid("distributions.work_ms must satisfy lo <= hi");
    }

    if !(0.0..=1.0).contains(&config.evolution.initial_level) {
        return invalid("evolution.initial_level must lie in [0,1]");
    }
    if !(0.0..=1.0).contains(&config.evolution.decay) {
        return invalid("evolution.decay must lie in [0,1]");
    }

    // Calls inside a tick are cut to what is left of the budget, so a task
    // cap larger than the budget could never take effect.
    let t = &config.timeouts;
    if t.tick_budget_s == 0 {
        return invalid("timeouts.tick_budget_s must be at least 1");
    }
    if t.task_max_ms > t.tick_budget_s.saturating_mul(1000) {
        return invalid("timeouts.task_max_ms must not exceed timeouts.tick_budget_s");
    }

    if config.limits.max_response_chars < 2 || config.limits.record_response_chars < 2 {
        return invalid("limits must allow at least 2 characters");
    }

    if config.provider == ProviderMode::Remote {
        if config.api_key.is_empty() {
            return invalid("provider = remote requires api_key");
        }
        if config.endpoint_url.is_empty() {
            return invalid("provider = remote requires endpoint_url");
        }
    }
    if config.sinks.webhook && config.sinks.webhook_url.is_empty() {
        return invalid("sinks.webhook requires sinks.webhook_url");
    }
    if config.sinks.media && config.sinks.media_endpoint_url.is_empty() {
        return invalid("sinks.media requires sinks.media_endpoint_url");
    }

    Ok(())
}

/// A copy of the config safe to print: secrets replaced by a marker.
pub fn redacted(config: &LoopConfig) -> LoopConfig {
    let mask = |s: &Secret| {
        if s.is_empty() {
            Secret::default()
        } else {
            Secret::new("[redacted]")
        }
    };
    let mut out = config.clone();
    out.api_key = mask(&config.api_key);
    out.sinks.webhook_url = mask(&config.sinks.webhook_url);
    out
}
