//! Guidance provider: remote chat-completion with a local template fallback.
//!
//! `ask` always produces guidance unless the template bank itself is empty.
//! Remote failures feed a circuit breaker; while it is open the remote call
//! is skipped entirely.

pub mod breaker;
pub mod remote;
pub mod templates;

pub use breaker::{CircuitBreaker, CircuitState};
pub use remote::ChatClient;
pub use templates::{TemplateBank, TemplateVars};

use crate::agent::sampler::Sampler;
use crate::config::LoopConfig;
use crate::error::{LoopError, LoopResult};
use crate::types::{Category, Source};
use anyhow::Context;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Marker appended to truncated text.
pub const ELLIPSIS: char = '…';

/// Per-call context passed alongside the prompt.
#[derive(Debug, Clone, Default)]
pub struct GuidanceContext {
    /// System message for the remote variant.
    pub system: String,
    /// Placeholder values for the local variant.
    pub vars: TemplateVars,
}

/// Outcome of one `ask`, before the orchestrator assigns a record id.
#[derive(Debug, Clone, PartialEq)]
pub struct Guidance {
    pub category: Category,
    pub request_summary: String,
    /// Bounded to `max_response_chars`.
    pub text: String,
    /// Bounded to `record_response_chars`; kept only in the guidance ring.
    pub record_text: String,
    pub provider: String,
    pub source: Source,
    pub latency_ms: u64,
    pub ok: bool,
    pub warning: Option<String>,
}

pub struct GuidanceProvider {
    remote: Option<ChatClient>,
    templates: TemplateBank,
    breaker: CircuitBreaker,
    sampler: Box<dyn Sampler>,
    max_chars: usize,
    record_chars: usize,
    remote_attempts: u64,
}

impl GuidanceProvider {
    pub fn new(
        remote: Option<ChatClient>,
        templates: TemplateBank,
        breaker: CircuitBreaker,
        sampler: Box<dyn Sampler>,
        max_chars: usize,
        record_chars: usize,
    ) -> Self {
        Self {
            remote,
            templates,
            breaker,
            sampler,
            max_chars,
            record_chars,
            remote_attempts: 0,
        }
    }

    /// Build the provider described by `config`.
    pub fn from_config(config: &LoopConfig, sampler: Box<dyn Sampler>) -> anyhow::Result<Self> {
        let remote = if config.remote_enabled() {
            Some(ChatClient::new(
                &config.endpoint_url,
                &config.model_id,
                config.api_key.clone(),
                config.max_tokens,
                config.temperature,
                config.remote_timeout(),
            )?)
        } else {
            None
        };

        let templates = match config.resolved_templates_file() {
            Some(path) => TemplateBank::from_yaml_file(&path).context("Template bank")?,
            None => TemplateBank::builtin(),
        };

        let breaker = CircuitBreaker::new(
            "provider",
            config.thresholds.circuit_breaker_failures,
            config.breaker_cooldown(),
        );

        Ok(Self::new(
            remote,
            templates,
            breaker,
            sampler,
            config.limits.max_response_chars,
            config.limits.record_response_chars,
        ))
    }

    /// Ask for guidance in `category`.
    ///
    /// The remote call is cut off after `within` (the caller's remaining
    /// budget) on top of the client's own timeout; a cut-off counts as a
    /// remote failure. With no time left the remote is not tried.
    pub async fn ask(
        &mut self,
        category: Category,
        prompt: &str,
        context: &GuidanceContext,
        within: Duration,
    ) -> LoopResult<Guidance> {
        let started = Instant::now();
        let request_summary = bound_text(prompt, 120);
        let mut failure: Option<LoopError> = None;

        if let Some(remote) = &self.remote {
            if within.is_zero() {
                debug!("No budget left for the remote provider; using templates");
            } else if self.breaker.allow() {
                self.remote_attempts += 1;
                let result =
                    match tokio::time::timeout(within, remote.complete(&context.system, prompt))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!(
                            "Chat request cut off after {:?} (tick budget)",
                            within
                        )),
                    };
                match result {
                    Ok(text) => {
                        self.breaker.record_success();
                        let provider = format!("remote:{}", remote.model());
                        return Ok(self.finish(
                            category,
                            request_summary,
                            text,
                            provider,
                            Source::RemoteLlm,
                            started,
                            None,
                        ));
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        warn!(
                            "Remote provider failed ({} consecutive): {:#}",
                            self.breaker.consecutive_failures(),
                            e
                        );
                        failure = Some(LoopError::ProviderUnavailable(format!("{e:#}")));
                    }
                }
            }
        }

        let text = self
            .templates
            .pick(category, prompt, context.vars, self.sampler.as_mut())?;
        let source = if failure.is_some() {
            Source::Fallback
        } else {
            Source::TemplateBank
        };
        debug!("Local guidance for {} ({})", category, source);
        Ok(self.finish(
            category,
            request_summary,
            text,
            "template_bank".into(),
            source,
            started,
            failure,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        category: Category,
        request_summary: String,
        full: String,
        provider: String,
        source: Source,
        started: Instant,
        failure: Option<LoopError>,
    ) -> Guidance {
        Guidance {
            category,
            request_summary,
            text: bound_text(&full, self.max_chars),
            record_text: bound_text(&full, self.record_chars),
            provider,
            source,
            latency_ms: started.elapsed().as_millis() as u64,
            ok: failure.is_none(),
            warning: failure.map(|e| e.label().to_string()),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Remote configured but currently not trusted.
    pub fn degraded(&self) -> bool {
        self.remote.is_some() && self.breaker.state() != CircuitState::Closed
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Number of remote calls actually attempted.
    pub fn remote_attempts(&self) -> u64 {
        self.remote_attempts
    }
}

/// Bound `text` to `max` characters, ending in [`ELLIPSIS`] when cut.
pub fn bound_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}
