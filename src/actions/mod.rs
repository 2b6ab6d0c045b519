//! Action executor: side-effect sinks and the task driver.
//!
//! Each sink sits behind its own circuit breaker. A sink failure is counted,
//! reported back to the orchestrator as `SinkFailed`, and never aborts the
//! loop.

pub mod files;
pub mod git;
pub mod media;
pub mod task;
pub mod webhook;

pub use files::FileSink;
pub use git::GitSink;
pub use media::MediaSink;
pub use webhook::WebhookSink;

use crate::agent::sampler::Sampler;
use crate::config::schema::Distributions;
use crate::config::LoopConfig;
use crate::error::{LoopError, LoopResult};
use crate::provider::{CircuitBreaker, CircuitState};
use crate::types::{Task, Thought};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something a sink is asked to publish.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// `thought` or `task`; also the artifact subdirectory.
    pub kind: String,
    pub id: u64,
    pub title: String,
    pub body: String,
    pub ext: String,
    pub fields: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: &str, id: u64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            id,
            title: title.into(),
            body: body.into(),
            ext: "md".into(),
            fields: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn from_thought(thought: &Thought) -> Self {
        let mut a = Self::new("thought", thought.id, format!("Thought #{}", thought.id), &thought.text);
        a.created_at = thought.created_at;
        a.fields.push(("source".into(), thought.source.to_string()));
        for tag in &thought.tags {
            a.fields.push(("tag".into(), tag.clone()));
        }
        a
    }

    pub fn from_task(t: &Task) -> Self {
        let title = format!("Task #{} {}", t.id, t.status);
        let mut a = Self::new("task", t.id, title, &t.description);
        a.created_at = t.completed_at.unwrap_or(t.created_at);
        a.fields.push(("quality".into(), format!("{:.3}", t.quality)));
        a.fields.push(("novelty".into(), format!("{:.3}", t.novelty)));
        a.fields.push(("impact".into(), format!("{:.3}", t.impact)));
        a.fields.push(("breakthrough".into(), t.breakthrough.to_string()));
        if let Some(err) = &t.error {
            a.fields.push(("error".into(), err.clone()));
        }
        a
    }

    pub fn render_markdown(&self) -> String {
        let mut out = format!("# {}\n\n{}\n", self.title, self.body);
        if !self.fields.is_empty() {
            out.push('\n');
            for (name, value) in &self.fields {
                out.push_str(&format!("- **{}**: {}\n", name, value));
            }
        }
        out.push_str(&format!("\n_{}_\n", self.created_at.to_rfc3339()));
        out
    }
}

/// A side-effect sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink name used in logs, counters and warning records.
    fn name(&self) -> &str;

    /// Publish `artifact`, returning a short description (path, URL, ...).
    async fn emit(&self, artifact: &Artifact) -> Result<String>;
}

/// Result of offering one artifact to one sink.
#[derive(Debug)]
pub enum SinkOutcome {
    Delivered { sink: String, detail: String },
    /// Circuit open; the call was not attempted.
    Skipped { sink: String },
    Failed(LoopError),
}

/// How a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    TimedOut,
    Interrupted,
}

struct SinkSlot {
    sink: Box<dyn Sink>,
    breaker: CircuitBreaker,
    failures: u64,
}

pub struct ActionExecutor {
    sinks: Vec<SinkSlot>,
    sampler: Box<dyn Sampler>,
    distributions: Distributions,
    breakthrough_threshold: f64,
    task_max: Duration,
}

impl ActionExecutor {
    pub fn new(
        sampler: Box<dyn Sampler>,
        distributions: Distributions,
        breakthrough_threshold: f64,
        task_max: Duration,
    ) -> Self {
        Self {
            sinks: Vec::new(),
            sampler,
            distributions,
            breakthrough_threshold,
            task_max,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>, breaker: CircuitBreaker) -> Self {
        self.sinks.push(SinkSlot {
            sink,
            breaker,
            failures: 0,
        });
        self
    }

    /// Executor with every sink enabled in `config`.
    pub fn from_config(config: &LoopConfig, sampler: Box<dyn Sampler>) -> Result<Self> {
        let breaker = |name: &str| {
            CircuitBreaker::new(
                name,
                config.thresholds.circuit_breaker_failures,
                config.breaker_cooldown(),
            )
        };
        let t = &config.timeouts;
        let mut exec = Self::new(
            sampler,
            config.distributions.clone(),
            config.thresholds.breakthrough,
            Duration::from_millis(t.task_max_ms),
        );

        if config.sinks.file {
            exec = exec.with_sink(
                Box::new(FileSink::new(config.resolved_artifacts_root())),
                breaker("file"),
            );
        }
        if config.sinks.vcs {
            let v = &config.vcs;
            exec = exec.with_sink(
                Box::new(GitSink::new(
                    config.resolved_vcs_repo(),
                    &v.remote,
                    &v.branch,
                    v.push,
                    &v.message_template,
                )),
                breaker("vcs"),
            );
        }
        if config.sinks.webhook {
            exec = exec.with_sink(
                Box::new(WebhookSink::new(
                    config.sinks.webhook_url.clone(),
                    Duration::from_secs(t.webhook_s),
                    Duration::from_millis(t.webhook_retry_delay_ms),
                )?),
                breaker("webhook"),
            );
        }
        if config.sinks.media {
            exec = exec.with_sink(
                Box::new(MediaSink::new(
                    &config.sinks.media_endpoint_url,
                    config.remote_timeout(),
                )?),
                breaker("media"),
            );
        }

        info!(
            "Action executor ready with sinks: [{}]",
            exec.sinks
                .iter()
                .map(|s| s.sink.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(exec)
    }

    /// Offer `artifact` to every sink in order, all within `within`.
    ///
    /// A sink still running when `within` runs out counts as failed. Once
    /// nothing is left the remaining sinks are skipped.
    pub async fn emit(&mut self, artifact: &Artifact, within: Duration) -> Vec<SinkOutcome> {
        let deadline = Instant::now() + within;
        let mut outcomes = Vec::with_capacity(self.sinks.len());
        for slot in &mut self.sinks {
            let name = slot.sink.name().to_string();
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!("Sink {} skipped: tick budget spent", name);
                outcomes.push(SinkOutcome::Skipped { sink: name });
                continue;
            }
            if !slot.breaker.allow() {
                debug!("Sink {} skipped: circuit open", name);
                outcomes.push(SinkOutcome::Skipped { sink: name });
                continue;
            }
            let result = match tokio::time::timeout(left, slot.sink.emit(artifact)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("cut off after {:?} (tick budget)", left)),
            };
            match result {
                Ok(detail) => {
                    slot.breaker.record_success();
                    outcomes.push(SinkOutcome::Delivered { sink: name, detail });
                }
                Err(e) => {
                    slot.breaker.record_failure();
                    slot.failures += 1;
                    warn!("Sink {} failed ({} total): {:#}", name, slot.failures, e);
                    outcomes.push(SinkOutcome::Failed(LoopError::SinkFailed {
                        sink: name,
                        reason: format!("{e:#}"),
                    }));
                }
            }
        }
        outcomes
    }

    /// Drive `task` from `pending` to a terminal state.
    ///
    /// Simulated work is capped at the task timeout or `within`, whichever
    /// is shorter; either cap fails the task with `task_timeout`.
    /// Cancellation fails it with `shutdown`.
    pub async fn run_task(
        &mut self,
        task: &mut Task,
        cancel: &CancellationToken,
        within: Duration,
    ) -> LoopResult<TaskOutcome> {
        task::start(task)?;
        let [lo, hi] = self.distributions.work_ms;
        let work = Duration::from_millis(self.sampler.integer(lo, hi));
        let cap = self.task_max.min(within);
        debug!("Task {} running for {:?} (cap {:?})", task.id, work, cap);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => TaskOutcome::Interrupted,
            r = tokio::time::timeout(cap, tokio::time::sleep(work)) => match r {
                Ok(()) => TaskOutcome::Completed,
                Err(_) => TaskOutcome::TimedOut,
            },
        };

        match outcome {
            TaskOutcome::Completed => {
                let scores = task::sample_scores(self.sampler.as_mut(), &self.distributions);
                task::complete(task, scores, self.breakthrough_threshold)?;
            }
            TaskOutcome::TimedOut => task::fail(task, task::TASK_TIMEOUT)?,
            TaskOutcome::Interrupted => task::fail(task, task::SHUTDOWN)?,
        }
        info!("Task {} {}", task.id, task.status);
        Ok(outcome)
    }

    /// Failure count per sink.
    pub fn failure_counts(&self) -> BTreeMap<String, u64> {
        self.sinks
            .iter()
            .map(|s| (s.sink.name().to_string(), s.failures))
            .collect()
    }

    /// Circuit state per sink.
    pub fn sink_states(&self) -> BTreeMap<String, CircuitState> {
        self.sinks
            .iter()
            .map(|s| (s.sink.name().to_string(), s.breaker.state()))
            .collect()
    }
}
