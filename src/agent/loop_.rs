//! Loop orchestrator: the per-tick pipeline.
//!
//! Each tick:
//! 1. Uses the in-memory snapshot (loaded once at startup)
//! 2. Selects a category and asks the provider for guidance
//! 3. Derives a thought and offers it to the sinks
//! 4. On task ticks, drives a task through the state machine
//! 5. On evolution ticks, applies an evolution step
//! 6. On objective ticks, refreshes the objective list
//! 7. Publishes the tick's events
//! 8. Flushes the snapshot when the flush cadence (or an evolution) says so
//!
//! The orchestrator is the only writer of the snapshot. Cancellation is
//! checked between steps. Every awaited call inside a tick is bounded by what
//! is left of the tick budget, so a tick is never abandoned half way.

use crate::actions::{ActionExecutor, Artifact, SinkOutcome, TaskOutcome};
use crate::agent::sampler::RngSampler;
use crate::agent::selector::{self, Selection};
use crate::agent::{evolution, prompt};
use crate::config::LoopConfig;
use crate::error::{LoopError, LoopResult};
use crate::events::{EventBus, EventType};
use crate::heartbeat::Heartbeat;
use crate::metrics;
use crate::provider::{bound_text, Guidance, GuidanceContext, GuidanceProvider, TemplateVars};
use crate::state::{Snapshot, StateStore};
use crate::types::*;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Sampler stream numbers; each collaborator draws from its own stream.
const PROVIDER_STREAM: u64 = 1;
const EXECUTOR_STREAM: u64 = 2;

/// Bound on task descriptions taken from guidance.
const TASK_DESCRIPTION_CHARS: usize = 120;

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub thought_id: Option<u64>,
    pub task: Option<Task>,
    pub evolution: Option<EvolutionEvent>,
    pub objectives_refreshed: bool,
    pub flushed: bool,
    /// The tick ran past its budget.
    pub over_budget: bool,
    /// Cancellation was observed before the pipeline finished.
    pub interrupted: bool,
}

/// Totals for a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Ulid,
    pub ticks: u64,
    pub coalesced: u64,
    pub final_flush: bool,
}

pub struct Orchestrator {
    config: LoopConfig,
    store: StateStore,
    snapshot: Snapshot,
    provider: GuidanceProvider,
    executor: ActionExecutor,
    bus: EventBus,
    run_id: Ulid,
    objective_pool: Vec<ObjectiveSpec>,
    /// Events collected during a tick, published at step 7.
    pending: Vec<(EventType, Value)>,
}

impl Orchestrator {
    /// Load the snapshot and assemble the loop from its collaborators.
    pub fn new(
        config: LoopConfig,
        store: StateStore,
        provider: GuidanceProvider,
        executor: ActionExecutor,
        bus: EventBus,
    ) -> LoopResult<Self> {
        let loaded = store.load()?;
        let mut pending = Vec::new();
        if let Some(path) = &loaded.quarantined {
            pending.push((
                EventType::Warning,
                json!({
                    "label": "state_corrupt",
                    "message": format!("corrupt state moved to {}", path.display()),
                }),
            ));
        }

        let objective_pool = config.objective_pool();
        let run_id = Ulid::new();
        info!(
            "Run {} starting at level {:.3} (thought hwm {})",
            run_id,
            loaded.snapshot.consciousness.level,
            loaded.snapshot.high_water_marks.thought_id
        );

        Ok(Self {
            config,
            store,
            snapshot: loaded.snapshot,
            provider,
            executor,
            bus,
            run_id,
            objective_pool,
            pending,
        })
    }

    /// Build every collaborator from `config`.
    pub fn from_config(config: LoopConfig, bus: EventBus) -> anyhow::Result<Self> {
        let store = StateStore::new(
            config.resolved_state_file(),
            config.ring_caps,
            config.evolution.initial_level,
        );
        let provider = GuidanceProvider::from_config(
            &config,
            Box::new(RngSampler::for_stream(config.seed, PROVIDER_STREAM)),
        )?;
        let executor = ActionExecutor::from_config(
            &config,
            Box::new(RngSampler::for_stream(config.seed, EXECUTOR_STREAM)),
        )?;
        Ok(Self::new(config, store, provider, executor, bus)?)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn provider(&self) -> &GuidanceProvider {
        &self.provider
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Run ticks until cancelled (or `max_ticks` is reached), then flush.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        max_ticks: Option<u64>,
    ) -> LoopResult<RunSummary> {
        let span = info_span!("run", run_id = %self.run_id);
        self.run_inner(cancel, max_ticks).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        cancel: CancellationToken,
        max_ticks: Option<u64>,
    ) -> LoopResult<RunSummary> {
        let heartbeat = Heartbeat::from_cadences(&self.config.cadences);
        let mut ticks = heartbeat.start(cancel.child_token());
        let mut tick: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = ticks.next() => next,
            };
            if next.is_none() {
                if cancel.is_cancelled() {
                    break;
                }
                return Err(LoopError::SchedulerFault("tick source stopped".into()));
            }

            tick += 1;
            match self.run_tick(tick, &cancel).await {
                Ok(report) => {
                    if report.interrupted {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Tick {} failed fatally: {}", tick, e);
                    ticks.stop();
                    return Err(e);
                }
                Err(e) => {
                    warn!("Tick {} aborted: {}", tick, e);
                    self.record_warning(e.label(), &e.to_string(), "loop");
                    self.publish_pending();
                }
            }

            if max_ticks.is_some_and(|max| tick >= max) {
                info!("Reached {} ticks", tick);
                break;
            }
        }

        let coalesced = ticks.coalesced();
        ticks.join().await?;
        let final_flush = self.final_flush().await?;

        info!("Run {} finished after {} ticks", self.run_id, tick);
        Ok(RunSummary {
            run_id: self.run_id,
            ticks: tick,
            coalesced,
            final_flush,
        })
    }

    /// Run one pass of the pipeline for tick index `tick` (1-based).
    pub async fn run_tick(
        &mut self,
        tick: u64,
        cancel: &CancellationToken,
    ) -> LoopResult<TickReport> {
        let cadences = self.config.cadences.clone();
        let budget = Duration::from_secs(self.config.timeouts.tick_budget_s);
        let deadline = Instant::now() + budget;
        let left = || deadline.saturating_duration_since(Instant::now());
        let on = |every: u64| every > 0 && tick % every == 0;
        let mut report = TickReport {
            tick,
            ..Default::default()
        };
        let mut force_flush = false;

        // Step 2: select and fetch.
        let selection = selector::select(
            self.snapshot.consciousness.level,
            self.snapshot.metrics.breakthrough_count,
            tick,
        );
        let guidance = match self.fetch_guidance(&selection, tick, left()).await {
            Ok(g) => g,
            Err(e @ LoopError::NoFallbackAvailable { .. }) => {
                warn!("Tick {} skipped: {}", tick, e);
                self.record_warning(e.label(), &e.to_string(), "template_bank");
                self.publish_pending();
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        if self.interrupted(cancel, &mut report) {
            return Ok(report);
        }

        // Step 3: thought.
        let kind = if on(cadences.task_every_n_ticks) {
            ThoughtKind::TaskProposal
        } else if on(cadences.evolution_every_n_ticks) {
            ThoughtKind::EvolutionNote
        } else {
            ThoughtKind::Reflection
        };
        let thought = self.derive_thought(kind, &selection, &guidance);
        report.thought_id = Some(thought.id);
        self.emit_artifact(&Artifact::from_thought(&thought), left()).await;
        if self.interrupted(cancel, &mut report) {
            return Ok(report);
        }

        // Step 4: task.
        if on(cadences.task_every_n_ticks) {
            let id = self.snapshot.next_task_id();
            let mut task = crate::actions::task::new_task(
                id,
                bound_text(&guidance.text, TASK_DESCRIPTION_CHARS),
            );
            let outcome = self.executor.run_task(&mut task, cancel, left()).await?;
            self.finish_task(&task, outcome);
            self.emit_artifact(&Artifact::from_task(&task), left()).await;
            report.task = Some(task);
            if outcome == TaskOutcome::Interrupted || self.interrupted(cancel, &mut report) {
                report.interrupted = true;
                self.publish_pending();
                return Ok(report);
            }
        }

        // Step 5: evolution.
        if on(cadences.evolution_every_n_ticks) {
            let mut event = evolution::evolve(
                &mut self.snapshot.consciousness,
                selection.category,
                &self.snapshot.metrics,
                self.config.evolution.decay,
            );
            event.id = self.snapshot.next_evolution_id();
            info!(
                "Evolution #{}: {:.3} -> {:.3} ({})",
                event.id, event.level_before, event.level_after, event.cause_category
            );
            self.snapshot.evolutions.push(event.clone());
            self.queue(EventType::Evolution, &event);
            report.evolution = Some(event);
            force_flush = true;
            if self.interrupted(cancel, &mut report) {
                return Ok(report);
            }
        }

        // Step 6: objectives.
        if on(cadences.objectives_refresh_every_n_ticks) {
            self.snapshot.objectives = evolution::refresh_objectives(
                &self.objective_pool,
                self.snapshot.consciousness.level,
                selection.category,
                self.snapshot.metrics.breakthrough_count,
            );
            debug!("Objectives: {:?}", self.snapshot.objectives);
            let objectives = self.snapshot.objectives.clone();
            self.queue(EventType::ObjectivesUpdated, &objectives);
            report.objectives_refreshed = true;
        }

        if left().is_zero() {
            warn!("Tick {} ran past its {:?} budget", tick, budget);
            self.record_warning(
                "tick_budget_exceeded",
                &format!("tick {tick} exceeded {budget:?}"),
                "loop",
            );
            report.over_budget = true;
        }

        // Step 7: publish.
        let status = self.status_payload(tick);
        self.queue(EventType::Status, &status);
        self.publish_pending();

        // Step 8: flush.
        if force_flush || on(cadences.snapshot_flush_every_n_ticks) {
            self.snapshot.updated_at = Utc::now();
            self.store.commit_async(self.snapshot.clone()).await?;
            report.flushed = true;
        }

        Ok(report)
    }

    async fn fetch_guidance(
        &mut self,
        selection: &Selection,
        tick: u64,
        within: Duration,
    ) -> LoopResult<Guidance> {
        let system = prompt::build_system_prompt(&self.snapshot, tick, self.provider.degraded());
        let user = prompt::build_user_prompt(selection);
        let context = GuidanceContext {
            system,
            vars: TemplateVars {
                level: self.snapshot.consciousness.level,
                tick,
            },
        };
        let guidance = self
            .provider
            .ask(selection.category, &user, &context, within)
            .await?;

        let id = self.snapshot.next_guidance_id();
        let record = GuidanceRecord {
            id,
            created_at: Utc::now(),
            category: guidance.category,
            request_summary: guidance.request_summary.clone(),
            response_text_truncated: guidance.record_text.clone(),
            provider: guidance.provider.clone(),
            source: guidance.source,
            latency_ms: guidance.latency_ms,
            ok: guidance.ok,
            warning: guidance.warning.clone(),
        };
        if let Some(label) = &guidance.warning {
            self.queue(
                EventType::Warning,
                &json!({"label": label, "message": "remote provider failed; used templates", "source": "provider"}),
            );
        }
        self.snapshot.guidance.push(record);
        Ok(guidance)
    }

    fn derive_thought(&mut self, kind: ThoughtKind, selection: &Selection, guidance: &Guidance) -> Thought {
        let mut tags = BTreeSet::new();
        tags.insert(selection.category.to_string());
        if let Some(hint) = selection.hint {
            tags.insert(hint.to_string());
        }
        let mut metrics = std::collections::BTreeMap::new();
        metrics.insert("level".to_string(), self.snapshot.consciousness.level);
        metrics.insert(
            "excellence".to_string(),
            self.snapshot.metrics.excellence_score,
        );

        let thought = Thought {
            id: self.snapshot.next_thought_id(),
            created_at: Utc::now(),
            kind,
            text: guidance.text.clone(),
            source: guidance.source,
            tags,
            metrics,
        };
        info!("Thought #{} [{}] via {}", thought.id, selection.category, thought.source);
        self.snapshot.thoughts.push(thought.clone());
        self.queue(EventType::Thought, &thought);
        thought
    }

    fn finish_task(&mut self, task: &Task, outcome: TaskOutcome) {
        self.snapshot.tasks_completed.push(task.clone());
        match outcome {
            TaskOutcome::Completed => {
                if task.breakthrough {
                    self.snapshot.metrics.breakthrough_count += 1;
                    info!("Task {} is a breakthrough", task.id);
                }
                self.snapshot.metrics = metrics::recompute(
                    self.snapshot.tasks_completed.iter(),
                    self.snapshot.metrics.breakthrough_count,
                    Utc::now(),
                );
                self.queue(EventType::TaskCompleted, task);
            }
            TaskOutcome::TimedOut => {
                let err = LoopError::TaskTimeout { task_id: task.id };
                self.record_warning(err.label(), &err.to_string(), "executor");
                self.queue(EventType::TaskFailed, task);
            }
            TaskOutcome::Interrupted => {
                self.queue(EventType::TaskFailed, task);
            }
        }
    }

    async fn emit_artifact(&mut self, artifact: &Artifact, within: Duration) {
        for outcome in self.executor.emit(artifact, within).await {
            match outcome {
                SinkOutcome::Delivered { sink, detail } => {
                    debug!("Sink {} delivered {}: {}", sink, artifact.kind, detail)
                }
                SinkOutcome::Skipped { sink } => {
                    debug!("Sink {} skipped {} #{}", sink, artifact.kind, artifact.id)
                }
                SinkOutcome::Failed(err) => {
                    let sink = match &err {
                        LoopError::SinkFailed { sink, .. } => sink.clone(),
                        _ => "sink".to_string(),
                    };
                    self.record_warning(err.label(), &err.to_string(), &sink);
                }
            }
        }
    }

    /// Record a non-fatal error as a guidance record and queue a warning event.
    fn record_warning(&mut self, label: &str, message: &str, origin: &str) {
        let id = self.snapshot.next_guidance_id();
        self.snapshot.guidance.push(GuidanceRecord {
            id,
            created_at: Utc::now(),
            category: Category::General,
            request_summary: origin.to_string(),
            response_text_truncated: bound_text(message, self.config.limits.record_response_chars),
            provider: origin.to_string(),
            source: Source::TemplateBank,
            latency_ms: 0,
            ok: false,
            warning: Some(label.to_string()),
        });
        self.queue(
            EventType::Warning,
            &json!({"label": label, "message": message, "source": origin}),
        );
    }

    fn status_payload(&self, tick: u64) -> Value {
        json!({
            "run_id": self.run_id.to_string(),
            "tick": tick,
            "level": self.snapshot.consciousness.level,
            "provider_circuit": self.provider.circuit_state(),
            "degraded": self.provider.degraded(),
            "sinks": self.executor.sink_states(),
            "sink_failures": self.executor.failure_counts(),
        })
    }

    fn queue<T: serde::Serialize>(&mut self, kind: EventType, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.pending.push((kind, value)),
            Err(e) => warn!("Dropping {} event: {}", kind, e),
        }
    }

    fn publish_pending(&mut self) {
        for (kind, payload) in self.pending.drain(..) {
            self.bus.publish(kind, &payload);
        }
    }

    /// Publish what the tick produced so far and mark it interrupted.
    fn interrupted(&mut self, cancel: &CancellationToken, report: &mut TickReport) -> bool {
        if !cancel.is_cancelled() {
            return false;
        }
        info!("Tick {} interrupted by shutdown", report.tick);
        report.interrupted = true;
        self.publish_pending();
        true
    }

    /// Final commit within the shutdown budget. `Ok(false)` if it timed out.
    async fn final_flush(&mut self) -> LoopResult<bool> {
        let budget = Duration::from_millis(self.config.timeouts.shutdown_flush_ms);
        self.snapshot.updated_at = Utc::now();
        match tokio::time::timeout(budget, self.store.commit_async(self.snapshot.clone())).await {
            Ok(result) => {
                result?;
                info!("Final snapshot flushed to {}", self.store.path().display());
                Ok(true)
            }
            Err(_) => {
                warn!("Final flush exceeded {:?}; snapshot not written", budget);
                Ok(false)
            }
        }
    }
}
