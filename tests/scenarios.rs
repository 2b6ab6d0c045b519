//! End-to-end loop scenarios: seed 42, file sink only, temp state directory.

use aether_loop::agent::Orchestrator;
use aether_loop::config::{LoopConfig, ProviderMode, Secret};
use aether_loop::events::{EventBus, EventType};
use aether_loop::provider::CircuitState;
use aether_loop::state::{schema, Snapshot, StateStore};
use aether_loop::types::*;
use aether_loop::LoopError;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn local_config(dir: &TempDir) -> LoopConfig {
    let mut c = LoopConfig::default();
    c.provider = ProviderMode::Local;
    c.seed = Some(42);
    c.paths.state_file = dir.path().join("state.json").display().to_string();
    c.paths.artifacts_root = dir.path().join("artifacts").display().to_string();
    c.distributions.work_ms = [1, 5];
    c
}

fn state_path(dir: &TempDir) -> PathBuf {
    dir.path().join("state.json")
}

fn read_state(dir: &TempDir) -> Snapshot {
    let text = std::fs::read_to_string(state_path(dir)).unwrap();
    schema::decode(&text).unwrap()
}

async fn run_ticks(orch: &mut Orchestrator, ticks: u64) {
    let cancel = CancellationToken::new();
    for tick in 1..=ticks {
        orch.run_tick(tick, &cancel).await.unwrap();
    }
}

#[tokio::test]
async fn cold_start_single_tick() {
    let dir = TempDir::new().unwrap();
    assert!(!state_path(&dir).exists());

    let mut orch = Orchestrator::from_config(local_config(&dir), EventBus::default()).unwrap();
    run_ticks(&mut orch, 1).await;

    let snap = read_state(&dir);
    let ids: Vec<u64> = snap.thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1]);
    assert_eq!(snap.consciousness.level, 0.85);
    assert!(snap.tasks_completed.is_empty());
    assert_eq!(snap.schema_version, 1);
    assert!(snap.thoughts.iter().all(|t| t.source == Source::TemplateBank));
}

#[tokio::test]
async fn three_ticks_complete_one_task() {
    let dir = TempDir::new().unwrap();
    let mut orch = Orchestrator::from_config(local_config(&dir), EventBus::default()).unwrap();
    run_ticks(&mut orch, 3).await;

    let snap = read_state(&dir);
    let ids: Vec<u64> = snap.thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(snap.tasks_completed.len(), 1);
    let task = snap.tasks_completed.last().unwrap();
    assert_eq!(task.id, 1);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(snap.metrics.tasks_per_hour, 1);
    assert_eq!(snap.thoughts.last().unwrap().kind, ThoughtKind::TaskProposal);

    // One artifact per thought plus one for the task.
    let thoughts_dir = dir.path().join("artifacts").join("thought");
    assert_eq!(std::fs::read_dir(thoughts_dir).unwrap().count(), 3);
    let tasks_dir = dir.path().join("artifacts").join("task");
    assert_eq!(std::fs::read_dir(tasks_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn five_ticks_apply_one_evolution() {
    let dir = TempDir::new().unwrap();
    let mut orch = Orchestrator::from_config(local_config(&dir), EventBus::default()).unwrap();
    run_ticks(&mut orch, 5).await;

    let snap = read_state(&dir);
    assert_eq!(snap.evolutions.len(), 1);
    let ev = snap.evolutions.last().unwrap();
    assert_eq!(ev.id, 1);
    assert_eq!(ev.level_before, 0.85);
    assert!((0.005..=0.05).contains(&ev.delta), "delta {}", ev.delta);
    assert_eq!(ev.level_after, (0.85 + ev.delta).min(1.0));
    assert_eq!(snap.consciousness.level, ev.level_after);
}

#[tokio::test]
async fn failing_remote_opens_circuit_and_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.provider = ProviderMode::Remote;
    config.api_key = Secret::new("sk-test");
    config.endpoint_url = format!("{}/v1/chat/completions", server.uri());

    let mut orch = Orchestrator::from_config(config, EventBus::default()).unwrap();
    run_ticks(&mut orch, 10).await;

    let snap = orch.snapshot();
    let sources: Vec<Source> = snap.thoughts.iter().map(|t| t.source).collect();
    assert_eq!(&sources[..5], &[Source::Fallback; 5]);
    assert_eq!(&sources[5..], &[Source::TemplateBank; 5]);

    let ids: Vec<u64> = snap.thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    assert_eq!(orch.provider().circuit_state(), CircuitState::Open);
    assert!(orch.provider().degraded());
    assert_eq!(orch.provider().remote_attempts(), 5);
}

#[tokio::test]
async fn shutdown_during_running_task() {
    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.cadences.thought_every_s = 0.05;
    config.cadences.task_every_n_ticks = 1;
    config.distributions.work_ms = [3000, 3000];
    config.timeouts.task_max_ms = 10_000;

    let mut orch = Orchestrator::from_config(config, EventBus::default()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let signalled = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
        Instant::now()
    });

    let summary = orch.run(cancel, None).await.unwrap();
    let exited = Instant::now();
    let signalled_at = signalled.await.unwrap();
    assert!(exited.duration_since(signalled_at) < Duration::from_secs(2));
    assert!(summary.final_flush);
    assert_eq!(summary.ticks, 1);

    let snap = read_state(&dir);
    let task = snap.tasks_completed.last().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("shutdown"));
}

#[tokio::test]
async fn thought_ring_keeps_newest() {
    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.ring_caps.thoughts = 3;

    let mut orch = Orchestrator::from_config(config, EventBus::default()).unwrap();
    run_ticks(&mut orch, 5).await;

    let ids: Vec<u64> = read_state(&dir).thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![3, 4, 5]);
}

#[tokio::test]
async fn ids_continue_across_runs() {
    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.ring_caps.thoughts = 2;

    let mut first = Orchestrator::from_config(config.clone(), EventBus::default()).unwrap();
    run_ticks(&mut first, 3).await;
    drop(first);

    let mut second = Orchestrator::from_config(config, EventBus::default()).unwrap();
    run_ticks(&mut second, 3).await;

    let snap = read_state(&dir);
    let ids: Vec<u64> = snap.thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![5, 6]);
    assert_eq!(snap.high_water_marks.thought_id, 6);
    assert_eq!(snap.high_water_marks.task_id, 2);
}

#[tokio::test]
async fn corrupt_state_is_quarantined_and_run_proceeds() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "{ not json").unwrap();

    let bus = EventBus::default();
    let mut sub = bus.subscribe();
    let mut orch = Orchestrator::from_config(local_config(&dir), bus).unwrap();
    run_ticks(&mut orch, 1).await;

    let quarantined = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("state.json.corrupt-"));
    assert!(quarantined);

    let snap = read_state(&dir);
    assert_eq!(snap.thoughts.last().unwrap().id, 1);
    assert!(snap
        .guidance
        .iter()
        .any(|g| g.warning.as_deref() == Some("state_corrupt") && !g.ok));

    let first = sub.recv().await.unwrap();
    assert_eq!(first.kind, EventType::Warning);
    assert_eq!(first.payload["label"], "state_corrupt");
}

#[tokio::test]
async fn events_follow_pipeline_order() {
    let dir = TempDir::new().unwrap();
    let bus = EventBus::default();
    let mut sub = bus.subscribe();
    let mut orch = Orchestrator::from_config(local_config(&dir), bus).unwrap();
    run_ticks(&mut orch, 5).await;

    let mut kinds = Vec::new();
    let mut last_seq = 0;
    while let Some(event) = sub.try_recv() {
        assert!(event.seq > last_seq);
        last_seq = event.seq;
        kinds.push(event.kind);
    }

    let (thought, status) = (EventType::Thought, EventType::Status);
    assert_eq!(
        kinds,
        vec![
            thought, status, // 1
            thought, status, // 2
            thought, EventType::TaskCompleted, status, // 3
            thought, status, // 4
            thought, EventType::Evolution, status, // 5
        ]
    );
}

#[tokio::test]
async fn seeded_runs_are_reproducible() {
    let texts = |dir: &TempDir| -> Vec<String> {
        read_state(dir).thoughts.iter().map(|t| t.text.clone()).collect()
    };

    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    for dir in [&a, &b] {
        let mut orch = Orchestrator::from_config(local_config(dir), EventBus::default()).unwrap();
        run_ticks(&mut orch, 4).await;
    }
    assert_eq!(texts(&a), texts(&b));

    let task_a = read_state(&a).tasks_completed.last().unwrap().clone();
    let task_b = read_state(&b).tasks_completed.last().unwrap().clone();
    assert_eq!(task_a.novelty, task_b.novelty);
}

#[tokio::test]
async fn unwritable_state_is_fatal() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "x").unwrap();
    let mut config = local_config(&dir);
    config.paths.state_file = blocker.join("state.json").display().to_string();

    let err = match Orchestrator::from_config(config, EventBus::default()) {
        Ok(_) => panic!("expected a storage failure"),
        Err(e) => e,
    };
    let err = err.downcast_ref::<LoopError>().unwrap();
    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn store_round_trips_committed_snapshot() {
    let dir = TempDir::new().unwrap();
    let config = local_config(&dir);
    let store = StateStore::new(state_path(&dir), config.ring_caps, 0.85);
    let mut snap = store.empty();
    let id = snap.next_thought_id();
    snap.thoughts.push(Thought {
        id,
        created_at: chrono::Utc::now(),
        kind: ThoughtKind::Reflection,
        text: "x".into(),
        source: Source::TemplateBank,
        tags: Default::default(),
        metrics: [("level".to_string(), 0.1 + 0.2)].into_iter().collect(),
    });
    store.commit(&snap).unwrap();
    assert_eq!(store.load().unwrap().snapshot, snap);
}

#[tokio::test]
async fn slow_remote_stays_inside_the_tick_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.provider = ProviderMode::Remote;
    config.api_key = Secret::new("sk-test");
    config.endpoint_url = format!("{}/v1/chat/completions", server.uri());
    config.sinks.file = false;
    config.cadences.task_every_n_ticks = 1;
    config.thresholds.circuit_breaker_failures = 2;
    config.timeouts.remote_s = 1;
    config.timeouts.tick_budget_s = 1;
    config.timeouts.task_max_ms = 1000;

    let mut orch = Orchestrator::from_config(config, EventBus::default()).unwrap();
    let started = Instant::now();
    run_ticks(&mut orch, 3).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let snap = orch.snapshot();
    let sources: Vec<Source> = snap.thoughts.iter().map(|t| t.source).collect();
    assert_eq!(sources, vec![Source::Fallback, Source::Fallback, Source::TemplateBank]);
    assert_eq!(orch.provider().remote_attempts(), 2);
    assert_eq!(orch.provider().circuit_state(), CircuitState::Open);

    // Budget-starved tasks are failed, never left running.
    let tasks: Vec<&Task> = snap.tasks_completed.iter().collect();
    assert_eq!(tasks.len(), 3);
    for t in &tasks[..2] {
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("task_timeout"));
    }
    assert_eq!(tasks[2].status, TaskStatus::Completed);

    let over_budget = snap
        .guidance
        .iter()
        .filter(|g| g.warning.as_deref() == Some("tick_budget_exceeded"))
        .count();
    assert_eq!(over_budget, 2);
}

#[tokio::test]
async fn failing_webhook_is_recorded_and_announced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.sinks.webhook = true;
    config.sinks.webhook_url = Secret::new(format!("{}/hooks/SECRETTOKEN", server.uri()));
    config.timeouts.webhook_retry_delay_ms = 10;

    let bus = EventBus::default();
    let mut sub = bus.subscribe();
    let mut orch = Orchestrator::from_config(config, bus).unwrap();
    run_ticks(&mut orch, 1).await;

    let snap = orch.snapshot();
    let record = snap
        .guidance
        .iter()
        .find(|g| g.warning.as_deref() == Some("sink_failed"))
        .expect("sink failure recorded");
    assert!(!record.ok);
    assert_eq!(record.provider, "webhook");
    assert!(!record.response_text_truncated.contains("SECRETTOKEN"));

    // The file sink still delivered.
    let thoughts_dir = dir.path().join("artifacts").join("thought");
    assert_eq!(std::fs::read_dir(thoughts_dir).unwrap().count(), 1);

    let mut kinds = Vec::new();
    let mut warning = None;
    while let Some(event) = sub.try_recv() {
        if event.kind == EventType::Warning {
            warning = Some(event.payload.clone());
        }
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![EventType::Thought, EventType::Warning, EventType::Status]
    );
    let warning = warning.unwrap();
    assert_eq!(warning["label"], "sink_failed");
    assert_eq!(warning["source"], "webhook");
    assert!(!warning.to_string().contains("SECRETTOKEN"));
}

#[tokio::test]
async fn busy_tick_coalesces_missed_ticks() {
    let dir = TempDir::new().unwrap();
    let mut config = local_config(&dir);
    config.cadences.thought_every_s = 0.05;
    config.cadences.task_every_n_ticks = 1;
    config.distributions.work_ms = [300, 300];
    config.timeouts.task_max_ms = 1000;

    let mut orch = Orchestrator::from_config(config, EventBus::default()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        trigger.cancel();
    });

    let summary = orch.run(cancel, None).await.unwrap();

    // ~20 periods elapse, but each 300 ms tick is followed by at most one
    // pending tick; the rest are merged.
    assert!((2..=4).contains(&summary.ticks), "ticks {}", summary.ticks);
    assert!(summary.coalesced >= 10, "coalesced {}", summary.coalesced);
    // The last tick may be cut short by the shutdown before its thought.
    let ids: Vec<u64> = read_state(&dir).thoughts.iter().map(|t| t.id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
    assert!(ids.len() as u64 + 1 >= summary.ticks);
}

#[tokio::test]
async fn out_of_range_state_is_quarantined() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(state_path(&dir), local_config(&dir).ring_caps, 0.85);
    let mut value = serde_json::to_value(store.empty()).unwrap();
    value["consciousness"]["level"] = serde_json::json!(1.5);
    std::fs::write(state_path(&dir), value.to_string()).unwrap();

    let mut orch = Orchestrator::from_config(local_config(&dir), EventBus::default()).unwrap();
    assert_eq!(orch.snapshot().consciousness.level, 0.85);
    run_ticks(&mut orch, 5).await;

    let ev = orch.snapshot().evolutions.last().unwrap().clone();
    assert!(ev.level_after >= ev.level_before);
    assert!(orch
        .snapshot()
        .guidance
        .iter()
        .any(|g| g.warning.as_deref() == Some("state_corrupt")));
}
