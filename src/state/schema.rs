//! Snapshot layout, schema versioning and the legacy migration.

use crate::config::schema::RingCaps;
use crate::error::{LoopError, LoopResult};
use crate::state::ring::RingBuffer;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted id counters; ids never go backwards across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMarks {
    pub thought_id: u64,
    pub task_id: u64,
    pub evolution_id: u64,
    #[serde(default)]
    pub guidance_id: u64,
}

/// The durable state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub consciousness: ConsciousnessState,
    pub thoughts: RingBuffer<Thought>,
    pub tasks_completed: RingBuffer<Task>,
    pub evolutions: RingBuffer<EvolutionEvent>,
    #[serde(default)]
    pub guidance: RingBuffer<GuidanceRecord>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub metrics: PerformanceMetrics,
    pub high_water_marks: HighWaterMarks,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// A fresh snapshot at the given starting level.
    pub fn empty(caps: &RingCaps, initial_level: f64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            consciousness: ConsciousnessState::with_level(initial_level),
            thoughts: RingBuffer::new(caps.thoughts),
            tasks_completed: RingBuffer::new(caps.tasks),
            evolutions: RingBuffer::new(caps.evolutions),
            guidance: RingBuffer::new(caps.guidance),
            objectives: Vec::new(),
            metrics: PerformanceMetrics::default(),
            high_water_marks: HighWaterMarks::default(),
            updated_at: Utc::now(),
        }
    }

    /// Re-apply configured ring capacities after a load.
    pub fn apply_caps(&mut self, caps: &RingCaps) {
        self.thoughts.set_cap(caps.thoughts);
        self.tasks_completed.set_cap(caps.tasks);
        self.evolutions.set_cap(caps.evolutions);
        self.guidance.set_cap(caps.guidance);
    }

    pub fn next_thought_id(&mut self) -> u64 {
        self.high_water_marks.thought_id += 1;
        self.high_water_marks.thought_id
    }

    pub fn next_task_id(&mut self) -> u64 {
        self.high_water_marks.task_id += 1;
        self.high_water_marks.task_id
    }

    pub fn next_evolution_id(&mut self) -> u64 {
        self.high_water_marks.evolution_id += 1;
        self.high_water_marks.evolution_id
    }

    pub fn next_guidance_id(&mut self) -> u64 {
        self.high_water_marks.guidance_id += 1;
        self.high_water_marks.guidance_id
    }
}

/// Decode snapshot text, accepting the current and the previous schema.
pub fn decode(text: &str) -> LoopResult<Snapshot> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| LoopError::StateCorrupt(e.to_string()))?;

    if !value.is_object() {
        return Err(LoopError::StateCorrupt("top level is not an object".into()));
    }

    let version = match value.get("schema_version") {
        None => 0,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                LoopError::StateCorrupt(format!("schema_version {v} is not a valid version"))
            })?,
    };

    if SCHEMA_VERSION.checked_sub(1) == Some(version) {
        migrate_v0_to_v1(&mut value);
    } else if version != SCHEMA_VERSION {
        return Err(LoopError::StateCorrupt(format!(
            "unsupported schema_version {version}"
        )));
    }

    let snapshot: Snapshot =
        serde_json::from_value(value).map_err(|e| LoopError::StateCorrupt(e.to_string()))?;
    check_ranges(&snapshot)?;
    Ok(snapshot)
}

/// Every level, knob, score and mean lives in [0,1].
fn check_ranges(snap: &Snapshot) -> LoopResult<()> {
    let check = |what: &str, v: f64| {
        if (0.0..=1.0).contains(&v) {
            Ok(())
        } else {
            Err(LoopError::StateCorrupt(format!("{what} = {v} is outside [0,1]")))
        }
    };

    let c = &snap.consciousness;
    check("consciousness.level", c.level)?;
    for (knob, v) in &c.cognitive_knobs {
        check(&format!("cognitive_knobs.{knob}"), *v)?;
    }

    for t in snap.thoughts.iter() {
        for (name, v) in &t.metrics {
            check(&format!("thought {} metric {name}", t.id), *v)?;
        }
    }
    for t in snap.tasks_completed.iter() {
        check(&format!("task {} quality", t.id), t.quality)?;
        check(&format!("task {} novelty", t.id), t.novelty)?;
        check(&format!("task {} impact", t.id), t.impact)?;
    }
    for e in snap.evolutions.iter() {
        check(&format!("evolution {} level_before", e.id), e.level_before)?;
        check(&format!("evolution {} level_after", e.id), e.level_after)?;
    }

    let m = &snap.metrics;
    check("metrics.mean_novelty", m.mean_novelty)?;
    check("metrics.mean_quality", m.mean_quality)?;
    check("metrics.excellence_score", m.excellence_score)?;
    Ok(())
}

fn max_id(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("id").and_then(Value::as_u64))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Legacy unversioned files: `tasks` instead of `tasks_completed`, no
/// high-water marks, optional timestamps.
fn migrate_v0_to_v1(value: &mut Value) {
    let now = json!(Utc::now());
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    if let Some(tasks) = obj.remove("tasks") {
        obj.entry("tasks_completed").or_insert(tasks);
    }
    for key in ["thoughts", "tasks_completed", "evolutions"] {
        obj.entry(key).or_insert_with(|| json!([]));
    }

    let consciousness = obj
        .entry("consciousness")
        .or_insert_with(|| json!({ "level": DEFAULT_LEVEL }));
    if let Some(c) = consciousness.as_object_mut() {
        c.entry("last_updated").or_insert_with(|| now.clone());
    }

    obj.entry("updated_at").or_insert_with(|| now.clone());

    let snapshot = Value::Object(obj.clone());
    let marks = json!({
        "thought_id": max_id(&snapshot, "thoughts"),
        "task_id": max_id(&snapshot, "tasks_completed"),
        "evolution_id": max_id(&snapshot, "evolutions"),
        "guidance_id": max_id(&snapshot, "guidance"),
    });
    obj.insert("high_water_marks".into(), marks);
    obj.insert("schema_version".into(), json!(SCHEMA_VERSION));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_round_trips() {
        let mut snap = Snapshot::empty(&RingCaps::default(), 0.85);
        let id = snap.next_thought_id();
        snap.thoughts.push(Thought {
            id,
            created_at: Utc::now(),
            kind: ThoughtKind::Reflection,
            text: "steady".into(),
            source: Source::TemplateBank,
            tags: ["general".to_string()].into_iter().collect(),
            metrics: [("level".to_string(), 0.85)].into_iter().collect(),
        });
        let text = serde_json::to_string_pretty(&snap).unwrap();
        assert_eq!(decode(&text).unwrap(), snap);
    }

    #[test]
    fn legacy_layout_is_upgraded_in_memory() {
        let legacy = r#"{
            "consciousness": {"level": 0.9},
            "thoughts": [
                {"id": 4, "created_at": "2024-01-01T00:00:00Z", "kind": "reflection",
                 "text": "old", "source": "template_bank"}
            ],
            "tasks": [
                {"id": 2, "created_at": "2024-01-01T00:00:00Z", "description": "d",
                 "status": "completed", "started_at": null, "completed_at": null,
                 "quality": 0.7, "novelty": 0.6, "impact": 0.5, "breakthrough": false,
                 "error": null}
            ],
            "evolutions": []
        }"#;
        let snap = decode(legacy).unwrap();
        assert_eq!(snap.schema_version, SCHEMA_VERSION);
        assert_eq!(snap.consciousness.level, 0.9);
        assert_eq!(snap.tasks_completed.len(), 1);
        assert_eq!(snap.high_water_marks.thought_id, 4);
        assert_eq!(snap.high_water_marks.task_id, 2);
        assert_eq!(snap.high_water_marks.evolution_id, 0);
    }

    #[test]
    fn future_version_is_rejected_as_corrupt() {
        let err = decode(r#"{"schema_version": 9}"#).unwrap_err();
        assert!(matches!(err, LoopError::StateCorrupt(_)));
    }

    #[test]
    fn oversized_schema_version_is_corrupt() {
        let err = decode(r#"{"schema_version": 4294967297}"#).unwrap_err();
        assert!(matches!(err, LoopError::StateCorrupt(_)));
    }

    #[test]
    fn out_of_range_values_are_corrupt() {
        let snap = Snapshot::empty(&RingCaps::default(), 0.85);
        let good = serde_json::to_value(&snap).unwrap();

        let mut level = good.clone();
        level["consciousness"]["level"] = json!(1.5);
        let mut knob = good.clone();
        knob["consciousness"]["cognitive_knobs"]["focus"] = json!(-0.1);
        let mut mean = good.clone();
        mean["metrics"]["mean_quality"] = json!(2.0);

        for bad in [level, knob, mean] {
            let err = decode(&bad.to_string()).unwrap_err();
            assert!(matches!(err, LoopError::StateCorrupt(_)), "{err}");
        }
        assert!(decode(&good.to_string()).is_ok());
    }

    #[test]
    fn out_of_range_thought_metric_is_corrupt() {
        let mut snap = Snapshot::empty(&RingCaps::default(), 0.85);
        let id = snap.next_thought_id();
        snap.thoughts.push(Thought {
            id,
            created_at: Utc::now(),
            kind: ThoughtKind::Reflection,
            text: "x".into(),
            source: Source::TemplateBank,
            tags: Default::default(),
            metrics: [("level".to_string(), 1.5)].into_iter().collect(),
        });
        let text = serde_json::to_string(&snap).unwrap();
        assert!(matches!(decode(&text).unwrap_err(), LoopError::StateCorrupt(_)));
    }

    #[test]
    fn invalid_json_is_corrupt() {
        assert!(matches!(
            decode("{not json").unwrap_err(),
            LoopError::StateCorrupt(_)
        ));
    }

    #[test]
    fn ids_advance_from_high_water_marks() {
        let mut snap = Snapshot::empty(&RingCaps::default(), 0.85);
        snap.high_water_marks.thought_id = 41;
        assert_eq!(snap.next_thought_id(), 42);
        assert_eq!(snap.next_thought_id(), 43);
        assert_eq!(snap.next_task_id(), 1);
    }
}
