//! Task state machine.
//!
//! ```text
//! pending --start--> running --ok--> completed
//!                       |
//!                       +--err--> failed
//! ```
//!
//! Any other transition is rejected with `InvalidTransition`.

use crate::agent::sampler::Sampler;
use crate::config::schema::Distributions;
use crate::error::{LoopError, LoopResult};
use crate::types::{Task, TaskScores, TaskStatus};
use chrono::Utc;

/// Error recorded when the loop shuts down under a running task.
pub const SHUTDOWN: &str = "shutdown";
/// Error recorded when simulated work outlives its cap.
pub const TASK_TIMEOUT: &str = "task_timeout";

/// A fresh `pending` task.
pub fn new_task(id: u64, description: impl Into<String>) -> Task {
    Task {
        id,
        created_at: Utc::now(),
        description: description.into(),
        status: TaskStatus::Pending,
        started_at: None,
        completed_at: None,
        quality: 0.0,
        novelty: 0.0,
        impact: 0.0,
        breakthrough: false,
        error: None,
    }
}

fn transition(task: &mut Task, to: TaskStatus) -> LoopResult<()> {
    let allowed = matches!(
        (task.status, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
    );
    if !allowed {
        return Err(LoopError::InvalidTransition {
            task_id: task.id,
            from: task.status.to_string(),
            to: to.to_string(),
        });
    }
    task.status = to;
    Ok(())
}

pub fn start(task: &mut Task) -> LoopResult<()> {
    transition(task, TaskStatus::Running)?;
    task.started_at = Some(Utc::now());
    Ok(())
}

/// `running -> completed`, recording scores and the breakthrough flag.
pub fn complete(task: &mut Task, scores: TaskScores, breakthrough_threshold: f64) -> LoopResult<()> {
    transition(task, TaskStatus::Completed)?;
    task.completed_at = Some(Utc::now());
    task.quality = scores.quality;
    task.novelty = scores.novelty;
    task.impact = scores.impact;
    task.breakthrough = scores.novelty >= breakthrough_threshold;
    Ok(())
}

pub fn fail(task: &mut Task, error: &str) -> LoopResult<()> {
    transition(task, TaskStatus::Failed)?;
    task.completed_at = Some(Utc::now());
    task.error = Some(error.to_string());
    Ok(())
}

/// Draw scores from the configured uniform ranges.
pub fn sample_scores(sampler: &mut dyn Sampler, dist: &Distributions) -> TaskScores {
    TaskScores {
        quality: sampler.uniform(dist.quality[0], dist.quality[1]),
        novelty: sampler.uniform(dist.novelty[0], dist.novelty[1]),
        impact: sampler.uniform(dist.impact[0], dist.impact[1]),
    }
}
