//! Rolling performance metrics over recently completed tasks.
//!
//! Recomputed only when a task reaches `completed`. Failed tasks sit in the
//! same history ring but never contribute to the aggregates.

use crate::types::{PerformanceMetrics, Task, TaskStatus};
use chrono::{DateTime, Duration, Utc};

/// Number of most recent completed tasks the means are taken over.
pub const WINDOW: usize = 10;

/// Recompute aggregates from the task history (oldest first).
///
/// `breakthrough_count` is carried in, not derived: it is a run counter that
/// survives ring eviction.
pub fn recompute<'a, I>(tasks: I, breakthrough_count: u64, now: DateTime<Utc>) -> PerformanceMetrics
where
    I: DoubleEndedIterator<Item = &'a Task>,
{
    let completed: Vec<&Task> = tasks
        .rev()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();

    let hour_ago = now - Duration::hours(1);
    let tasks_per_hour = completed
        .iter()
        .filter(|t| t.completed_at.is_some_and(|at| at > hour_ago && at <= now))
        .count() as u32;

    let recent = &completed[..completed.len().min(WINDOW)];
    let mean_novelty = mean(recent.iter().map(|t| t.novelty));
    let mean_quality = mean(recent.iter().map(|t| t.quality));
    let mean_creativity = mean(recent.iter().map(|t| creativity_index(t)));
    let last_quality = recent.first().map(|t| t.quality).unwrap_or(0.0);

    let excellence_score =
        (0.3 * mean_novelty + 0.3 * last_quality + 0.4 * mean_creativity).clamp(0.0, 1.0);

    PerformanceMetrics {
        tasks_per_hour,
        mean_novelty,
        mean_quality,
        breakthrough_count,
        excellence_score,
    }
}

pub fn creativity_index(task: &Task) -> f64 {
    (task.novelty + task.quality) / 2.0
}

/// Arithmetic mean; 0 when empty.
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
