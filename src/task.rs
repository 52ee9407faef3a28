//! Units of work and their results.
//!
//! A [`Task`] owns a copy of its slice of events and nothing else, so any
//! worker, local or remote, can process it without touching shared state.
//! Tasks and results are built once and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::ArcCrossingEvent;

/// A self-contained batch of arc crossings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: u32,
    pub events: Vec<ArcCrossingEvent>,
}

/// Statistics computed by one worker for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub task_id: u32,
    /// Distinct arcs in the task
    pub arc_count: u32,
    pub event_count: u64,
    /// Sum of per-arc speed times the arc's event count
    pub weighted_speed_sum: f64,
    pub total_distance_km: f64,
    pub total_time_hours: f64,
    /// `weighted_speed_sum / event_count`
    pub avg_speed_kmh: f64,
    /// Sum of per-arc speeds, one term per arc with a usable time span
    pub filtered_speed_sum: f64,
    pub filtered_count: u64,
    pub processing_time_ms: u64,
    /// The task's original events, carried back for global arc deduplication
    pub events: Vec<ArcCrossingEvent>,
}

/// Consolidated result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalResult {
    pub total_events: u64,
    pub total_unique_arcs: u64,
    pub task_count: u32,
    /// Size of the local pool
    pub worker_count: u32,
    /// Remote workers registered when the batch was dispatched
    pub active_workers: u32,
    /// Mean of per-arc speeds across all tasks
    pub global_avg_speed_kmh: f64,
    pub total_processing_time_ms: u64,
    /// Time spent loading and detecting, when the batch came from a file
    pub load_time_ms: u64,
    pub separation_time_ms: u64,
    pub distribution_time_ms: u64,
    pub consolidation_time_ms: u64,
    /// Tasks re-run locally after their remote worker failed
    pub fallback_tasks: u32,
}

impl GlobalResult {
    /// Events processed per second of total processing time.
    pub fn throughput_eps(&self) -> f64 {
        if self.total_processing_time_ms == 0 {
            return 0.0;
        }
        self.total_events as f64 / self.total_processing_time_ms as f64 * 1000.0
    }
}

/// Split `events` into at most `num_tasks` contiguous tasks.
///
/// Chunks are `ceil(len / num_tasks)` long; the last one may be shorter and
/// trailing tasks that would start past the end are not created. Each task
/// gets its own copy of its slice. A `num_tasks` of 0 is treated as 1.
///
/// # Example
/// ```
/// use arc_speed::partition;
///
/// let tasks = partition(&[], 4);
/// assert!(tasks.is_empty());
/// ```
pub fn partition(events: &[ArcCrossingEvent], num_tasks: usize) -> Vec<Task> {
    let num_tasks = num_tasks.max(1);
    let chunk_size = events.len().div_ceil(num_tasks);
    if chunk_size == 0 {
        return Vec::new();
    }

    events
        .chunks(chunk_size)
        .take(num_tasks)
        .enumerate()
        .map(|(i, chunk)| Task {
            task_id: i as u32,
            events: chunk.to_vec(),
        })
        .collect()
}
