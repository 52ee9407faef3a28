//! Merging partial results into one [`GlobalResult`].
//!
//! Everything here is a sum or a set union, so the order partials arrive in
//! does not change the result.

use std::collections::HashSet;
use std::time::Instant;

use log::info;

use crate::task::{GlobalResult, PartialResult};
use crate::ArcId;

/// Wall-clock spans of one batch, measured by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimings {
    /// When the batch started
    pub started: Instant,
    /// Partitioning events into tasks
    pub separation_ms: u64,
    /// Handing tasks to workers
    pub distribution_ms: u64,
    /// Waiting for every task's result
    pub consolidation_ms: u64,
}

impl PhaseTimings {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            separation_ms: 0,
            distribution_ms: 0,
            consolidation_ms: 0,
        }
    }
}

/// Combine partial results.
///
/// The global average is the mean of per-arc speeds over every task
/// (`Σ filtered_speed_sum / Σ filtered_count`), not a mean of per-task
/// averages. Unique arcs are counted over the partials' events, ignoring
/// arc id 0. Pool and worker counts are left for the caller to fill in.
pub fn merge(partials: &[PartialResult], timings: &PhaseTimings) -> GlobalResult {
    let total_events: u64 = partials.iter().map(|p| p.event_count).sum();
    let filtered_speed_sum: f64 = partials.iter().map(|p| p.filtered_speed_sum).sum();
    let filtered_count: u64 = partials.iter().map(|p| p.filtered_count).sum();

    let unique_arcs: HashSet<ArcId> = partials
        .iter()
        .flat_map(|p| p.events.iter())
        .map(|e| e.arc_id)
        .filter(|id| *id > 0)
        .collect();

    let global_avg_speed_kmh = if filtered_count == 0 {
        0.0
    } else {
        filtered_speed_sum / filtered_count as f64
    };

    let result = GlobalResult {
        total_events,
        total_unique_arcs: unique_arcs.len() as u64,
        task_count: partials.len() as u32,
        global_avg_speed_kmh,
        total_processing_time_ms: timings.started.elapsed().as_millis() as u64,
        separation_time_ms: timings.separation_ms,
        distribution_time_ms: timings.distribution_ms,
        consolidation_time_ms: timings.consolidation_ms,
        ..GlobalResult::default()
    };

    info!(
        "[Consolidate] {} tasks: {} events, {} arcs, avg={:.2}km/h",
        result.task_count, result.total_events, result.total_unique_arcs, result.global_avg_speed_kmh
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::process_task;
    use crate::task::partition;
    use crate::{ArcCrossingEvent, Stop};

    fn events() -> Vec<ArcCrossingEvent> {
        let stops = [
            Stop::new(1, 3.4500, -76.5300),
            Stop::new(2, 3.4515, -76.5300),
            Stop::new(3, 3.4530, -76.5300),
            Stop::new(4, 3.4545, -76.5310),
        ];
        let mut all = Vec::new();
        for i in 0..40i64 {
            let from = &stops[(i % 3) as usize];
            let to = &stops[(i % 3 + 1) as usize];
            all.push(ArcCrossingEvent::between(from, to, i * 45_000));
        }
        all
    }

    fn partials(events: &[ArcCrossingEvent], num_tasks: usize) -> Vec<PartialResult> {
        partition(events, num_tasks)
            .iter()
            .map(|t| process_task(t, 120.0))
            .collect()
    }

    #[test]
    fn test_merge_empty() {
        let result = merge(&[], &PhaseTimings::start());
        assert_eq!(result.total_events, 0);
        assert_eq!(result.total_unique_arcs, 0);
        assert_eq!(result.task_count, 0);
        assert_eq!(result.global_avg_speed_kmh, 0.0);
    }

    #[test]
    fn test_totals_are_sums() {
        let parts = partials(&events(), 4);
        let result = merge(&parts, &PhaseTimings::start());
        let expected: u64 = parts.iter().map(|p| p.event_count).sum();
        assert_eq!(result.total_events, expected);
        assert_eq!(result.total_events, 40);
        assert_eq!(result.task_count, 4);
    }

    #[test]
    fn test_global_average_is_mean_of_arc_speeds() {
        let parts = partials(&events(), 3);
        let sum: f64 = parts.iter().map(|p| p.filtered_speed_sum).sum();
        let count: u64 = parts.iter().map(|p| p.filtered_count).sum();
        let result = merge(&parts, &PhaseTimings::start());
        assert!((result.global_avg_speed_kmh - sum / count as f64).abs() < 1e-12);
    }

    #[test]
    fn test_unique_arcs_independent_of_partitioning() {
        let all = events();
        for k in 1..=10 {
            let result = merge(&partials(&all, k), &PhaseTimings::start());
            assert_eq!(result.total_unique_arcs, 3, "num_tasks={}", k);
        }
    }

    #[test]
    fn test_zero_arc_id_not_counted() {
        let mut all = events();
        all[0].arc_id = 0;
        all[1].arc_id = 0;
        let result = merge(&partials(&all, 2), &PhaseTimings::start());
        // later events still cover all three arcs
        assert_eq!(result.total_unique_arcs, 3);

        let only_zero = vec![ArcCrossingEvent { arc_id: 0, ..all[0] }];
        let result = merge(&partials(&only_zero, 1), &PhaseTimings::start());
        assert_eq!(result.total_unique_arcs, 0);
    }

    #[test]
    fn test_merge_order_irrelevant() {
        let parts = partials(&events(), 5);
        let mut reversed = parts.clone();
        reversed.reverse();
        let timings = PhaseTimings::start();
        let a = merge(&parts, &timings);
        let b = merge(&reversed, &timings);
        assert_eq!(a.total_events, b.total_events);
        assert_eq!(a.total_unique_arcs, b.total_unique_arcs);
        assert!((a.global_avg_speed_kmh - b.global_avg_speed_kmh).abs() < 1e-12);
    }

    #[test]
    fn test_timings_copied() {
        let timings = PhaseTimings {
            separation_ms: 3,
            distribution_ms: 5,
            consolidation_ms: 7,
            ..PhaseTimings::start()
        };
        let result = merge(&[], &timings);
        assert_eq!(
            (result.separation_time_ms, result.distribution_time_ms, result.consolidation_time_ms),
            (3, 5, 7)
        );
    }
}
