//! Per-task speed computation.
//!
//! [`process_task`] is a pure function of the task: it reads nothing but the
//! events the task carries and writes nothing shared. The running per-arc
//! state was already updated during detection.

use std::collections::BTreeMap;
use std::time::Instant;

use log::debug;

use crate::arc_state::{MIN_TRAVERSAL_HOURS, MIN_TRAVERSAL_KM};
use crate::error::Result;
use crate::geo_utils::{clamp_speed, haversine_km, ms_to_hours, speed_kmh};
use crate::task::{PartialResult, Task};
use crate::worker::TaskWorker;
use crate::{ArcCrossingEvent, ArcId};

/// Compute per-arc speeds for one task.
///
/// Events are grouped by arc. For each arc:
/// - endpoints closer than 1 m: the events' own `speed_kmh` values are
///   summed into the weighted sum (missing speeds count as 0)
/// - otherwise the span between the earliest and latest event gives one
///   speed, clamped to `[0, max_speed_kmh]`, weighted by the arc's event
///   count; arcs whose span is too short contribute nothing
pub fn process_task(task: &Task, max_speed_kmh: f64) -> PartialResult {
    let start = Instant::now();

    let mut groups: BTreeMap<ArcId, Vec<&ArcCrossingEvent>> = BTreeMap::new();
    for event in &task.events {
        groups.entry(event.arc_id).or_default().push(event);
    }

    let mut weighted_speed_sum = 0.0;
    let mut total_distance_km = 0.0;
    let mut total_time_hours = 0.0;
    let mut filtered_speed_sum = 0.0;
    let mut filtered_count = 0u64;

    for group in groups.values_mut() {
        let first = group[0];
        let n = group.len() as f64;
        let distance_km = haversine_km(first.from_lat, first.from_lon, first.to_lat, first.to_lon);

        if distance_km < MIN_TRAVERSAL_KM {
            weighted_speed_sum += group.iter().map(|e| e.speed_kmh.unwrap_or(0.0)).sum::<f64>();
            continue;
        }

        group.sort_by_key(|e| e.timestamp_ms);
        let span_ms = group[group.len() - 1].timestamp_ms.saturating_sub(group[0].timestamp_ms);
        let time_hours = ms_to_hours(span_ms);
        if time_hours <= MIN_TRAVERSAL_HOURS {
            continue;
        }

        let speed = clamp_speed(speed_kmh(distance_km, time_hours), max_speed_kmh);
        weighted_speed_sum += speed * n;
        total_distance_km += distance_km * n;
        total_time_hours += time_hours * n;
        filtered_speed_sum += speed;
        filtered_count += 1;
    }

    let event_count = task.events.len() as u64;
    let avg_speed_kmh = if event_count == 0 {
        0.0
    } else {
        weighted_speed_sum / event_count as f64
    };
    let processing_time_ms = start.elapsed().as_millis() as u64;

    debug!(
        "[Compute] task {}: {} events, {} arcs, {} with speed, avg={:.2}km/h in {}ms",
        task.task_id,
        event_count,
        groups.len(),
        filtered_count,
        avg_speed_kmh,
        processing_time_ms
    );

    PartialResult {
        task_id: task.task_id,
        arc_count: groups.len() as u32,
        event_count,
        weighted_speed_sum,
        total_distance_km,
        total_time_hours,
        avg_speed_kmh,
        filtered_speed_sum,
        filtered_count,
        processing_time_ms,
        events: task.events.clone(),
    }
}

/// In-process worker; also the fallback for failed remote workers.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    max_speed_kmh: f64,
}

impl Default for LocalWorker {
    fn default() -> Self {
        Self::new(120.0)
    }
}

impl LocalWorker {
    pub fn new(max_speed_kmh: f64) -> Self {
        Self { max_speed_kmh }
    }

    /// Infallible form of [`TaskWorker::process_task`].
    pub fn compute(&self, task: &Task) -> PartialResult {
        process_task(task, self.max_speed_kmh)
    }
}

impl TaskWorker for LocalWorker {
    fn name(&self) -> String {
        "local".to_string()
    }

    fn process_task(&self, task: &Task) -> Result<PartialResult> {
        Ok(self.compute(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stop;

    fn stop_a() -> Stop {
        Stop::new(1, 3.4500, -76.5300)
    }

    fn stop_b() -> Stop {
        Stop::new(2, 3.4515, -76.5300)
    }

    fn task(events: Vec<ArcCrossingEvent>) -> Task {
        Task { task_id: 0, events }
    }

    #[test]
    fn test_empty_task() {
        let result = process_task(&task(vec![]), 120.0);
        assert_eq!(result.event_count, 0);
        assert_eq!(result.arc_count, 0);
        assert_eq!(result.avg_speed_kmh, 0.0);
        assert_eq!(result.filtered_count, 0);
    }

    #[test]
    fn test_extreme_span_saturates() {
        let events = vec![
            ArcCrossingEvent::between(&stop_a(), &stop_b(), i64::MIN),
            ArcCrossingEvent::between(&stop_a(), &stop_b(), i64::MAX),
        ];
        let result = process_task(&task(events), 120.0);
        assert_eq!(result.filtered_count, 1);
        assert!(result.filtered_speed_sum >= 0.0 && result.filtered_speed_sum < 1e-6);
    }

    #[test]
    fn test_single_arc_speed_from_span() {
        // Three crossings of a 0.1668 km arc spread over one minute
        let events = vec![
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 60_000),
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 0),
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 30_000),
        ];
        let result = process_task(&task(events), 120.0);

        assert_eq!(result.arc_count, 1);
        assert_eq!(result.event_count, 3);
        assert_eq!(result.filtered_count, 1);
        assert!((result.filtered_speed_sum - 10.0).abs() < 0.05);
        assert!((result.weighted_speed_sum - 3.0 * result.filtered_speed_sum).abs() < 1e-9);
        assert!((result.avg_speed_kmh - result.filtered_speed_sum).abs() < 1e-9);
        assert!((result.total_time_hours - 3.0 / 60.0).abs() < 1e-9);
        assert_eq!(result.events.len(), 3);
    }

    #[test]
    fn test_single_event_arc_is_skipped() {
        // One event has no time span, so it adds to event_count but not to speeds
        let events = vec![ArcCrossingEvent::between(&stop_a(), &stop_b(), 1_000)];
        let result = process_task(&task(events), 120.0);
        assert_eq!(result.arc_count, 1);
        assert_eq!(result.event_count, 1);
        assert_eq!(result.filtered_count, 0);
        assert_eq!(result.avg_speed_kmh, 0.0);
    }

    #[test]
    fn test_speed_is_clamped() {
        let far = Stop::new(3, 3.5400, -76.5300); // ~10 km north of stop A
        let events = vec![
            ArcCrossingEvent::between(&stop_a(), &far, 0),
            ArcCrossingEvent::between(&stop_a(), &far, 60_000),
        ];
        let result = process_task(&task(events), 120.0);
        assert_eq!(result.filtered_speed_sum, 120.0);
        assert_eq!(result.avg_speed_kmh, 120.0);
    }

    #[test]
    fn test_degenerate_geometry_uses_embedded_speed() {
        let a = stop_a();
        let same_place = Stop::new(9, a.lat, a.lon);
        let events = vec![
            ArcCrossingEvent::between(&a, &same_place, 0).with_speed(20.0),
            ArcCrossingEvent::between(&a, &same_place, 10_000).with_speed(40.0),
            ArcCrossingEvent::between(&a, &same_place, 20_000),
        ];
        let result = process_task(&task(events), 120.0);
        assert_eq!(result.weighted_speed_sum, 60.0);
        assert_eq!(result.avg_speed_kmh, 20.0);
        assert_eq!(result.filtered_count, 0);
    }

    #[test]
    fn test_arcs_counted_separately() {
        let c = Stop::new(3, 3.4530, -76.5300);
        let events = vec![
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 0),
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 60_000),
            ArcCrossingEvent::between(&stop_b(), &c, 0),
            ArcCrossingEvent::between(&stop_b(), &c, 120_000),
        ];
        let result = process_task(&task(events), 120.0);
        assert_eq!(result.arc_count, 2);
        assert_eq!(result.filtered_count, 2);
        // ~10 km/h and ~5 km/h
        assert!((result.filtered_speed_sum - 15.0).abs() < 0.1);
    }

    #[test]
    fn test_local_worker_matches_function() {
        let events = vec![
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 0),
            ArcCrossingEvent::between(&stop_a(), &stop_b(), 60_000),
        ];
        let t = task(events);
        let worker = LocalWorker::default();
        let via_trait = TaskWorker::process_task(&worker, &t).unwrap();
        let direct = process_task(&t, 120.0);
        assert_eq!(via_trait.filtered_speed_sum, direct.filtered_speed_sum);
        assert_eq!(via_trait.event_count, direct.event_count);
    }
}
