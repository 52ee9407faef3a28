//! Per-arc speed benchmark over raw stop visits.
//!
//! An independent cross-check for the detector: every ping near a stop is a
//! visit, each bus's visits are sorted by time, and any two consecutive
//! visits matching a requested arc count as one trip. No quality gate is
//! applied beyond the minimum traversal span.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::arc_state::{MIN_TRAVERSAL_HOURS, MIN_TRAVERSAL_KM};
use crate::geo_utils::{haversine_km, ms_to_hours};
use crate::spatial_index::StopSpatialIndex;
use crate::{BusId, GpsPing, StopId};

/// Benchmark outcome for one arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcBenchmark {
    pub from_stop_id: StopId,
    pub to_stop_id: StopId,
    /// Mean trip speed; 0 when there were no trips
    pub avg_speed_kmh: f64,
    pub trips: usize,
}

#[derive(Debug, Clone, Copy)]
struct Visit {
    stop_id: StopId,
    lat: f64,
    lon: f64,
    timestamp_ms: i64,
}

/// Average trip speed for each `(from, to)` in `arcs`, in the same order.
///
/// Trips with a span under the traversal minimum count with speed 0.
pub fn arc_benchmark(
    index: &StopSpatialIndex,
    pings: &[GpsPing],
    arcs: &[(StopId, StopId)],
) -> Vec<ArcBenchmark> {
    let mut visits: HashMap<BusId, Vec<Visit>> = HashMap::new();
    for ping in pings.iter().filter(|p| p.is_valid()) {
        if let Some(stop_id) = index.nearest(ping.lat, ping.lon) {
            visits.entry(ping.bus_id).or_default().push(Visit {
                stop_id,
                lat: ping.lat,
                lon: ping.lon,
                timestamp_ms: ping.timestamp_ms,
            });
        }
    }
    for bus_visits in visits.values_mut() {
        bus_visits.sort_by_key(|v| v.timestamp_ms);
    }

    arcs.iter()
        .map(|&(from, to)| {
            let speeds: Vec<f64> = visits
                .values()
                .flat_map(|v| v.windows(2))
                .filter(|w| w[0].stop_id == from && w[1].stop_id == to)
                .filter(|w| w[1].timestamp_ms > w[0].timestamp_ms)
                .map(|w| trip_speed(&w[0], &w[1]))
                .collect();

            let avg_speed_kmh = if speeds.is_empty() {
                0.0
            } else {
                speeds.iter().sum::<f64>() / speeds.len() as f64
            };
            debug!(
                "[Benchmark] {}->{}: {:.2}km/h over {} trips",
                from,
                to,
                avg_speed_kmh,
                speeds.len()
            );

            ArcBenchmark {
                from_stop_id: from,
                to_stop_id: to,
                avg_speed_kmh,
                trips: speeds.len(),
            }
        })
        .collect()
}

fn trip_speed(from: &Visit, to: &Visit) -> f64 {
    let km = haversine_km(from.lat, from.lon, to.lat, to.lon);
    let hours = ms_to_hours(to.timestamp_ms - from.timestamp_ms);
    if hours > MIN_TRAVERSAL_HOURS && km > MIN_TRAVERSAL_KM {
        km / hours
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;
    use crate::synthetic::route_pings;
    use crate::Stop;

    fn stops() -> Vec<Stop> {
        vec![
            Stop::new(1, 3.4500, -76.5300),
            Stop::new(2, 3.4530, -76.5300),
            Stop::new(3, 3.4560, -76.5300),
        ]
    }

    #[test]
    fn test_average_over_buses() {
        let s = stops();
        let index = StopSpatialIndex::build(&s, GridConfig::default());
        let mut pings = route_pings(1, &s, 20.0, 0);
        pings.extend(route_pings(2, &s, 40.0, 1_000_000));

        let results = arc_benchmark(&index, &pings, &[(1, 2), (2, 3), (3, 1)]);
        assert_eq!(results[0].trips, 2);
        assert!((results[0].avg_speed_kmh - 30.0).abs() < 0.1);
        assert_eq!(results[1].trips, 2);
        assert_eq!(results[2].trips, 0);
        assert_eq!(results[2].avg_speed_kmh, 0.0);
    }

    #[test]
    fn test_unsorted_input_is_sorted_per_bus() {
        let s = stops();
        let index = StopSpatialIndex::build(&s, GridConfig::default());
        let mut pings = route_pings(1, &s[..2], 20.0, 0);
        pings.reverse();

        let results = arc_benchmark(&index, &pings, &[(1, 2), (2, 1)]);
        assert_eq!(results[0].trips, 1);
        assert_eq!(results[1].trips, 0);
    }

    #[test]
    fn test_pings_away_from_stops_ignored() {
        let s = stops();
        let index = StopSpatialIndex::build(&s, GridConfig::default());
        let pings = vec![
            GpsPing::new(1, 3.4500, -76.5300, 0),
            GpsPing::new(1, 3.4515, -76.5300, 30_000),
            GpsPing::new(1, 3.4530, -76.5300, 60_000),
        ];
        let results = arc_benchmark(&index, &pings, &[(1, 2)]);
        assert_eq!(results[0].trips, 1);
    }
}
