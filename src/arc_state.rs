//! Running speed statistics per arc.
//!
//! Entries are created lazily on the first traversal and never removed; the
//! store lives as long as the engine. [`ArcStateStore::record_traversal`] is
//! the only way to mutate an entry, and each call is one locked
//! read-modify-write on that entry alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::{clamp_speed, speed_kmh};
use crate::{arc_id, ArcId, StopId};

/// Traversals shorter than this (hours, ~0.36s) are ignored.
pub const MIN_TRAVERSAL_HOURS: f64 = 0.0001;

/// Traversals shorter than this (km, 1m) are ignored.
pub const MIN_TRAVERSAL_KM: f64 = 0.001;

/// Accumulated statistics for one arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcRunningStats {
    pub arc_id: ArcId,
    pub from_stop_id: StopId,
    pub to_stop_id: StopId,
    pub total_distance_km: f64,
    pub total_time_hours: f64,
    pub traversal_count: u64,
    /// `total_distance_km / total_time_hours`
    pub average_speed_kmh: f64,
}

impl ArcRunningStats {
    fn new(from_stop_id: StopId, to_stop_id: StopId) -> Self {
        Self {
            arc_id: arc_id(from_stop_id, to_stop_id),
            from_stop_id,
            to_stop_id,
            total_distance_km: 0.0,
            total_time_hours: 0.0,
            traversal_count: 0,
            average_speed_kmh: 0.0,
        }
    }
}

/// Concurrent map of per-arc running statistics.
#[derive(Debug)]
pub struct ArcStateStore {
    max_speed_kmh: f64,
    arcs: RwLock<HashMap<ArcId, Arc<Mutex<ArcRunningStats>>>>,
}

impl Default for ArcStateStore {
    fn default() -> Self {
        Self::new(120.0)
    }
}

impl ArcStateStore {
    /// Create an empty store; `max_speed_kmh` bounds the reported instantaneous speed.
    pub fn new(max_speed_kmh: f64) -> Self {
        Self {
            max_speed_kmh,
            arcs: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one traversal into the arc's running totals.
    ///
    /// No-op (returns `None`) if `time_hours <= 0.0001` or `distance_km <= 0.001`.
    /// Otherwise returns the instantaneous speed clamped to `[0, max_speed]`.
    /// The totals always accumulate the unclamped distance and time, so the
    /// running average is not bounded by the clamp.
    pub fn record_traversal(
        &self,
        from_stop_id: StopId,
        to_stop_id: StopId,
        distance_km: f64,
        time_hours: f64,
    ) -> Option<f64> {
        if time_hours <= MIN_TRAVERSAL_HOURS || distance_km <= MIN_TRAVERSAL_KM {
            return None;
        }

        let speed = clamp_speed(speed_kmh(distance_km, time_hours), self.max_speed_kmh);
        let entry = self.entry(from_stop_id, to_stop_id);
        let mut stats = entry.lock().unwrap_or_else(PoisonError::into_inner);

        stats.total_distance_km += distance_km;
        stats.total_time_hours += time_hours;
        stats.traversal_count += 1;
        stats.average_speed_kmh = stats.total_distance_km / stats.total_time_hours;

        debug!(
            "[ArcState] {}->{} dist={:.3}km time={:.4}h speed={:.2}km/h avg={:.2}km/h n={}",
            from_stop_id,
            to_stop_id,
            distance_km,
            time_hours,
            speed,
            stats.average_speed_kmh,
            stats.traversal_count
        );

        Some(speed)
    }

    fn entry(&self, from_stop_id: StopId, to_stop_id: StopId) -> Arc<Mutex<ArcRunningStats>> {
        let id = arc_id(from_stop_id, to_stop_id);
        {
            let arcs = self.arcs.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = arcs.get(&id) {
                return Arc::clone(entry);
            }
        }
        let mut arcs = self.arcs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            arcs.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(ArcRunningStats::new(from_stop_id, to_stop_id)))),
        )
    }

    /// Current statistics for one arc.
    pub fn get(&self, from_stop_id: StopId, to_stop_id: StopId) -> Option<ArcRunningStats> {
        let arcs = self.arcs.read().unwrap_or_else(PoisonError::into_inner);
        arcs.get(&arc_id(from_stop_id, to_stop_id))
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Copy of every arc's statistics, sorted by arc id.
    pub fn snapshot(&self) -> Vec<ArcRunningStats> {
        let arcs = self.arcs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ArcRunningStats> = arcs
            .values()
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        all.sort_by_key(|s| s.arc_id);
        all
    }

    /// Number of arcs with at least one traversal.
    pub fn len(&self) -> usize {
        self.arcs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ignores_tiny_traversals() {
        let store = ArcStateStore::default();
        assert_eq!(store.record_traversal(1, 2, 0.5, 0.0001), None);
        assert_eq!(store.record_traversal(1, 2, 0.001, 0.5), None);
        assert!(store.is_empty());
        assert_eq!(store.get(1, 2), None);
    }

    #[test]
    fn test_single_traversal() {
        let store = ArcStateStore::default();
        let speed = store.record_traversal(1, 2, 0.167, 1.0 / 60.0).unwrap();
        assert!((speed - 10.02).abs() < 0.01);

        let stats = store.get(1, 2).unwrap();
        assert_eq!(stats.arc_id, 10_002);
        assert_eq!(stats.traversal_count, 1);
        assert!((stats.average_speed_kmh - 10.02).abs() < 0.01);
    }

    #[test]
    fn test_clamp_only_affects_returned_speed() {
        // 10 km in 60 s is 600 km/h
        let store = ArcStateStore::default();
        let speed = store.record_traversal(3, 4, 10.0, 60.0 / 3600.0).unwrap();
        assert_eq!(speed, 120.0);

        let stats = store.get(3, 4).unwrap();
        assert_eq!(stats.total_distance_km, 10.0);
        assert!((stats.average_speed_kmh - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_is_ratio_of_totals() {
        let store = ArcStateStore::default();
        store.record_traversal(1, 2, 1.0, 0.1);
        store.record_traversal(1, 2, 3.0, 0.1);
        let stats = store.get(1, 2).unwrap();
        // (1 + 3) / (0.1 + 0.1), not the mean of 10 and 30 weighted otherwise
        assert!((stats.average_speed_kmh - 20.0).abs() < 1e-9);
        assert_eq!(stats.traversal_count, 2);
    }

    #[test]
    fn test_directions_are_distinct_arcs() {
        let store = ArcStateStore::default();
        store.record_traversal(1, 2, 1.0, 0.1);
        store.record_traversal(2, 1, 1.0, 0.05);
        assert_eq!(store.len(), 2);
        let ids: Vec<ArcId> = store.snapshot().iter().map(|s| s.arc_id).collect();
        assert_eq!(ids, vec![10_002, 20_001]);
    }

    #[test]
    fn test_concurrent_traversals_same_arc() {
        let store = Arc::new(ArcStateStore::default());
        let threads = 8;
        let per_thread = 250;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let d = 0.5 + (t as f64) * 0.1 + (i % 7) as f64 * 0.01;
                        let h = 0.01 + (i % 3) as f64 * 0.005;
                        store.record_traversal(7, 8, d, h);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut sum_d = 0.0;
        let mut sum_h = 0.0;
        for t in 0..threads {
            for i in 0..per_thread {
                sum_d += 0.5 + (t as f64) * 0.1 + (i % 7) as f64 * 0.01;
                sum_h += 0.01 + (i % 3) as f64 * 0.005;
            }
        }

        let stats = store.get(7, 8).unwrap();
        assert_eq!(stats.traversal_count, (threads * per_thread) as u64);
        assert!((stats.total_distance_km - sum_d).abs() < 1e-6);
        assert!((stats.average_speed_kmh - sum_d / sum_h).abs() < 1e-6);
    }
}
