//! Per-bus arc detection.
//!
//! Each bus is tracked by a small state record: the last stop it was seen at
//! (if any) and its last position/time. A ping that lands on a different stop
//! than the last one forms a candidate arc from the last recorded position to
//! the current one. Candidates that pass the [`QualityGate`] are folded into
//! the [`ArcStateStore`] and emitted as [`ArcCrossingEvent`]s.
//!
//! ## States
//!
//! - no history: the bus has never been seen
//! - at a stop / in transit: `last_stop_id` is `Some(stop)` once the bus has
//!   been near a stop and keeps that value until the next stop; position and
//!   time keep updating in between
//!
//! State lives for one detector (one ingestion pass) and is never shared
//! between detectors.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::arc_state::{ArcStateStore, MIN_TRAVERSAL_HOURS, MIN_TRAVERSAL_KM};
use crate::config::QualityGate;
use crate::geo_utils::{haversine_km, ms_to_hours};
use crate::spatial_index::StopSpatialIndex;
use crate::{arc_id, ArcCrossingEvent, BusId, GpsPing, StopId};

/// Last known whereabouts of one bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusTrajectoryState {
    /// Last stop the bus was detected at; `None` until it reaches one.
    pub last_stop_id: Option<StopId>,
    pub last_lat: f64,
    pub last_lon: f64,
    pub last_timestamp_ms: i64,
}

impl BusTrajectoryState {
    fn first_fix(ping: &GpsPing) -> Self {
        Self {
            last_stop_id: None,
            last_lat: ping.lat,
            last_lon: ping.lon,
            last_timestamp_ms: ping.timestamp_ms,
        }
    }
}

/// Why a candidate arc was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooSoon,
    TooClose,
    TooFast,
}

/// Counters for one detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStats {
    /// Pings seen, including invalid ones
    pub pings: u64,
    /// Pings dropped for out-of-range coordinates
    pub invalid: u64,
    /// Valid pings near a stop
    pub at_stop: u64,
    /// Candidate arcs that became events
    pub accepted: u64,
    /// Candidates dropped for elapsed time under the minimum
    pub rejected_too_soon: u64,
    /// Candidates dropped for distance under the minimum
    pub rejected_too_close: u64,
    /// Candidates dropped for implausible speed
    pub rejected_too_fast: u64,
}

impl DetectionStats {
    /// Total candidates dropped by the quality gate.
    pub fn rejected(&self) -> u64 {
        self.rejected_too_soon + self.rejected_too_close + self.rejected_too_fast
    }

    fn count_rejection(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::TooSoon => self.rejected_too_soon += 1,
            Rejection::TooClose => self.rejected_too_close += 1,
            Rejection::TooFast => self.rejected_too_fast += 1,
        }
    }
}

/// Turns a stream of GPS pings into arc crossings.
pub struct TrajectoryDetector {
    index: Arc<StopSpatialIndex>,
    store: Arc<ArcStateStore>,
    gate: QualityGate,
    buses: HashMap<BusId, BusTrajectoryState>,
    stats: DetectionStats,
}

impl TrajectoryDetector {
    pub fn new(index: Arc<StopSpatialIndex>, store: Arc<ArcStateStore>, gate: QualityGate) -> Self {
        Self {
            index,
            store,
            gate,
            buses: HashMap::new(),
            stats: DetectionStats::default(),
        }
    }

    /// Feed one ping; returns the arc crossing it completes, if any.
    pub fn observe(&mut self, ping: &GpsPing) -> Option<ArcCrossingEvent> {
        self.stats.pings += 1;
        if !ping.is_valid() {
            self.stats.invalid += 1;
            return None;
        }

        let stop = self.index.nearest(ping.lat, ping.lon);
        if stop.is_some() {
            self.stats.at_stop += 1;
        }

        let state = match self.buses.entry(ping.bus_id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                slot.insert(BusTrajectoryState {
                    last_stop_id: stop,
                    ..BusTrajectoryState::first_fix(ping)
                });
                return None;
            }
        };

        let mut event = None;
        if let (Some(current), Some(previous)) = (stop, state.last_stop_id) {
            if current != previous {
                match evaluate(&self.gate, state, ping) {
                    Ok((distance_km, time_hours, speed)) => {
                        // The store's own floors hold even under a lax gate.
                        if self
                            .store
                            .record_traversal(previous, current, distance_km, time_hours)
                            .is_some()
                        {
                            self.stats.accepted += 1;
                            event = Some(ArcCrossingEvent {
                                from_stop_id: previous,
                                to_stop_id: current,
                                from_lat: state.last_lat,
                                from_lon: state.last_lon,
                                to_lat: ping.lat,
                                to_lon: ping.lon,
                                timestamp_ms: ping.timestamp_ms,
                                arc_id: arc_id(previous, current),
                                speed_kmh: Some(speed),
                            });
                        }
                    }
                    Err(rejection) => {
                        debug!(
                            "[Detector] Rejected {}->{} bus={} ({:?})",
                            previous, current, ping.bus_id, rejection
                        );
                        self.stats.count_rejection(rejection);
                    }
                }
            }
        }

        if stop.is_some() {
            state.last_stop_id = stop;
        }
        state.last_lat = ping.lat;
        state.last_lon = ping.lon;
        state.last_timestamp_ms = ping.timestamp_ms;

        event
    }

    /// Lazily detect arcs over `pings`, in input order.
    pub fn detect<I>(&mut self, pings: I) -> Detections<'_, I::IntoIter>
    where
        I: IntoIterator<Item = GpsPing>,
    {
        Detections {
            detector: self,
            pings: pings.into_iter(),
        }
    }

    /// Tracking state of one bus.
    pub fn state(&self, bus_id: BusId) -> Option<&BusTrajectoryState> {
        self.buses.get(&bus_id)
    }

    /// Forget one bus, so its next ping starts from scratch.
    pub fn reset_bus(&mut self, bus_id: BusId) {
        self.buses.remove(&bus_id);
    }

    /// Number of buses seen so far.
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats
    }
}

/// Apply the quality gate to the hop from `state` to `ping`.
///
/// Returns `(distance_km, time_hours, raw_speed_kmh)` on success.
fn evaluate(
    gate: &QualityGate,
    state: &BusTrajectoryState,
    ping: &GpsPing,
) -> Result<(f64, f64, f64), Rejection> {
    let distance_km = haversine_km(state.last_lat, state.last_lon, ping.lat, ping.lon);
    let elapsed_ms = ping.timestamp_ms.saturating_sub(state.last_timestamp_ms);
    let elapsed_secs = elapsed_ms as f64 / 1000.0;
    let time_hours = ms_to_hours(elapsed_ms);

    if elapsed_secs < gate.min_elapsed_secs || time_hours <= MIN_TRAVERSAL_HOURS {
        return Err(Rejection::TooSoon);
    }
    if distance_km < gate.min_distance_km || distance_km <= MIN_TRAVERSAL_KM {
        return Err(Rejection::TooClose);
    }

    let speed = distance_km / time_hours;
    if speed > gate.max_speed_kmh {
        return Err(Rejection::TooFast);
    }

    Ok((distance_km, time_hours, speed))
}

/// Iterator returned by [`TrajectoryDetector::detect`].
pub struct Detections<'d, I> {
    detector: &'d mut TrajectoryDetector,
    pings: I,
}

impl<I> Iterator for Detections<'_, I>
where
    I: Iterator<Item = GpsPing>,
{
    type Item = ArcCrossingEvent;

    fn next(&mut self) -> Option<Self::Item> {
        for ping in self.pings.by_ref() {
            if let Some(event) = self.detector.observe(&ping) {
                return Some(event);
            }
        }
        None
    }
}
