//! Generated input for benchmarks and tests.
//!
//! Two generators, both deterministic for a given seed:
//!
//! - [`SyntheticBatch`] draws arc crossings between random stop pairs, for
//!   exercising the scheduler without a real datagram file.
//! - [`route_pings`] drives one bus along a stop sequence at a fixed speed,
//!   producing one ping per stop, for exercising the detector.
//!
//! ```rust
//! use arc_speed::synthetic::SyntheticBatch;
//! use arc_speed::Stop;
//!
//! let stops = vec![Stop::new(1, 3.45, -76.53), Stop::new(2, 3.46, -76.53)];
//! let events = SyntheticBatch { count: 100, seed: 7, base_timestamp_ms: 0 }.generate(&stops);
//! assert_eq!(events.len(), 100);
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{haversine_km, MS_PER_HOUR};
use crate::{ArcCrossingEvent, BusId, GpsPing, Stop};

/// Parameters for a batch of random arc crossings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticBatch {
    /// Number of events to generate.
    pub count: usize,
    /// RNG seed for deterministic reproduction.
    pub seed: u64,
    /// Timestamp of the first event; each following event is 1s later.
    pub base_timestamp_ms: i64,
}

impl SyntheticBatch {
    /// Generate `count` crossings between distinct random stops.
    ///
    /// Returns nothing when fewer than two stops are given.
    pub fn generate(&self, stops: &[Stop]) -> Vec<ArcCrossingEvent> {
        if stops.len() < 2 {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(self.seed);

        (0..self.count)
            .map(|i| {
                let from = rng.gen_range(0..stops.len());
                // Shift the second draw so the pair is never the same stop
                let to = (from + rng.gen_range(1..stops.len())) % stops.len();
                ArcCrossingEvent::between(
                    &stops[from],
                    &stops[to],
                    self.base_timestamp_ms + i as i64 * 1000,
                )
            })
            .collect()
    }
}

/// Shorthand for [`SyntheticBatch::generate`].
pub fn generate_datagrams(count: usize, stops: &[Stop], seed: u64, base_timestamp_ms: i64) -> Vec<ArcCrossingEvent> {
    SyntheticBatch {
        count,
        seed,
        base_timestamp_ms,
    }
    .generate(stops)
}

/// Pings for one bus visiting `stops` in order at a constant `speed_kmh`.
///
/// One ping is placed exactly on each stop; the first is at `start_ms`.
pub fn route_pings(bus_id: BusId, stops: &[Stop], speed_kmh: f64, start_ms: i64) -> Vec<GpsPing> {
    let mut pings = Vec::with_capacity(stops.len());
    let mut t = start_ms as f64;

    for (i, stop) in stops.iter().enumerate() {
        if i > 0 {
            let prev = &stops[i - 1];
            let km = haversine_km(prev.lat, prev.lon, stop.lat, stop.lon);
            t += km / speed_kmh * MS_PER_HOUR;
        }
        pings.push(GpsPing::new(bus_id, stop.lat, stop.lon, t.round() as i64));
    }
    pings
}
