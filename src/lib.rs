//! # Arc Speed
//!
//! Distributed inference of average bus travel speed per directed stop-to-stop
//! segment ("arc") from raw GPS telemetry.
//!
//! This library provides:
//! - Grid-bucketed nearest-stop lookup over a fixed stop set
//! - A per-bus trajectory state machine that turns GPS pings into arc crossings
//! - A concurrent running-average store per arc
//! - A master/worker scheduler that splits a batch into self-contained tasks,
//!   dispatches them to local threads or remote peers, and consolidates the
//!   partial results
//!
//! ## Features
//!
//! - **`remote`** (default) - HTTP/JSON transport for remote workers and the master endpoint
//!
//! ## Quick Start
//!
//! ```rust
//! use arc_speed::{EngineConfig, GpsPing, SpeedEngine, Stop};
//!
//! let engine = SpeedEngine::new(EngineConfig::default()).unwrap();
//! engine.set_stops(&[
//!     Stop::new(1, 3.4500, -76.5300),
//!     Stop::new(2, 3.4515, -76.5300),
//! ]);
//!
//! let pings = vec![
//!     GpsPing::new(7, 3.4500, -76.5300, 0),
//!     GpsPing::new(7, 3.4515, -76.5300, 60_000),
//! ];
//! let (events, stats) = engine.detect(pings).unwrap();
//! assert_eq!(events.len(), 1);
//! assert_eq!(stats.accepted, 1);
//!
//! let result = engine.process_datagrams(events, 4);
//! assert_eq!(result.total_events, 1);
//! assert_eq!(result.total_unique_arcs, 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{EngineError, Result};

// Engine configuration (thresholds, pool size, transport timeout)
pub mod config;
pub use config::{EngineConfig, GridConfig, QualityGate};

// Geographic utilities (haversine distance, speed clamp)
pub mod geo_utils;

// Nearest-stop lookup
pub mod spatial_index;
pub use spatial_index::StopSpatialIndex;

// Per-bus arc detection
pub mod trajectory;
pub use trajectory::{BusTrajectoryState, DetectionStats, TrajectoryDetector};

// Running speed statistics per arc
pub mod arc_state;
pub use arc_state::{ArcRunningStats, ArcStateStore};

// Tasks and results exchanged between master and workers
pub mod task;
pub use task::{partition, GlobalResult, PartialResult, Task};

// Per-task computation
pub mod compute;
pub use compute::{process_task, LocalWorker};

// Worker abstraction and registry
pub mod worker;
pub use worker::{TaskWorker, WorkerId, WorkerRegistry};

// Partitioning and dispatch
pub mod scheduler;
pub use scheduler::TaskScheduler;

// Merging partial results
pub mod consolidate;
pub use consolidate::{merge, PhaseTimings};

// Master facade
pub mod engine;
pub use engine::SpeedEngine;

// Record parsing for datagram and stop files
pub mod ingest;

// Generated datagrams for benchmarking
pub mod synthetic;

// Per-arc benchmark over stop visits
pub mod benchmark;
pub use benchmark::{arc_benchmark, ArcBenchmark};

// HTTP transport for remote workers
#[cfg(feature = "remote")]
pub mod remote;

#[cfg(feature = "remote")]
pub use remote::HttpWorker;

// ============================================================================
// Core Types
// ============================================================================

/// Stop identifier.
pub type StopId = u32;

/// Bus (vehicle) identifier.
pub type BusId = u32;

/// Arc identifier, see [`arc_id`].
pub type ArcId = u64;

/// Multiplier used to pack `(from, to)` into an [`ArcId`].
///
/// The encoding is only collision-free while every `to` stop id is below this value.
pub const ARC_ID_STRIDE: u64 = 10_000;

/// Encode a directed arc as `from * 10000 + to`.
///
/// Stop ids of 10 000 or more can collide with other arcs. Nothing rejects
/// them; [`SpeedEngine::set_stops`] logs a warning when a stop set has any.
#[inline]
pub fn arc_id(from_stop_id: StopId, to_stop_id: StopId) -> ArcId {
    from_stop_id as u64 * ARC_ID_STRIDE + to_stop_id as u64
}

/// A bus stop with WGS84 coordinates.
///
/// # Example
/// ```
/// use arc_speed::Stop;
/// let stop = Stop::new(500_300, 3.4516, -76.5320);
/// assert_eq!(stop.id, 500_300);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub lat: f64,
    pub lon: f64,
}

impl Stop {
    /// Create a new stop.
    pub fn new(id: StopId, lat: f64, lon: f64) -> Self {
        Self { id, lat, lon }
    }
}

/// One timestamped position report from a bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPing {
    pub bus_id: BusId,
    pub lat: f64,
    pub lon: f64,
    pub timestamp_ms: i64,
}

impl GpsPing {
    /// Create a new ping.
    pub fn new(bus_id: BusId, lat: f64, lon: f64, timestamp_ms: i64) -> Self {
        Self { bus_id, lat, lon, timestamp_ms }
    }

    /// Check if the ping has usable coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
    }
}

/// A bus crossing from one stop to the next (a "datagram").
///
/// Carries replicated endpoint coordinates so a task holding it never needs
/// to look anything up while it is processed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArcCrossingEvent {
    pub from_stop_id: StopId,
    pub to_stop_id: StopId,
    pub from_lat: f64,
    pub from_lon: f64,
    pub to_lat: f64,
    pub to_lon: f64,
    /// Arrival time at `to_stop_id`
    pub timestamp_ms: i64,
    pub arc_id: ArcId,
    /// Speed measured by the producer, if any
    #[serde(default)]
    pub speed_kmh: Option<f64>,
}

impl ArcCrossingEvent {
    /// Build an event between two stops, deriving the arc id.
    pub fn between(from: &Stop, to: &Stop, timestamp_ms: i64) -> Self {
        Self {
            from_stop_id: from.id,
            to_stop_id: to.id,
            from_lat: from.lat,
            from_lon: from.lon,
            to_lat: to.lat,
            to_lon: to.lon,
            timestamp_ms,
            arc_id: arc_id(from.id, to.id),
            speed_kmh: None,
        }
    }

    /// Attach a producer-measured speed.
    pub fn with_speed(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = Some(speed_kmh);
        self
    }
}
