//! Master-side facade.
//!
//! [`SpeedEngine`] ties the pieces together: the stop index installed by
//! [`set_stops`](SpeedEngine::set_stops), the engine-lifetime arc store, the
//! remote worker registry and the scheduler's local pool. Every method takes
//! `&self`, so one engine can sit behind an `Arc` and serve concurrent
//! callers.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use log::{info, warn};

use crate::arc_state::{ArcRunningStats, ArcStateStore};
use crate::benchmark::{arc_benchmark, ArcBenchmark};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ingest;
use crate::scheduler::TaskScheduler;
use crate::spatial_index::StopSpatialIndex;
use crate::task::GlobalResult;
use crate::trajectory::{DetectionStats, TrajectoryDetector};
use crate::worker::{TaskWorker, WorkerId, WorkerRegistry};
use crate::{ArcCrossingEvent, GpsPing, Stop, StopId, ARC_ID_STRIDE};

/// The speed-inference master.
pub struct SpeedEngine {
    config: EngineConfig,
    index: RwLock<Option<Arc<StopSpatialIndex>>>,
    store: Arc<ArcStateStore>,
    registry: WorkerRegistry,
    scheduler: TaskScheduler,
}

impl SpeedEngine {
    /// Validate `config` and start the local pool.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = TaskScheduler::new(config.pool_size(), config.quality.max_speed_kmh)?;
        Ok(Self {
            store: Arc::new(ArcStateStore::new(config.quality.max_speed_kmh)),
            index: RwLock::new(None),
            registry: WorkerRegistry::new(),
            scheduler,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Stops
    // ------------------------------------------------------------------------

    /// Replace the stop set.
    ///
    /// A fresh index is built off to the side and swapped in; detections
    /// already running keep the index they started with.
    pub fn set_stops(&self, stops: &[Stop]) {
        let wide = stops.iter().filter(|s| s.id as u64 >= ARC_ID_STRIDE).count();
        if wide > 0 {
            warn!(
                "[Engine] {} of {} stop ids are >= {}; arc ids may collide",
                wide,
                stops.len(),
                ARC_ID_STRIDE
            );
        }
        let index = StopSpatialIndex::build(stops, self.config.grid.clone());
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(index));
    }

    /// Whether [`set_stops`](Self::set_stops) has been called.
    pub fn is_initialized(&self) -> bool {
        self.index.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn index(&self) -> Result<Arc<StopSpatialIndex>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::NotInitialized)
    }

    pub fn stop(&self, id: StopId) -> Result<Option<Stop>> {
        Ok(self.index()?.stop(id))
    }

    /// All stops, sorted by id.
    pub fn stops(&self) -> Result<Vec<Stop>> {
        Ok(self.index()?.stops())
    }

    pub fn nearest_stop(&self, lat: f64, lon: f64) -> Result<Option<StopId>> {
        Ok(self.index()?.nearest(lat, lon))
    }

    // ------------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------------

    /// Run one detection pass over `pings`, in order.
    ///
    /// Bus state starts empty and is dropped afterwards. Accepted crossings
    /// are also folded into the engine's arc store.
    pub fn detect<I>(&self, pings: I) -> Result<(Vec<ArcCrossingEvent>, DetectionStats)>
    where
        I: IntoIterator<Item = GpsPing>,
    {
        let mut detector =
            TrajectoryDetector::new(self.index()?, Arc::clone(&self.store), self.config.quality.clone());
        let events: Vec<ArcCrossingEvent> = detector.detect(pings).collect();
        let stats = detector.stats();

        info!(
            "[Detector] {} pings from {} buses: {} at a stop, {} arcs accepted, {} rejected, {} invalid",
            stats.pings,
            detector.bus_count(),
            stats.at_stop,
            stats.accepted,
            stats.rejected(),
            stats.invalid
        );

        Ok((events, stats))
    }

    /// Statistics for one arc.
    pub fn arc_state(&self, from_stop_id: StopId, to_stop_id: StopId) -> Option<ArcRunningStats> {
        self.store.get(from_stop_id, to_stop_id)
    }

    /// Every arc seen so far, sorted by arc id.
    pub fn arc_states(&self) -> Vec<ArcRunningStats> {
        self.store.snapshot()
    }

    /// Per-arc trip speeds over raw stop visits, see [`arc_benchmark`].
    pub fn benchmark_arcs(&self, pings: &[GpsPing], arcs: &[(StopId, StopId)]) -> Result<Vec<ArcBenchmark>> {
        let index = self.index()?;
        Ok(arc_benchmark(&index, pings, arcs))
    }

    // ------------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------------

    /// Split a batch into `num_tasks` tasks, run them and merge the results.
    pub fn process_datagrams(&self, events: Vec<ArcCrossingEvent>, num_tasks: usize) -> GlobalResult {
        self.scheduler.partition_and_dispatch(&events, num_tasks, &self.registry)
    }

    /// Load a datagram file, detect arcs and process them as one batch.
    ///
    /// `load_time_ms` in the result covers reading and detection.
    pub fn calculate_average_speed(
        &self,
        path: impl AsRef<Path>,
        max_count: Option<usize>,
        num_tasks: usize,
    ) -> Result<GlobalResult> {
        let path = path.as_ref();
        let load_start = Instant::now();
        // Fail before reading a large file.
        self.index()?;
        let pings = ingest::load_datagrams(path, max_count)?;
        let (events, _) = self.detect(pings)?;
        let load_time_ms = load_start.elapsed().as_millis() as u64;

        info!(
            "[Engine] Loaded {} arc crossings from {} in {}ms",
            events.len(),
            path.display(),
            load_time_ms
        );

        let mut result = self.process_datagrams(events, num_tasks);
        result.load_time_ms = load_time_ms;
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    pub fn register_worker(&self, worker: Arc<dyn TaskWorker>) -> WorkerId {
        self.registry.register(worker)
    }

    pub fn unregister_worker(&self, id: WorkerId) -> bool {
        self.registry.unregister(id)
    }

    /// Number of registered remote workers.
    pub fn worker_count(&self) -> usize {
        self.registry.count()
    }

    pub fn workers(&self) -> Vec<(WorkerId, String)> {
        self.registry.list()
    }

    /// Size of the local pool.
    pub fn pool_size(&self) -> usize {
        self.scheduler.pool_size()
    }
}
