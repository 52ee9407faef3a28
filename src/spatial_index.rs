//! Grid-bucketed nearest-stop lookup.
//!
//! Stops are bucketed into square cells of `1 / cells_per_degree` degrees
//! (~500m with the default of 200). A query only looks at its own cell and
//! the 8 neighbours, which is enough as long as the proximity threshold is
//! smaller than one cell.
//!
//! The index is read-only once built. Rebuild it before concurrent readers
//! start; wrap it in an `Arc` to share it.

use std::collections::HashMap;

use log::info;

use crate::config::GridConfig;
use crate::geo_utils::haversine_km;
use crate::{Stop, StopId};

/// Grid coordinate
type CellCoord = (i32, i32);

/// Nearest-stop index over a fixed stop set.
#[derive(Debug, Clone)]
pub struct StopSpatialIndex {
    config: GridConfig,
    stops: HashMap<StopId, Stop>,
    cells: HashMap<CellCoord, Vec<StopId>>,
}

impl StopSpatialIndex {
    /// Create an empty index.
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            stops: HashMap::new(),
            cells: HashMap::new(),
        }
    }

    /// Build an index over `stops`.
    pub fn build(stops: &[Stop], config: GridConfig) -> Self {
        let mut index = Self::new(config);
        index.rebuild(stops);
        index
    }

    /// Clear and repopulate both the stop map and the grid buckets.
    ///
    /// A stop id seen twice keeps its last coordinates.
    pub fn rebuild(&mut self, stops: &[Stop]) {
        self.stops.clear();
        self.cells.clear();

        for stop in stops {
            if let Some(previous) = self.stops.insert(stop.id, *stop) {
                let old_cell = self.to_grid_coords(previous.lat, previous.lon);
                if let Some(bucket) = self.cells.get_mut(&old_cell) {
                    bucket.retain(|id| *id != stop.id);
                }
            }
            let cell = self.to_grid_coords(stop.lat, stop.lon);
            self.cells.entry(cell).or_default().push(stop.id);
        }
        self.cells.retain(|_, bucket| !bucket.is_empty());

        info!(
            "[StopIndex] Indexed {} stops into {} cells",
            self.stops.len(),
            self.cells.len()
        );
    }

    /// Convert lat/lon to grid coordinates
    fn to_grid_coords(&self, lat: f64, lon: f64) -> CellCoord {
        let row = (lat * self.config.cells_per_degree).floor() as i32;
        let col = (lon * self.config.cells_per_degree).floor() as i32;
        (row, col)
    }

    /// Closest stop strictly within the proximity threshold, if any.
    ///
    /// Scans the query cell and its 8 neighbours. On equal distances the
    /// first stop found wins.
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<StopId> {
        self.nearest_with_distance(lat, lon).map(|(id, _)| id)
    }

    /// Like [`nearest`](Self::nearest), also returning the distance in km.
    pub fn nearest_with_distance(&self, lat: f64, lon: f64) -> Option<(StopId, f64)> {
        let (row, col) = self.to_grid_coords(lat, lon);
        let threshold = self.config.proximity_threshold_km;
        let mut best: Option<(StopId, f64)> = None;

        for d_row in -1..=1 {
            for d_col in -1..=1 {
                let Some(bucket) = self.cells.get(&(row + d_row, col + d_col)) else {
                    continue;
                };
                for stop_id in bucket {
                    let Some(stop) = self.stops.get(stop_id) else {
                        continue;
                    };
                    let distance = haversine_km(lat, lon, stop.lat, stop.lon);
                    if distance >= threshold {
                        continue;
                    }
                    if best.map_or(true, |(_, d)| distance < d) {
                        best = Some((*stop_id, distance));
                    }
                }
            }
        }

        best
    }

    /// Look up a stop by id.
    pub fn stop(&self, id: StopId) -> Option<Stop> {
        self.stops.get(&id).copied()
    }

    /// All indexed stops, sorted by id.
    pub fn stops(&self) -> Vec<Stop> {
        let mut stops: Vec<Stop> = self.stops.values().copied().collect();
        stops.sort_by_key(|s| s.id);
        stops
    }

    /// Number of indexed stops.
    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Number of non-empty grid cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }
}
