//! Engine configuration.
//!
//! Every threshold the engine applies lives here with its default value, so a
//! deployment can tune them from a JSON file without touching code. Missing
//! keys fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, Result};

/// Approximate length of one degree of latitude (km).
const KM_PER_DEGREE: f64 = 111.0;

/// Grid layout and stop proximity for [`crate::StopSpatialIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Grid cells per degree of latitude/longitude.
    /// Default: 200.0 (~500m cells near the equator)
    pub cells_per_degree: f64,

    /// Maximum distance for a fix to count as "at" a stop (km).
    /// Default: 0.05 (50 meters)
    pub proximity_threshold_km: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cells_per_degree: 200.0,
            proximity_threshold_km: 0.05,
        }
    }
}

/// Data-quality filter for candidate arc crossings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    /// Minimum time between the two stop fixes (seconds).
    /// Default: 5.0
    pub min_elapsed_secs: f64,

    /// Minimum distance between the two fixes (km).
    /// Default: 0.01 (10 meters)
    pub min_distance_km: f64,

    /// Maximum plausible speed for an urban bus (km/h).
    /// Default: 120.0
    pub max_speed_kmh: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_elapsed_secs: 5.0,
            min_distance_km: 0.01,
            max_speed_kmh: 120.0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub grid: GridConfig,
    pub quality: QualityGate,

    /// Size of the local worker pool. `None` uses the host core count.
    pub worker_threads: Option<usize>,

    /// Request timeout for remote workers (seconds).
    /// Default: 30
    pub remote_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            quality: QualityGate::default(),
            worker_threads: None,
            remote_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load a (possibly partial) configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let cells = self.grid.cells_per_degree;
        if !cells.is_finite() || cells <= 0.0 {
            return Err(EngineError::Config(format!(
                "grid.cells_per_degree must be positive, got {}",
                cells
            )));
        }
        let threshold = self.grid.proximity_threshold_km;
        if threshold.is_nan() || threshold < 0.0 {
            return Err(EngineError::Config(format!(
                "grid.proximity_threshold_km must not be negative, got {}",
                threshold
            )));
        }
        // The 3x3 neighbourhood scan only sees one cell in each direction.
        let cell_km = KM_PER_DEGREE / cells;
        if threshold > cell_km {
            return Err(EngineError::Config(format!(
                "grid.proximity_threshold_km ({}) exceeds the grid cell size (~{:.3} km)",
                threshold, cell_km
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(EngineError::Config("worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Resolved local pool size.
    pub fn pool_size(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
