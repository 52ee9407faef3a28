//! Error types for the speed engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Stop lookups were attempted before `set_stops`.
    #[error("Stop index not initialized: call set_stops before querying stops or detecting arcs")]
    NotInitialized,

    /// A remote worker could not complete a task.
    #[error("Remote worker {worker} failed: {reason}")]
    RemoteWorker { worker: String, reason: String },

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a failed remote dispatch.
    pub fn remote(worker: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::RemoteWorker {
            worker: worker.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::remote("http://10.0.0.7:9000", "connection refused");
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(err.to_string().contains("connection refused"));
        assert!(EngineError::NotInitialized.to_string().contains("set_stops"));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let err = EngineError::io(
            "data/stops.csv",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("data/stops.csv"));
    }
}
