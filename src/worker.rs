//! Worker abstraction and the master's set of remote workers.
//!
//! Local and remote workers share the [`TaskWorker`] trait; the scheduler
//! neither knows nor cares which one it is talking to, except that a failed
//! call is retried on a [`LocalWorker`](crate::LocalWorker).

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::info;

use crate::error::Result;
use crate::task::{PartialResult, Task};

/// Registry handle for a worker.
pub type WorkerId = u32;

/// Something that can turn a [`Task`] into a [`PartialResult`].
///
/// Implementations must be side-effect free beyond their own computation, so
/// running a task twice is harmless.
pub trait TaskWorker: Send + Sync {
    /// Stable identity; registering two workers with the same name is a no-op.
    fn name(&self) -> String;

    fn process_task(&self, task: &Task) -> Result<PartialResult>;
}

/// Active set of remote workers.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, Arc<dyn TaskWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker and return its id.
    ///
    /// A worker whose name is already registered keeps its existing id.
    pub fn register(&self, worker: Arc<dyn TaskWorker>) -> WorkerId {
        let name = worker.name();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some((&id, _)) = inner.workers.iter().find(|(_, w)| w.name() == name) {
            return id;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.workers.insert(id, worker);
        info!(
            "[Registry] Registered worker {} as #{} ({} active)",
            name,
            id,
            inner.workers.len()
        );
        id
    }

    /// Remove a worker. Returns false if the id was not registered.
    pub fn unregister(&self, id: WorkerId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.workers.remove(&id) {
            Some(worker) => {
                info!(
                    "[Registry] Unregistered worker {} (#{}, {} active)",
                    worker.name(),
                    id,
                    inner.workers.len()
                );
                true
            }
            None => false,
        }
    }

    /// Number of active workers.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).workers.len()
    }

    /// Workers in id order, detached from the registry.
    pub fn snapshot(&self) -> Vec<Arc<dyn TaskWorker>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .values()
            .cloned()
            .collect()
    }

    /// `(id, name)` of every active worker.
    pub fn list(&self) -> Vec<(WorkerId, String)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .iter()
            .map(|(id, w)| (*id, w.name()))
            .collect()
    }
}
