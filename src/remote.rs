//! HTTP/JSON transport between master and workers.
//!
//! - [`HttpWorker`] is the master's proxy for one remote worker. It
//!   implements [`TaskWorker`], so the scheduler treats it like a local one.
//! - [`worker_router`] serves tasks on a worker process.
//! - [`master_router`] exposes a [`SpeedEngine`] to clients and lets
//!   workers register themselves.
//!
//! ## Routes
//!
//! | Process | Route | Body | Reply |
//! |---------|-------|------|-------|
//! | worker | `POST /tasks` | [`Task`] | [`PartialResult`] |
//! | worker | `GET /health` | | `ok` |
//! | master | `POST /workers` | [`RegisterRequest`] | [`RegisterResponse`] |
//! | master | `GET /workers` | | `[[id, url], ...]` |
//! | master | `DELETE /workers/:id` | | 204 / 404 |
//! | master | `GET /workers/count` | | [`WorkerCount`] |
//! | master | `POST /stops` | `[Stop]` | 204 |
//! | master | `POST /datagrams` | [`BatchRequest`] | [`GlobalResult`] |
//! | master | `GET /arcs` | | `[ArcRunningStats]` |
//!
//! Blocking work (task computation, whole batches) runs on tokio's blocking
//! pool, never on the async workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::arc_state::ArcRunningStats;
use crate::compute::LocalWorker;
use crate::engine::SpeedEngine;
use crate::error::{EngineError, Result};
use crate::task::{GlobalResult, PartialResult, Task};
use crate::worker::{TaskWorker, WorkerId};
use crate::{ArcCrossingEvent, Stop};

// ============================================================================
// Client side
// ============================================================================

/// Proxy for a worker reachable at `base_url`.
#[derive(Debug, Clone)]
pub struct HttpWorker {
    base_url: String,
    client: Client,
}

impl HttpWorker {
    /// Create a proxy; no connection is made until the first call.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        // Calls run on short-lived runtimes, so pooled connections would be
        // bound to a runtime that no longer exists.
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::remote(&base_url, e))?;
        Ok(Self { base_url, client })
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Send one task and wait for its result.
    pub async fn send_task(&self, task: &Task) -> Result<PartialResult> {
        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/tasks", self.base_url))
            .json(task)
            .send()
            .await
            .map_err(|e| EngineError::remote(&self.base_url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::remote(&self.base_url, format!("HTTP {}", status)));
        }

        let partial: PartialResult = response
            .json()
            .await
            .map_err(|e| EngineError::remote(&self.base_url, e))?;

        debug!(
            "[HttpWorker {}] task {} ({} events) round trip {:?}, compute {}ms",
            self.base_url,
            task.task_id,
            task.events.len(),
            start.elapsed(),
            partial.processing_time_ms
        );
        Ok(partial)
    }

    /// Whether the worker answers its health check.
    pub async fn health(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("[HttpWorker {}] health check failed: {}", self.base_url, e);
                false
            }
        }
    }
}

impl TaskWorker for HttpWorker {
    fn name(&self) -> String {
        self.base_url.clone()
    }

    /// Blocking call for use from the scheduler's pool threads.
    ///
    /// Must not be called from inside a tokio runtime.
    fn process_task(&self, task: &Task) -> Result<PartialResult> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::remote(&self.base_url, format!("runtime: {}", e)))?;
        rt.block_on(self.send_task(task))
    }
}

/// Health-check several workers concurrently, in input order.
pub async fn probe_workers(workers: &[HttpWorker]) -> Vec<bool> {
    futures::future::join_all(workers.iter().map(|w| w.health())).await
}

/// Announce a worker at `worker_url` to the master at `master_url`.
pub async fn register_with_master(master_url: &str, worker_url: &str, timeout: Duration) -> Result<WorkerId> {
    let master_url = master_url.trim_end_matches('/');
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::remote(master_url, e))?;

    let response = client
        .post(format!("{}/workers", master_url))
        .json(&RegisterRequest {
            url: worker_url.to_string(),
        })
        .send()
        .await
        .map_err(|e| EngineError::remote(master_url, e))?;

    if !response.status().is_success() {
        return Err(EngineError::remote(master_url, format!("HTTP {}", response.status())));
    }
    let body: RegisterResponse = response
        .json()
        .await
        .map_err(|e| EngineError::remote(master_url, e))?;

    info!("[Worker] Registered with {} as #{}", master_url, body.id);
    Ok(body.id)
}

// ============================================================================
// Server side
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCount {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<ArcCrossingEvent>,
    pub num_tasks: usize,
}

/// Error reply for handlers.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotInitialized => StatusCode::CONFLICT,
            EngineError::RemoteWorker { .. } | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("[Server] {}: {}", status, self.0);
        (status, self.0.to_string()).into_response()
    }
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(EngineError::ThreadPool(e.to_string())))
}

/// Routes for a worker process.
pub fn worker_router(worker: Arc<LocalWorker>) -> Router {
    Router::new()
        .route("/tasks", post(handle_task))
        .route("/health", get(|| async { "ok" }))
        .with_state(worker)
}

async fn handle_task(
    State(worker): State<Arc<LocalWorker>>,
    Json(task): Json<Task>,
) -> std::result::Result<Json<PartialResult>, ApiError> {
    let task_id = task.task_id;
    let partial = blocking(move || worker.compute(&task)).await?;
    info!(
        "[Worker] Task {}: {} events, {} arcs in {}ms",
        task_id, partial.event_count, partial.arc_count, partial.processing_time_ms
    );
    Ok(Json(partial))
}

/// Routes for the master process.
pub fn master_router(engine: Arc<SpeedEngine>) -> Router {
    Router::new()
        .route("/workers", post(handle_register).get(handle_list_workers))
        .route("/workers/count", get(handle_worker_count))
        .route("/workers/:id", delete(handle_unregister))
        .route("/stops", post(handle_set_stops))
        .route("/datagrams", post(handle_datagrams))
        .route("/arcs", get(handle_arcs))
        .with_state(engine)
}

async fn handle_register(
    State(engine): State<Arc<SpeedEngine>>,
    Json(request): Json<RegisterRequest>,
) -> std::result::Result<Json<RegisterResponse>, ApiError> {
    let timeout = Duration::from_secs(engine.config().remote_timeout_secs);
    let worker = HttpWorker::new(&request.url, timeout)?;
    if !worker.health().await {
        warn!("[Master] Worker {} did not answer its health check", request.url);
    }
    let id = engine.register_worker(Arc::new(worker));
    Ok(Json(RegisterResponse { id }))
}

async fn handle_list_workers(State(engine): State<Arc<SpeedEngine>>) -> Json<Vec<(WorkerId, String)>> {
    Json(engine.workers())
}

async fn handle_worker_count(State(engine): State<Arc<SpeedEngine>>) -> Json<WorkerCount> {
    Json(WorkerCount {
        count: engine.worker_count(),
    })
}

async fn handle_unregister(State(engine): State<Arc<SpeedEngine>>, Path(id): Path<WorkerId>) -> StatusCode {
    if engine.unregister_worker(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn handle_set_stops(
    State(engine): State<Arc<SpeedEngine>>,
    Json(stops): Json<Vec<Stop>>,
) -> std::result::Result<StatusCode, ApiError> {
    blocking(move || engine.set_stops(&stops)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_datagrams(
    State(engine): State<Arc<SpeedEngine>>,
    Json(request): Json<BatchRequest>,
) -> std::result::Result<Json<GlobalResult>, ApiError> {
    let result = blocking(move || engine.process_datagrams(request.events, request.num_tasks)).await?;
    Ok(Json(result))
}

async fn handle_arcs(State(engine): State<Arc<SpeedEngine>>) -> Json<Vec<ArcRunningStats>> {
    Json(engine.arc_states())
}

/// Bind `addr` and serve `router` until the process exits.
pub async fn serve(router: Router, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EngineError::io(addr.to_string(), e))?;
    info!("[Server] Listening on http://{}", addr);
    axum::serve(listener, router)
        .await
        .map_err(|e| EngineError::io(addr.to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let a = Stop::new(1, 3.4500, -76.5300);
        let b = Stop::new(2, 3.4515, -76.5300);
        Task {
            task_id: 3,
            events: vec![
                ArcCrossingEvent::between(&a, &b, 0),
                ArcCrossingEvent::between(&a, &b, 60_000),
            ],
        }
    }

    async fn spawn_worker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = worker_router(Arc::new(LocalWorker::default()));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_round_trip_matches_local() {
        let url = spawn_worker().await;
        let worker = HttpWorker::new(&url, Duration::from_secs(5)).unwrap();
        assert!(worker.health().await);

        let task = sample_task();
        let remote = worker.send_task(&task).await.unwrap();
        let local = LocalWorker::default().compute(&task);
        assert_eq!(remote.task_id, 3);
        assert_eq!(remote.event_count, local.event_count);
        assert_eq!(remote.filtered_speed_sum, local.filtered_speed_sum);
        assert_eq!(remote.weighted_speed_sum, local.weighted_speed_sum);
        assert_eq!(remote.avg_speed_kmh, local.avg_speed_kmh);
        assert_eq!(remote.events, task.events);
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let worker = HttpWorker::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        assert_eq!(worker.url(), "http://127.0.0.1:1");
        assert!(!worker.health().await);
        let err = worker.send_task(&sample_task()).await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteWorker { .. }));
        assert_eq!(probe_workers(&[worker]).await, vec![false]);
    }

    #[test]
    fn test_blocking_process_task_outside_runtime() {
        let worker = HttpWorker::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = TaskWorker::process_task(&worker, &sample_task()).unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
