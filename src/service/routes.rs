//! Axum routes for the reassembly service.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::batch::{BatchError, BatchProgress};
use crate::engine::{
    CollectionContent, CollectionSummary, DeleteReport, EngineError, RefreshOutcome,
};
use crate::mapping::MappingStats;
use crate::reconstructor::ReconstructionError;
use crate::store::InMemoryCollectionStore;
use crate::types::{
    BatchReport, CollectionDescriptor, CollectionId, GroupDiagnostic, ReconstructedFile,
};
use crate::REASSEMBLY_SCHEMA_VERSION;

use super::middleware::{record_batch_metrics, record_reconstruction_metrics};
use super::state::ServiceState;

/// Type alias for the service state over the snapshot-backed store.
pub type AppState = ServiceState<InMemoryCollectionStore>;

type ApiError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to run a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Worker count; the configured default when absent.
    pub concurrency: Option<usize>,
}

/// Request to refresh the mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// Run even if the mapping is still fresh.
    #[serde(default)]
    pub force: bool,
}

/// Query parameters of the reconstruction endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconstructQuery {
    /// Reuse a cached reconstruction while the mapping is unchanged.
    #[serde(default)]
    pub reuse: bool,
}

/// Response of the cancel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether a running batch was signalled.
    pub cancelled: bool,
}

/// Progress with a human-readable line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    /// Counters.
    #[serde(flatten)]
    pub progress: BatchProgress,
    /// Status line.
    pub status: String,
}

/// Known filenames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    /// Filenames, sorted.
    pub filenames: Vec<String>,
    /// Mapping summary.
    pub stats: MappingStats,
}

/// Collections mapped to one filename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResponse {
    /// Filename.
    pub filename: String,
    /// Collection ids.
    pub collections: BTreeSet<CollectionId>,
}

/// One candidate of an ambiguous file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDto {
    /// Collections producing this content.
    pub collection_ids: BTreeSet<CollectionId>,
    /// SHA-256 of the content.
    pub digest: String,
    /// Content length in bytes.
    pub bytes: usize,
}

/// Serializable reconstruction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedFileDto {
    /// Filename.
    pub filename: String,
    /// Content as text (lossy for non-UTF-8 content).
    pub content: String,
    /// Content length in bytes.
    pub bytes: usize,
    /// Whether a complete group existed.
    pub complete: bool,
    /// Missing indices of the best group when incomplete.
    pub missing_indices: Vec<u32>,
    /// Contributing collections.
    pub source_collections: BTreeSet<CollectionId>,
    /// Distinct candidates when complete copies disagree.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateDto>,
    /// Groups that did not contribute complete content.
    pub diagnostics: Vec<GroupDiagnostic>,
}

impl From<ReconstructedFile> for ReconstructedFileDto {
    fn from(file: ReconstructedFile) -> Self {
        let candidates = file
            .ambiguity
            .map(|a| {
                a.candidates
                    .into_iter()
                    .map(|c| CandidateDto {
                        bytes: c.content.len(),
                        collection_ids: c.collection_ids,
                        digest: c.digest,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            content: String::from_utf8_lossy(&file.content).into_owned(),
            bytes: file.content.len(),
            filename: file.filename,
            complete: file.complete,
            missing_indices: file.missing_indices,
            source_collections: file.source_collections,
            candidates,
            diagnostics: file.diagnostics,
        }
    }
}

/// Whole content of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionContentDto {
    /// Collection id.
    pub id: CollectionId,
    /// Filenames joined into the content.
    pub filenames: Vec<String>,
    /// Chunks joined.
    pub chunk_count: usize,
    /// Content as text (lossy for non-UTF-8 content).
    pub content: String,
    /// Content length in bytes.
    pub bytes: usize,
}

impl From<CollectionContent> for CollectionContentDto {
    fn from(c: CollectionContent) -> Self {
        Self {
            content: String::from_utf8_lossy(&c.content).into_owned(),
            bytes: c.content.len(),
            id: c.id,
            filenames: c.filenames,
            chunk_count: c.chunk_count,
        }
    }
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` when the store answers, `degraded` otherwise.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Schema version of serialized reports.
    pub schema_version: String,
    /// Service start time, RFC 3339.
    pub started_at: String,
    /// Mapping index summary.
    pub mapping: MappingStats,
    /// Progress of the current or last batch.
    pub batch: BatchProgress,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    /// Always `alive`.
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Whether the service can take requests.
    pub ready: bool,
    /// Whether the store answered a listing call.
    pub store: bool,
    /// Reason when not ready.
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(code = %self.code, error = %self.error, "Request error");
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

fn batch_error(e: BatchError) -> ApiError {
    let (status, code) = match &e {
        BatchError::InvalidConcurrency => (StatusCode::BAD_REQUEST, "INVALID_CONCURRENCY"),
        BatchError::AlreadyRunning => (StatusCode::CONFLICT, "BATCH_RUNNING"),
        BatchError::EnumerationAborted { .. } => (StatusCode::BAD_GATEWAY, "ENUMERATION_ABORTED"),
        BatchError::TaskFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BATCH_FAILED"),
    };
    let mut body = ErrorResponse::new(code, e.to_string());
    if let BatchError::EnumerationAborted { partial, .. } = &e {
        body = body.with_details(format!("{} collections processed before the failure", partial.total));
    }
    (status, Json(body))
}

fn reconstruction_error(e: ReconstructionError) -> ApiError {
    let (status, code) = match &e {
        ReconstructionError::UnknownFilename { .. } => (StatusCode::NOT_FOUND, "UNKNOWN_FILENAME"),
        ReconstructionError::NoChunksFound { .. } => (StatusCode::NOT_FOUND, "NO_CHUNKS_FOUND"),
        ReconstructionError::Store { .. } => (StatusCode::BAD_GATEWAY, "STORE_ERROR"),
        ReconstructionError::DuplicateChunk { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "DUPLICATE_CHUNK"),
        ReconstructionError::StructuralMismatch { .. } | ReconstructionError::IndexOutOfRange { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "STRUCTURAL_MISMATCH")
        }
        ReconstructionError::HashMismatch { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "HASH_MISMATCH"),
        ReconstructionError::Incomplete { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INCOMPLETE"),
    };
    (status, Json(ErrorResponse::new(code, e.to_string())))
}

fn engine_error(e: EngineError) -> ApiError {
    let (status, code) = match &e {
        EngineError::UnknownFilename(_) => (StatusCode::NOT_FOUND, "UNKNOWN_FILENAME"),
        EngineError::EmptyCollection(_) => (StatusCode::NOT_FOUND, "EMPTY_COLLECTION"),
        EngineError::Store(crate::store::StoreError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "COLLECTION_NOT_FOUND")
        }
        EngineError::Store(_) | EngineError::Enumeration(_) => (StatusCode::BAD_GATEWAY, "STORE_ERROR"),
        EngineError::Batch(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BATCH_FAILED"),
    };
    (status, Json(ErrorResponse::new(code, e.to_string())))
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Run a batch over every collection.
async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    let concurrency = request
        .concurrency
        .unwrap_or(state.engine.config().batch.concurrency);
    let active = state
        .begin_batch()
        .ok_or_else(|| batch_error(BatchError::AlreadyRunning))?;
    let result = state.engine.run_batch_with_cancel(concurrency, active.signal()).await;
    drop(active);

    let report = result.map_err(batch_error)?;
    record_batch_metrics(&report);
    Ok(Json(report))
}

/// Cancel the running batch.
async fn cancel_batch_handler(State(state): State<Arc<AppState>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.cancel_batch(),
    })
}

/// Rebuild the mapping unless still fresh.
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshOutcome>, ApiError> {
    let active = state
        .begin_batch()
        .ok_or_else(|| batch_error(BatchError::AlreadyRunning))?;
    let outcome = state
        .engine
        .refresh_mapping_with_cancel(request.force, active.signal())
        .await
        .map_err(batch_error)?;
    drop(active);
    if let RefreshOutcome::Refreshed { report } = &outcome {
        record_batch_metrics(report);
    }
    Ok(Json(outcome))
}

/// Progress of the current or last batch.
async fn progress_handler(State(state): State<Arc<AppState>>) -> Json<ProgressResponse> {
    let progress = state.engine.progress();
    Json(ProgressResponse {
        status: progress.status_line(),
        progress,
    })
}

/// Known filenames.
async fn list_files_handler(State(state): State<Arc<AppState>>) -> Json<FileListResponse> {
    Json(FileListResponse {
        filenames: state.engine.list_filenames(),
        stats: state.engine.mapping_stats(),
    })
}

/// Reconstruct a file.
async fn reconstruct_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    Query(query): Query<ReconstructQuery>,
) -> Result<Json<ReconstructedFileDto>, ApiError> {
    let start = Instant::now();
    let result = if query.reuse {
        state.engine.reconstruct_file_reusing(&filename).await
    } else {
        state.engine.reconstruct_file(&filename).await
    };
    let file = result.map_err(reconstruction_error)?;
    record_reconstruction_metrics(&file, start.elapsed().as_millis() as u64);
    Ok(Json(file.into()))
}

/// Collections mapped to a file.
async fn mapping_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Json<MappingResponse> {
    Json(MappingResponse {
        collections: state.engine.lookup_mapping(&filename),
        filename,
    })
}

/// Delete every collection mapped to a file.
async fn delete_file_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Json<DeleteReport>, ApiError> {
    state.engine.delete_file(&filename).await.map(Json).map_err(engine_error)
}

/// List collections.
async fn list_collections_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CollectionDescriptor>>, ApiError> {
    state
        .engine
        .list_collections()
        .await
        .map(Json)
        .map_err(|e| engine_error(e.into()))
}

/// Inspect a collection.
async fn describe_collection_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CollectionSummary>, ApiError> {
    state
        .engine
        .describe_collection(&CollectionId::new(id))
        .await
        .map(Json)
        .map_err(engine_error)
}

/// Join every chunk of a collection.
async fn collection_content_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CollectionContentDto>, ApiError> {
    state
        .engine
        .reconstruct_collection(&CollectionId::new(id))
        .await
        .map(|c| Json(c.into()))
        .map_err(engine_error)
}

/// Health check endpoint (detailed).
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ready = store_reachable(&state).await;
    Json(HealthResponse {
        status: if ready { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: REASSEMBLY_SCHEMA_VERSION.to_string(),
        started_at: state.started_at().to_rfc3339(),
        mapping: state.engine.mapping_stats(),
        batch: state.engine.progress(),
    })
}

/// Liveness probe endpoint.
///
/// Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint.
///
/// Returns 200 if the store answers a listing call, 503 otherwise.
async fn readiness_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if store_reachable(&state).await {
        Ok(Json(ReadinessResponse {
            ready: true,
            store: true,
            details: None,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                store: false,
                details: Some("Store unreachable".to_string()),
            }),
        ))
    }
}

async fn store_reachable(state: &AppState) -> bool {
    use crate::store::CollectionStore;
    state.engine.store().list_collections(None, 1).await.is_ok()
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the reassembly service.
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Batch processing
        .route("/api/batch", post(batch_handler))
        .route("/api/batch/cancel", post(cancel_batch_handler))
        .route("/api/mapping/refresh", post(refresh_handler))
        .route("/api/progress", get(progress_handler))
        // Files
        .route("/api/files", get(list_files_handler))
        .route("/api/files/:filename", get(reconstruct_handler).delete(delete_file_handler))
        .route("/api/files/:filename/collections", get(mapping_handler))
        // Collections
        .route("/api/collections", get(list_collections_handler))
        .route("/api/collections/:id", get(describe_collection_handler))
        .route("/api/collections/:id/content", get(collection_content_handler))
        // Health checks
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, ReassemblyEngine};
    use crate::types::Chunk;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = InMemoryCollectionStore::new();
        store.insert_chunk(&Chunk::new("C1", "a.txt", 0, 2, b"hello ".to_vec()));
        store.insert_chunk(&Chunk::new("C1", "a.txt", 1, 2, b"world".to_vec()));
        create_router(ServiceState::new(ReassemblyEngine::new(
            Arc::new(store),
            EngineConfig::default(),
        )))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_batch_then_reconstruct() {
        let app = app();

        let (status, report) = send(&app, "POST", "/api/batch", r#"{"concurrency": 2}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["completed"], 1);

        let (status, file) = send(&app, "GET", "/api/files/a.txt", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["content"], "hello world");
        assert_eq!(file["complete"], true);
    }

    #[tokio::test]
    async fn test_unknown_file_is_404() {
        let (status, body) = send(&app(), "GET", "/api/files/missing.txt", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_FILENAME");
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let (status, body) = send(&app(), "POST", "/api/batch", r#"{"concurrency": 0}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_CONCURRENCY");
    }

    #[tokio::test]
    async fn test_collection_content() {
        let app = app();
        let (status, body) = send(&app, "GET", "/api/collections/C1/content", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "hello world");
        assert_eq!(body["chunk_count"], 2);

        let (status, body) = send(&app, "GET", "/api/collections/nope/content", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "COLLECTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_concurrent_batch_keeps_cancel_on_the_running_one() {
        let store = InMemoryCollectionStore::new().with_latency(std::time::Duration::from_millis(50));
        for i in 0..20 {
            store.insert_chunk(&Chunk::new(format!("C{i:02}"), format!("f{i}.txt"), 0, 1, b"x".to_vec()));
        }
        let app = create_router(ServiceState::new(ReassemblyEngine::new(
            Arc::new(store),
            EngineConfig::default(),
        )));

        let running = {
            let app = app.clone();
            tokio::spawn(async move { send(&app, "POST", "/api/batch", r#"{"concurrency": 1}"#).await })
        };
        for _ in 0..200 {
            let (_, progress) = send(&app, "GET", "/api/progress", "").await;
            if progress["running"] == true {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let (status, body) = send(&app, "POST", "/api/batch", "{}").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "BATCH_RUNNING");

        let (_, refresh) = send(&app, "POST", "/api/mapping/refresh", r#"{"force": true}"#).await;
        assert_eq!(refresh["code"], "BATCH_RUNNING");

        let (_, cancel) = send(&app, "POST", "/api/batch/cancel", "").await;
        assert_eq!(cancel["cancelled"], true);

        let (status, report) = running.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["cancelled"], true);
        assert_eq!(report["total"], 20);

        let (_, cancel) = send(&app, "POST", "/api/batch/cancel", "").await;
        assert_eq!(cancel["cancelled"], false);
    }

    #[tokio::test]
    async fn test_readiness() {
        let (status, body) = send(&app(), "GET", "/health/ready", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }
}
