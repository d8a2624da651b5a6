//! Service middleware for request tracking.
//!
//! ## Metrics Logged
//!
//! - `request` - path pattern, method, status and latency of every request
//! - `batch` - outcome counts and duration of every batch run
//! - `reconstruction` - size and state of every reconstruction

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

use crate::types::{BatchReport, ReconstructedFile};

/// Metrics middleware that records request counts and latency.
///
/// Uses tracing; metrics are aggregated from the logs.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "reassembly::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Filenames and collection ids are replaced with placeholders.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let normalized: Vec<&str> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| match (i.checked_sub(1).map(|p| segments[p]), i) {
            (Some("files"), 3) => ":filename",
            (Some("collections"), 3) => ":id",
            _ => *segment,
        })
        .collect();
    normalized.join("/")
}

/// Record batch run metrics.
pub fn record_batch_metrics(report: &BatchReport) {
    info!(
        target: "reassembly::metrics",
        metric_type = "batch",
        total = report.total,
        completed = report.completed,
        failed = report.failed,
        skipped = report.skipped,
        cancelled = report.cancelled,
        duration_ms = report.duration_ms(),
        "batch_metric"
    );
}

/// Record reconstruction metrics.
pub fn record_reconstruction_metrics(file: &ReconstructedFile, latency_ms: u64) {
    info!(
        target: "reassembly::metrics",
        metric_type = "reconstruction",
        bytes = file.content.len(),
        complete = file.complete,
        ambiguous = file.is_ambiguous(),
        collections = file.source_collections.len(),
        latency_ms = latency_ms,
        "reconstruction_metric"
    );
}
