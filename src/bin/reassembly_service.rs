//! Reassembly Service Binary
//!
//! Serves the reassembly engine over HTTP from a JSON store snapshot:
//! - Structured JSON logging
//! - Request tracing with correlation IDs
//! - Graceful shutdown handling (cancels a running batch)
//! - Health check endpoints
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REASSEMBLY_SNAPSHOT_PATH`: JSON store snapshot to serve (empty store when unset)
//! - `REASSEMBLY_REFRESH_ON_START`: build the mapping before serving (default: true)
//! - `PORT`: Service port (default: 8002)
//! - `HOST`: Service host (default: 0.0.0.0)
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//! - engine settings, see `EngineConfig::from_env`
//!
//! ## Usage
//!
//! ```bash
//! REASSEMBLY_SNAPSHOT_PATH=store.json cargo run --bin reassembly_service --features service
//! ```

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use collection_reassembler::service::{create_router, metrics_middleware, ServiceState};
use collection_reassembler::{InMemoryCollectionStore, RefreshOutcome};

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "reassembly_service=info,collection_reassembler=info,tower_http=info".into()
    });

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .init();
    }
}

/// Request logging middleware that adds correlation ID and timing
async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let trace_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    span.record("status", status);
    span.record("latency_ms", latency.as_millis() as u64);

    info!(
        target: "reassembly_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request completed"
    );

    response
}

fn load_store() -> Result<InMemoryCollectionStore, Box<dyn std::error::Error>> {
    match std::env::var("REASSEMBLY_SNAPSHOT_PATH") {
        Ok(path) if !path.is_empty() => {
            let start = Instant::now();
            let store = InMemoryCollectionStore::load_json(&path)?;
            info!(
                path = %path,
                collections = store.num_collections(),
                latency_ms = start.elapsed().as_millis() as u64,
                "Store snapshot loaded"
            );
            Ok(store)
        }
        _ => {
            warn!("REASSEMBLY_SNAPSHOT_PATH not set, serving an empty store");
            Ok(InMemoryCollectionStore::new())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");

    info!(version = version, build_sha = build_sha, "Starting Reassembly Service");

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8002);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

    let refresh_on_start = std::env::var("REASSEMBLY_REFRESH_ON_START")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);

    let state = ServiceState::from_env(load_store()?);
    info!(
        concurrency = state.engine.config().batch.concurrency,
        mapping_ttl_secs = state.engine.config().mapping_ttl.as_secs(),
        "Engine configured"
    );

    if refresh_on_start {
        match state.engine.refresh_mapping(true).await {
            Ok(RefreshOutcome::Refreshed { report }) => info!(
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                files = state.engine.mapping_stats().files,
                "Initial mapping built"
            ),
            Ok(RefreshOutcome::Cached { .. }) => {}
            Err(e) => warn!(error = %e, "Initial mapping refresh failed, serving without it"),
        }
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let shutdown_state = state.clone();
    let app = create_router(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(address = %addr, version = version, "Reassembly Service listening");

    let listener = TcpListener::bind(addr).await?;

    info!("Ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            if shutdown_state.cancel_batch() {
                info!("Cancelled running batch");
            }
        })
        .await?;

    info!("Reassembly Service shutdown complete");

    Ok(())
}
