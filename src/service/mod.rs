//! Reassembly REST Service
//!
//! Exposes the reassembly engine as a JSON API.
//!
//! ## Endpoints
//!
//! - `POST /api/batch` - Run a batch over every collection
//! - `POST /api/batch/cancel` - Cancel the running batch
//! - `POST /api/mapping/refresh` - Rebuild the mapping unless still fresh
//! - `GET /api/progress` - Progress of the current or last batch
//! - `GET /api/files` - Known filenames and mapping stats
//! - `GET /api/files/:filename` - Reconstruct a file
//! - `GET /api/files/:filename/collections` - Collections mapped to a file
//! - `DELETE /api/files/:filename` - Delete every collection mapped to a file
//! - `GET /api/collections` - List collections
//! - `GET /api/collections/:id` - Inspect a collection
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_batch_metrics, record_reconstruction_metrics};
pub use routes::{create_router, AppState};
pub use state::ServiceState;
