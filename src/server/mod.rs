//! HTTP and WebSocket surface
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | `GET` | `/health` | liveness |
//! | `POST` | `/api/experiments` | launch |
//! | `GET` | `/api/experiments?limit=` | stored experiments |
//! | `GET` | `/api/experiments/active` | registry snapshot |
//! | `GET` | `/api/experiments/:name/status` | status query |
//! | `GET` | `/api/experiments/:name/logs?since=&limit=` | discrete log query |
//! | `GET` | `/api/experiments/:name/logs/ws?since=` | streaming subscription |
//! | `GET` | `/api/settings` | effective defaults |

mod error;
mod routes;

pub use error::{ApiError, ApiErrorBody, ApiResult};
pub use routes::{
    ActiveExperimentsResponse, HealthResponse, ListQuery, LogsQuery, StoredExperimentsResponse,
    StreamQuery,
};

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::logs::LogStore;
use crate::orchestrator::Orchestrator;
use crate::runner::Engine;
use crate::{Error, Result};

/// Build the router over a shared orchestrator.
pub fn router<S: LogStore, E: Engine>(orchestrator: Arc<Orchestrator<S, E>>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/experiments",
            get(routes::list_stored::<S, E>).post(routes::launch::<S, E>),
        )
        .route("/api/experiments/active", get(routes::list_active::<S, E>))
        .route("/api/experiments/:name/status", get(routes::status::<S, E>))
        .route("/api/experiments/:name/logs", get(routes::logs::<S, E>))
        .route("/api/experiments/:name/logs/ws", get(routes::logs_ws::<S, E>))
        .route("/api/settings", get(routes::settings::<S, E>))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Bind `addr` and serve until Ctrl-C, then abort running engines.
///
/// # Errors
///
/// Returns [`Error::Io`] if the address cannot be bound or the server fails.
pub async fn serve<S: LogStore, E: Engine>(
    orchestrator: Arc<Orchestrator<S, E>>,
    addr: &str,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting labrelay server");

    axum::serve(listener, router(Arc::clone(&orchestrator)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Other(format!("server error: {e}")))?;

    orchestrator.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
