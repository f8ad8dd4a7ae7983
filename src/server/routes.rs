//! Experiment routes.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::ApiResult;
use crate::experiment::Experiment;
use crate::logs::{Cursor, LogStore, PartitionSummary};
use crate::orchestrator::Orchestrator;
use crate::runner::{Engine, LaunchRequest};
use crate::stream::StreamMessage;
use crate::validate::PartitionName;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Query for the stored experiment listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Maximum number of experiments to return
    pub limit: Option<usize>,
}

/// Query for the discrete log endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// RFC 3339 cursor; only entries strictly after it are returned
    pub since: Option<String>,
    /// Page size
    pub limit: Option<usize>,
}

/// Query for the streaming endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// RFC 3339 cursor to resume after
    pub since: Option<String>,
}

/// Stored experiment listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredExperimentsResponse {
    /// Experiments, most recent first
    pub experiments: Vec<PartitionSummary>,
}

/// Registry listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveExperimentsResponse {
    /// Experiments known to this process
    pub experiments: Vec<Experiment>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy`
    pub status: String,
}

type AppState<S, E> = State<Arc<Orchestrator<S, E>>>;

// ============================================================================
// Handlers
// ============================================================================

pub(crate) async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

pub(crate) async fn launch<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<impl IntoResponse> {
    tracing::info!(experiment = ?request.experiment_name, "Launch requested");
    let experiment = state.launch(request).await?;
    Ok((StatusCode::OK, Json(experiment)))
}

pub(crate) async fn list_stored<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let experiments = state.list_stored(query.limit).await?;
    Ok(Json(StoredExperimentsResponse { experiments }))
}

pub(crate) async fn list_active<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
) -> impl IntoResponse {
    Json(ActiveExperimentsResponse {
        experiments: state.list_active(),
    })
}

pub(crate) async fn status<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.status(&name)?))
}

pub(crate) async fn logs<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let since = Cursor::parse_optional(query.since.as_deref())?;
    let page = state.logs(&name, since, query.limit).await?;
    Ok(Json(page))
}

pub(crate) async fn settings<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
) -> impl IntoResponse {
    Json(state.settings())
}

/// Streaming endpoint. The name and cursor are validated before the upgrade
/// so malformed requests get a plain 400 instead of a socket.
pub(crate) async fn logs_ws<S: LogStore, E: Engine>(
    State(state): AppState<S, E>,
    Path(name): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let since = Cursor::parse_optional(query.since.as_deref())?;
    let partition = PartitionName::new(name)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let messages = state.subscribe(partition.as_str(), since)?;
    tracing::debug!(experiment = %partition, "Stream subscription accepted");
    Ok(ws.on_upgrade(move |socket| forward(socket, messages)))
}

/// Pump session messages into the socket until either side ends.
async fn forward(socket: WebSocket, mut messages: mpsc::Receiver<StreamMessage>) {
    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to encode stream message");
                        break;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
