//! REST API endpoints using Axum

use crate::export::tags_to_csv;
use crate::types::*;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use ualink_controller::Controller;
use ualink_core::error::{BrowseError, UalinkError};
use ualink_core::types::TagExportRecord;
use ualink_hub::{ClientId, Hub};

pub const NOT_CONNECTED: &str = "OPC UA connection is not active";

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
    pub hub: Hub,
    /// Peer address of each WebSocket client, when known
    pub remotes: Arc<DashMap<ClientId, SocketAddr>>,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(controller: Arc<Controller>, hub: Hub) -> Self {
        Self {
            controller,
            hub,
            remotes: Arc::new(DashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn require_connection(&self) -> Result<(), ApiError> {
        if self.controller.is_connected() {
            Ok(())
        } else {
            Err(ApiError::Unavailable(NOT_CONNECTED.to_string()))
        }
    }
}

// ============================================================================
// Router Setup
// ============================================================================

pub fn create_rest_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/read", post(read_node))
        .route("/api/v1/write", post(write_node))
        .route("/api/v1/export/tags", get(export_all_tags))
        .route("/api/v1/export/tags/folder", get(export_folder_tags))
        .route("/api/v1/ws/clients", get(list_ws_clients))
        .with_state(state)
}

// ============================================================================
// Status
// ============================================================================

/// GET /health
async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        connected: state.controller.is_connected(),
        state: state.controller.state().to_string(),
        endpoint: state.controller.endpoint(),
        ws_clients: state.hub.client_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}

/// GET /api/v1/ws/clients
async fn list_ws_clients(State(state): State<ApiState>) -> Json<Vec<WsClientInfo>> {
    let clients = state
        .hub
        .clients()
        .await
        .into_iter()
        .map(|client| WsClientInfo {
            id: client.id,
            remote_addr: state.remotes.get(&client.id).map(|addr| *addr),
            subscribe_all: client.subscribe_all,
            subscriptions: client.subscriptions,
        })
        .collect();
    Json(clients)
}

// ============================================================================
// Read / Write
// ============================================================================

/// POST /api/v1/read
async fn read_node(
    State(state): State<ApiState>,
    body: Result<Json<ReadRequest>, JsonRejection>,
) -> Result<Json<ualink_core::types::NodeAttributes>, ApiError> {
    state.require_connection()?;
    let Json(request) = body?;
    let node_id = required(&request.node_id, "node_id")?;

    let attributes = state.controller.read_node_attributes(node_id).await?;
    Ok(Json(attributes))
}

/// POST /api/v1/write
///
/// Accepted as soon as the write is queued; the outcome is only logged.
async fn write_node(
    State(state): State<ApiState>,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<WriteAccepted>), ApiError> {
    state.require_connection()?;
    let Json(request) = body?;
    let node_id = required(&request.node_id, "node_id")?;

    state
        .controller
        .write_value(node_id, &request.data_type, &request.value)?;
    Ok((StatusCode::ACCEPTED, Json(WriteAccepted::sent())))
}

// ============================================================================
// Export
// ============================================================================

/// GET /api/v1/export/tags?format=json|csv
async fn export_all_tags(
    State(state): State<ApiState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    state.require_connection()?;
    let format = ExportFormat::parse(query.format.as_deref());

    let records = state.controller.collect_variable_nodes("", true).await?;
    info!(count = records.len(), "Exported all tags");
    render_tags(records, format, "tags_all.csv")
}

/// GET /api/v1/export/tags/folder?node_id=..&recursive=..&format=..
async fn export_folder_tags(
    State(state): State<ApiState>,
    Query(query): Query<FolderExportQuery>,
) -> Result<Response, ApiError> {
    state.require_connection()?;
    let node_id = required(query.node_id.as_deref().unwrap_or_default(), "node_id")?;
    let format = ExportFormat::parse(query.format.as_deref());

    let records = state
        .controller
        .collect_variable_nodes(node_id, query.is_recursive())
        .await?;
    info!(node_id, count = records.len(), "Exported folder tags");
    render_tags(records, format, "tags_folder.csv")
}

fn render_tags(records: Vec<TagExportRecord>, format: ExportFormat, filename: &str) -> Result<Response, ApiError> {
    match format {
        ExportFormat::Json => Ok(Json(records).into_response()),
        ExportFormat::Csv => {
            let body = tags_to_csv(&records).map_err(|e| ApiError::InternalError(e.to_string()))?;
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename={}", filename),
                    ),
                ],
                body,
            )
                .into_response())
        }
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(trimmed)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<UalinkError> for ApiError {
    fn from(error: UalinkError) -> Self {
        if error.is_not_connected() {
            ApiError::Unavailable(NOT_CONNECTED.to_string())
        } else {
            ApiError::InternalError(error.to_string())
        }
    }
}

impl From<BrowseError> for ApiError {
    fn from(error: BrowseError) -> Self {
        UalinkError::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        if status.is_client_error() {
            warn!(status = %status, error = %message, "Rejected request");
        }
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}
