//! REST API Handlers
//!
//! Read-only views of the node's storage plus the health, readiness and
//! Prometheus endpoints. Every mutation goes through the engines, never
//! through HTTP.

use crate::domain::types::{LogicalVolume, NodeCapacity, VolumeGroup};
use crate::error::{Error, ErrorCode};
use crate::events::StorageMetrics;
use crate::storage::LvmEngine;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// =============================================================================
// Response Types
// =============================================================================

/// Volume group detail response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroupResponse {
    #[serde(flatten)]
    pub volume_group: VolumeGroup,
    pub logical_volumes: Vec<LogicalVolume>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::Aborted => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorCode::InvalidArgument | ErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> Response {
    let code = e.code();
    if code == ErrorCode::Internal {
        error!("API request failed: {}", e);
    }
    (
        status_for(code),
        Json(ApiErrorResponse {
            error: code.to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    lvm: Arc<LvmEngine>,
    metrics: Arc<StorageMetrics>,
    capacity: watch::Receiver<NodeCapacity>,
}

impl RestRouter {
    pub fn new(
        lvm: Arc<LvmEngine>,
        metrics: Arc<StorageMetrics>,
        capacity: watch::Receiver<NodeCapacity>,
    ) -> Self {
        Self {
            lvm,
            metrics,
            capacity,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            lvm: self.lvm,
            metrics: self.metrics,
            capacity: self.capacity,
        };

        Router::new()
            .route("/api/v1/volumegroups", get(list_volume_groups))
            .route("/api/v1/volumegroups/:name", get(get_volume_group))
            .route("/api/v1/physicalvolumes", get(list_physical_volumes))
            .route("/api/v1/capacity", get(get_capacity))
            .route("/metrics", get(metrics))
            .route("/healthz", get(health_check))
            .route("/readyz", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[derive(Clone)]
struct AppState {
    lvm: Arc<LvmEngine>,
    metrics: Arc<StorageMetrics>,
    capacity: watch::Receiver<NodeCapacity>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_volume_groups(State(state): State<AppState>) -> Response {
    match state.lvm.get_current_vg_struct().await {
        Ok(vgs) => (StatusCode::OK, Json(vgs)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_volume_group(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    debug!("Getting volume group: {}", name);

    let volume_group = match state.lvm.volume_group(&name).await {
        Ok(vg) => vg,
        Err(e) => return error_response(&e),
    };
    match state.lvm.list_lvs(&name).await {
        Ok(logical_volumes) => (
            StatusCode::OK,
            Json(VolumeGroupResponse {
                volume_group,
                logical_volumes,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_physical_volumes(State(state): State<AppState>) -> Response {
    match state.lvm.get_current_pv_struct().await {
        Ok(pvs) => (StatusCode::OK, Json(pvs)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Last capacity the publisher pushed
async fn get_capacity(State(state): State<AppState>) -> Response {
    let capacity = state.capacity.borrow().clone();
    (StatusCode::OK, Json(capacity)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready once capacity has been published at least once
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.capacity.borrow().node_name.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "capacity not yet published")
    } else {
        (StatusCode::OK, "ready")
    }
}
