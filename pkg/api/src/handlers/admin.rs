use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use pkg_types::network::LogicalNetwork;
use pkg_types::pod::Pod;
use pkg_types::port::LogicalPort;

use crate::{ApiError, AppState};

/// POST /api/v1/admin/networks
pub async fn create_network(
    State(state): State<AppState>,
    Json(network): Json<LogicalNetwork>,
) -> Result<impl IntoResponse, ApiError> {
    let network = state.admin.create_network(network).await?;
    Ok((StatusCode::CREATED, Json(network)))
}

/// DELETE /api/v1/admin/networks/{id} : refused while ports are attached.
pub async fn remove_network(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let network = state.admin.remove_network(&network_id).await?;
    info!("Admin removed network {}", network.network_id);
    Ok(Json(network))
}

/// POST /api/v1/admin/ports
pub async fn create_port(
    State(state): State<AppState>,
    Json(port): Json<LogicalPort>,
) -> Result<impl IntoResponse, ApiError> {
    let port = state.admin.create_port(port).await?;
    Ok((StatusCode::CREATED, Json(port)))
}

/// DELETE /api/v1/admin/ports/{id}
pub async fn remove_port(
    State(state): State<AppState>,
    Path(port_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.remove_port(&port_id).await?))
}

/// POST /api/v1/admin/pods : the pod's namespace must exist.
pub async fn create_pod(
    State(state): State<AppState>,
    Json(pod): Json<Pod>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = state.admin.create_pod(pod).await?;
    Ok((StatusCode::CREATED, Json(pod)))
}

/// DELETE /api/v1/admin/namespaces/{id} : refused while pods live in it.
pub async fn remove_namespace(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ns = state.admin.remove_namespace(&uid).await?;
    info!("Admin removed namespace {}", ns.name);
    Ok(Json(ns))
}
