use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub network_id: String,
    pub available: usize,
    pub allocated: Vec<Ipv4Addr>,
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub ip: Ipv4Addr,
}

/// GET /api/v1/ipam/{network}
pub async fn pool(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ipam = &state.ctx.ipam;
    let summary = PoolSummary {
        available: ipam.available_ips(&network_id).await?.len(),
        allocated: ipam.allocated_ips(&network_id).await?.into_iter().collect(),
        network_id,
    };
    Ok(Json(summary))
}

/// POST /api/v1/ipam/{network}/allocate
pub async fn allocate(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ip = state.ctx.ipam.allocate_ip(&network_id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ip": ip }))))
}

/// POST /api/v1/ipam/{network}/reserve
pub async fn reserve(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.ctx.ipam.reserve_ip(&network_id, req.ip).await?;
    Ok(Json(json!({ "ip": req.ip })))
}

/// POST /api/v1/ipam/{network}/release
pub async fn release(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if state.ctx.ipam.release_ip(&network_id, req.ip).await? {
        Ok((StatusCode::OK, Json(json!({ "ip": req.ip }))))
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} is not allocated in {}", req.ip, network_id) })),
        ))
    }
}
