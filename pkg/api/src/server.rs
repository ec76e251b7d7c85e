use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{admin, cluster, ipam, resources, watch};
use crate::request_id::request_id_middleware;

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Upstream watch ingestion
        .route("/api/v1/watch/{kind}", post(watch::ingest_event))
        // Leadership and maintenance
        .route("/api/v1/leader", get(cluster::leader))
        .route("/api/v1/resync", post(cluster::resync))
        // IPAM
        .route("/api/v1/ipam/{network}", get(ipam::pool))
        .route("/api/v1/ipam/{network}/allocate", post(ipam::allocate))
        .route("/api/v1/ipam/{network}/reserve", post(ipam::reserve))
        .route("/api/v1/ipam/{network}/release", post(ipam::release))
        // Admin (guarded creation and InUse-checked removal)
        .route("/api/v1/admin/networks", post(admin::create_network))
        .route("/api/v1/admin/networks/{id}", delete(admin::remove_network))
        .route("/api/v1/admin/ports", post(admin::create_port))
        .route("/api/v1/admin/ports/{id}", delete(admin::remove_port))
        .route("/api/v1/admin/pods", post(admin::create_pod))
        .route("/api/v1/admin/namespaces/{id}", delete(admin::remove_namespace))
        // Read-only views
        .route("/api/v1/{kind}", get(resources::list_resources))
        .route("/api/v1/{kind}/{uid}", get(resources::get_resource))
        .layer(middleware::from_fn(request_id_middleware));

    Router::new()
        .route("/healthz", get(cluster::healthz))
        .merge(api_routes)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    info!("Starting API server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
