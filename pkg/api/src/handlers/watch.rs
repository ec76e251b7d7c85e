use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use pkg_state::{ResourceStore, WatchAction};
use pkg_types::Resource;

use crate::{ApiError, AppState};

/// One notification from the upstream watch client.
#[derive(Debug, Deserialize)]
pub struct WatchNotification {
    #[serde(rename = "type")]
    pub action: WatchAction,
    pub object: Value,
}

async fn ingest<T: Resource>(
    store: &ResourceStore<T>,
    action: WatchAction,
    object: Value,
) -> Result<(), ApiError> {
    let obj: T = serde_json::from_value(object).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    debug!("watch {:?} {} {}", action, T::KIND, obj.uid());
    store.apply(action, obj).await?;
    Ok(())
}

/// POST /api/v1/watch/{kind} : apply an ADDED/MODIFIED/DELETED notification.
pub async fn ingest_event(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(notification): Json<WatchNotification>,
) -> Result<impl IntoResponse, ApiError> {
    let WatchNotification { action, object } = notification;
    with_store!(state.ctx.stores, &kind, |store| ingest(store, action, object).await)?;
    Ok(StatusCode::NO_CONTENT)
}
