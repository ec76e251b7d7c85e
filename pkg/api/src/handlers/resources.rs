use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::Value;

use pkg_state::ResourceStore;
use pkg_types::Resource;

use crate::{ApiError, AppState};

async fn list_values<T: Resource>(store: &ResourceStore<T>) -> Result<Vec<Value>, ApiError> {
    store
        .list()
        .await?
        .iter()
        .map(|obj| serde_json::to_value(obj).map_err(|e| ApiError::Store(e.into())))
        .collect()
}

async fn get_value<T: Resource>(store: &ResourceStore<T>, uid: &str) -> Result<Value, ApiError> {
    match store.get(uid).await? {
        Some(obj) => serde_json::to_value(&obj).map_err(|e| ApiError::Store(e.into())),
        None => Err(ApiError::Store(pkg_state::StoreError::NotFound {
            kind: T::KIND.to_string(),
            uid: uid.to_string(),
        })),
    }
}

/// GET /api/v1/{kind}
pub async fn list_resources(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let items = with_store!(state.ctx.stores, &kind, |store| list_values(store).await)?;
    Ok(Json(items))
}

/// GET /api/v1/{kind}/{uid}
pub async fn get_resource(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let item = with_store!(state.ctx.stores, &kind, |store| get_value(store, &uid).await)?;
    Ok(Json(item))
}
