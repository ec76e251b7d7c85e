use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

use pkg_network::IpamError;
use pkg_state::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("unknown resource kind {0}")]
    UnknownKind(String),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::AlreadyExists { .. } | StoreError::InUse { .. } => StatusCode::CONFLICT,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Codec(_) | StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) | ApiError::Ipam(IpamError::Store(e)) => store_status(e),
            ApiError::Ipam(IpamError::Exhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Ipam(IpamError::OutOfRange { .. }) => StatusCode::BAD_REQUEST,
            ApiError::UnknownKind(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("API request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let exists = ApiError::from(StoreError::AlreadyExists {
            kind: "pods".into(),
            uid: "p1".into(),
        });
        assert_eq!(exists.status(), StatusCode::CONFLICT);

        let in_use = ApiError::from(StoreError::InUse {
            kind: "networks".into(),
            uid: "n1".into(),
            reason: "1 port(s) attached".into(),
        });
        assert_eq!(in_use.status(), StatusCode::CONFLICT);

        let missing = ApiError::from(IpamError::Store(StoreError::NotFound {
            kind: "ipam".into(),
            uid: "x".into(),
        }));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let exhausted = ApiError::from(IpamError::Exhausted("n1".into()));
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);

        let backend = ApiError::from(StoreError::Backend(anyhow::anyhow!("disk gone")));
        assert_eq!(backend.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
