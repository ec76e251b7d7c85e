#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {uid} already exists")]
    AlreadyExists { kind: String, uid: String },

    #[error("{kind} {uid} not found")]
    NotFound { kind: String, uid: String },

    /// Removal blocked because other resources still reference the target.
    #[error("{kind} {uid} is in use: {reason}")]
    InUse {
        kind: String,
        uid: String,
        reason: String,
    },

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("state backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
