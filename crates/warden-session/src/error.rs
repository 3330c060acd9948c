//! Session error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Access token cannot be empty")]
    EmptyAccessToken,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] warden_storage::StorageError),

    #[error("Malformed persisted session: {0}")]
    MalformedPersistedState(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
