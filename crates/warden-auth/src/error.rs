//! Authentication error types

use thiserror::Error;

use crate::coordinator::RefreshFailure;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Session expired: {0}")]
    RefreshExpired(RefreshFailure),

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request body cannot be replayed")]
    NotReplayable,

    #[error("Session error: {0}")]
    Session(#[from] warden_session::SessionError),
}

impl AuthError {
    /// Whether the caller should be sent back to a login prompt.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::Unauthenticated | AuthError::InvalidCredentials(_) | AuthError::RefreshExpired(_)
        )
    }
}
