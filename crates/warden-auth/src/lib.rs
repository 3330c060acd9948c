//! Warden Authentication
//!
//! - Talks to the login, refresh and logout endpoints of the admin API
//! - Renews an expired access token at most once per expiry, however many
//!   requests notice it at the same time
//! - Attaches credentials to outgoing requests and retries a rejected request once

mod backend;
mod client;
mod coordinator;
mod error;

pub use backend::{AuthBackend, HttpAuthBackend, LoginRequest, TokenGrant, UserResponse};
pub use client::AuthClient;
pub use coordinator::{RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use error::AuthError;

pub type Result<T> = std::result::Result<T, AuthError>;
