//! Warden Core
//!
//! Entry point for applications: loads configuration, opens the shared session
//! storage and hands out one `SessionContext` per open window or view.

mod config;
mod context;
mod error;

pub use config::Config;
pub use context::{SessionContext, Warden};
pub use error::CoreError;

// Re-export core components
pub use warden_auth::{AuthBackend, AuthClient, AuthError, HttpAuthBackend, RefreshFailure};
pub use warden_session::{
    AuthState, Identity, RoleRef, Session, SessionError, SessionEvent, SessionStore, Transition,
};
pub use warden_storage::{ContextId, Database, KeyValueStore, MemoryStore, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
