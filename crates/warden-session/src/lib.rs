//! Warden Session Management
//!
//! - A Session holds the access/refresh credentials and the signed-in identity
//! - Every transition is committed atomically and written through to storage
//! - Subscribers are notified once per transition, after it is committed
//! - Open contexts sharing one storage converge on the same session

mod credential;
mod error;
mod identity;
mod persistence;
mod session;
mod store;
mod sync;

pub use credential::fingerprint;
pub use error::SessionError;
pub use identity::{Identity, RoleRef};
pub use persistence::{PersistenceAdapter, SESSION_KEY, SNAPSHOT_VERSION};
pub use session::{AuthState, Session};
pub use store::{SessionEvent, SessionStore, SubscriptionId, Transition};
pub use sync::{CrossContextSync, SyncHandle, SyncMessage};

pub type Result<T> = std::result::Result<T, SessionError>;
